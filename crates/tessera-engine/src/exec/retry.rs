//! Bounded retry with backoff around node execution.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::TRACING_TARGET;
use crate::error::FailureKind;
use crate::execution::{NodeErrorDetail, NodeResult};
use crate::graph::ExecutionSettings;

/// Retry policy for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    /// Base delay between attempts.
    pub retry_delay: Duration,
    /// Doubles the delay on every retry when set.
    pub exponential_backoff: bool,
    /// Also retry ordinary non-zero exits.
    pub retry_application_errors: bool,
}

impl RetryPolicy {
    /// Derives the policy from a node's execution settings.
    pub fn from_settings(settings: &ExecutionSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            retry_delay: settings.retry_delay,
            exponential_backoff: settings.exponential_backoff,
            retry_application_errors: settings.retry_application_errors,
        }
    }

    /// Returns whether a failure of this kind warrants another attempt.
    ///
    /// Transient system faults (timeout, resource kill, launch failure)
    /// retry by default; an application-level non-zero exit is the
    /// program's own verdict and retries only when the node opted in.
    /// Cancellation never retries.
    pub fn retries(&self, kind: FailureKind) -> bool {
        match kind {
            _ if kind.is_transient() => true,
            FailureKind::ApplicationExit => self.retry_application_errors,
            FailureKind::Cancelled | FailureKind::Interaction => false,
            _ => false,
        }
    }

    /// Delay before the retry following attempt number `attempt` (1-based):
    /// `retry_delay * 2^(attempt-1)` when exponential, else constant.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if self.exponential_backoff {
            let factor = 2u32.saturating_pow(attempt.saturating_sub(1)).min(1 << 16);
            self.retry_delay.saturating_mul(factor)
        } else {
            self.retry_delay
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay: Duration::from_secs(1),
            exponential_backoff: true,
            retry_application_errors: false,
        }
    }
}

/// Final outcome of an attempt sequence.
#[derive(Debug)]
pub struct AttemptSummary {
    /// Attempts actually made.
    pub attempts: u32,
    /// Result of the last attempt that launched, if any.
    pub result: Option<NodeResult>,
    /// Error detail of the last attempt when the sequence failed.
    pub error: Option<NodeErrorDetail>,
}

impl AttemptSummary {
    /// Returns whether the sequence ended in success.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Runs an attempt closure under a retry policy.
///
/// The closure receives the 1-based attempt number. Waits between
/// attempts are cancellation-aware: an in-flight cancellation aborts the
/// backoff sleep immediately.
pub async fn run_with_retry<F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut attempt_fn: F,
) -> AttemptSummary
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<NodeResult, NodeErrorDetail>>,
{
    let max_attempts = policy.max_retries + 1;
    let mut attempts_made = 0;
    let mut last_result = None;
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        attempts_made = attempt;
        let error = match attempt_fn(attempt).await {
            Ok(result) => {
                let classified = crate::exec::classify(&result);
                last_result = Some(result);
                match classified {
                    None => {
                        return AttemptSummary {
                            attempts: attempt,
                            result: last_result,
                            error: None,
                        };
                    }
                    Some(error) => error,
                }
            }
            Err(error) => error,
        };

        let retryable = policy.retries(error.kind) && attempt < max_attempts;
        tracing::debug!(
            target: TRACING_TARGET,
            attempt,
            max_attempts,
            kind = %error.kind,
            retrying = retryable,
            "Node attempt failed"
        );
        last_error = Some(error);

        if !retryable {
            break;
        }

        let delay = policy.delay_after(attempt);
        tokio::select! {
            _ = cancel.cancelled() => {
                return AttemptSummary {
                    attempts: attempt,
                    result: last_result,
                    error: Some(NodeErrorDetail {
                        kind: FailureKind::Cancelled,
                        message: "cancelled while waiting to retry".to_string(),
                    }),
                };
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    AttemptSummary {
        attempts: attempts_made,
        result: last_result,
        error: last_error,
    }
}
