//! The sandbox runner trait and run outcome types.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::SandboxResult;
use crate::spec::RunRequest;

/// Resource usage observed for one sandboxed run.
///
/// Backends fill in what they can measure; unmeasured fields stay zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Peak resident memory in megabytes.
    pub peak_memory_mb: u64,
    /// CPU time consumed, in milliseconds.
    pub cpu_time_ms: u64,
    /// Scratch disk written, in megabytes.
    pub disk_written_mb: u64,
}

impl ResourceUsage {
    /// Adds another sample into this one (used for execution-level rollups).
    pub fn absorb(&mut self, other: &ResourceUsage) {
        self.peak_memory_mb = self.peak_memory_mb.max(other.peak_memory_mb);
        self.cpu_time_ms += other.cpu_time_ms;
        self.disk_written_mb += other.disk_written_mb;
    }
}

/// Result of a sandboxed run that launched successfully.
///
/// A timeout kill or resource-limit kill still produces an outcome, with
/// the corresponding flag set and `exit_code` absent; only launch-level
/// faults surface as [`SandboxError`](crate::SandboxError).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Process exit code; `None` when the run was killed (timeout or
    /// resource breach).
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Files the program left in its working directory, relative paths.
    pub output_files: Vec<String>,
    /// Wall-clock duration of the run.
    pub duration: Duration,
    /// Observed resource usage.
    pub resource_usage: ResourceUsage,
    /// The run exceeded its wall-clock timeout and was terminated.
    pub timed_out: bool,
    /// The run breached its resource ceiling and was terminated.
    pub resource_exceeded: bool,
}

impl RunOutcome {
    /// Returns whether the run completed with exit code zero.
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.resource_exceeded
    }
}

/// An isolated execution backend for node programs.
///
/// Implementations must honor the request's wall-clock timeout and the
/// cancellation token by force-terminating the sandboxed process, and must
/// report resource-limit kills distinctly from ordinary non-zero exits.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Runs a program to completion, timeout, or cancellation.
    async fn run(&self, request: RunRequest, cancel: CancellationToken)
    -> SandboxResult<RunOutcome>;
}

#[async_trait]
impl<T: SandboxRunner + ?Sized> SandboxRunner for Box<T> {
    async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> SandboxResult<RunOutcome> {
        (**self).run(request, cancel).await
    }
}

#[async_trait]
impl<T: SandboxRunner + ?Sized> SandboxRunner for Arc<T> {
    async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> SandboxResult<RunOutcome> {
        (**self).run(request, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_absorb() {
        let mut rollup = ResourceUsage {
            peak_memory_mb: 100,
            cpu_time_ms: 50,
            disk_written_mb: 1,
        };
        rollup.absorb(&ResourceUsage {
            peak_memory_mb: 300,
            cpu_time_ms: 25,
            disk_written_mb: 2,
        });
        assert_eq!(rollup.peak_memory_mb, 300);
        assert_eq!(rollup.cpu_time_ms, 75);
        assert_eq!(rollup.disk_written_mb, 3);
    }

    #[test]
    fn test_outcome_success() {
        let outcome = RunOutcome {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            output_files: Vec::new(),
            duration: Duration::from_millis(1),
            resource_usage: ResourceUsage::default(),
            timed_out: false,
            resource_exceeded: false,
        };
        assert!(outcome.is_success());

        let killed = RunOutcome {
            exit_code: None,
            timed_out: true,
            ..outcome
        };
        assert!(!killed.is_success());
    }
}
