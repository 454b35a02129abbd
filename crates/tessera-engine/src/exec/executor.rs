//! Node execution: building sandbox run requests and normalizing their
//! outcomes.

use std::sync::Arc;

use tessera_sandbox::{ExecutableSpec, RunRequest, SandboxError, SandboxRunner};
use tokio_util::sync::CancellationToken;

use crate::TRACING_TARGET;
use crate::error::FailureKind;
use crate::execution::{NodeErrorDetail, NodeResult};
use crate::graph::{ExecutionId, WorkflowNode};
use crate::resolver::InputBundle;

/// Environment variable carrying the serialized input bundle.
pub const ENV_INPUTS: &str = "TESSERA_INPUTS";
/// Environment variable carrying the dependency accessor manifest.
pub const ENV_ACCESSORS: &str = "TESSERA_ACCESSORS";
/// Environment variable carrying the node id.
pub const ENV_NODE_ID: &str = "TESSERA_NODE_ID";
/// Environment variable carrying the execution id.
pub const ENV_EXECUTION_ID: &str = "TESSERA_EXECUTION_ID";

/// Runs one node attempt against the injected sandbox.
#[derive(Clone)]
pub struct NodeExecutor {
    sandbox: Arc<dyn SandboxRunner>,
}

impl NodeExecutor {
    /// Creates an executor over a sandbox backend.
    pub fn new(sandbox: Arc<dyn SandboxRunner>) -> Self {
        Self { sandbox }
    }

    /// Builds the sandbox request for a node: program spec, serialized
    /// input bundle plus accessor manifest in the environment, resource
    /// ceiling, and per-attempt timeout from the node's settings.
    pub fn build_request(
        &self,
        execution_id: ExecutionId,
        node: &WorkflowNode,
        spec: ExecutableSpec,
        bundle: &InputBundle,
    ) -> Result<RunRequest, NodeErrorDetail> {
        let inputs = bundle.to_json_string().map_err(|e| NodeErrorDetail {
            kind: FailureKind::LaunchFailure,
            message: format!("failed to serialize input bundle: {e}"),
        })?;
        let accessors = bundle.accessor_manifest().to_string();

        Ok(RunRequest::new(spec)
            .with_env(ENV_INPUTS, inputs)
            .with_env(ENV_ACCESSORS, accessors)
            .with_env(ENV_NODE_ID, node.id.to_string())
            .with_env(ENV_EXECUTION_ID, execution_id.to_string())
            .with_limits(node.execution.limits)
            .with_timeout(node.execution.timeout))
    }

    /// Executes one attempt.
    ///
    /// A run that launches and then fails inside the sandbox (non-zero
    /// exit, timeout kill, resource kill) is an `Ok` result carrying the
    /// evidence; only launch-level and cancellation faults are `Err`.
    pub async fn execute(
        &self,
        request: RunRequest,
        cancel: &CancellationToken,
    ) -> Result<NodeResult, NodeErrorDetail> {
        match self.sandbox.run(request, cancel.child_token()).await {
            Ok(outcome) => Ok(NodeResult::from(outcome)),
            Err(SandboxError::Cancelled) => Err(NodeErrorDetail {
                kind: FailureKind::Cancelled,
                message: "node execution cancelled".to_string(),
            }),
            Err(err) => {
                tracing::warn!(
                    target: TRACING_TARGET,
                    error = %err,
                    "Sandbox launch failed"
                );
                Err(NodeErrorDetail {
                    kind: FailureKind::LaunchFailure,
                    message: err.to_string(),
                })
            }
        }
    }
}

/// Classifies a completed (launched) attempt. `None` means success.
pub fn classify(result: &NodeResult) -> Option<NodeErrorDetail> {
    if result.timed_out {
        return Some(NodeErrorDetail {
            kind: FailureKind::Timeout,
            message: "node execution exceeded its timeout and was terminated".to_string(),
        });
    }
    if result.resource_exceeded {
        return Some(NodeErrorDetail {
            kind: FailureKind::ResourceExceeded,
            message: "node execution breached its resource ceiling".to_string(),
        });
    }
    match result.exit_code {
        Some(0) => None,
        Some(code) => Some(NodeErrorDetail {
            kind: FailureKind::ApplicationExit,
            message: format!("program exited with code {code}"),
        }),
        None => Some(NodeErrorDetail {
            kind: FailureKind::LaunchFailure,
            message: "program terminated without an exit code".to_string(),
        }),
    }
}

impl std::fmt::Debug for NodeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeExecutor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tessera_sandbox::ResourceUsage;

    use super::*;

    fn result(exit_code: Option<i32>) -> NodeResult {
        NodeResult {
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            output_files: Vec::new(),
            duration: Duration::from_millis(1),
            resource_usage: ResourceUsage::default(),
            timed_out: false,
            resource_exceeded: false,
        }
    }

    #[test]
    fn test_classify_success() {
        assert!(classify(&result(Some(0))).is_none());
    }

    #[test]
    fn test_classify_application_exit() {
        let detail = classify(&result(Some(3))).unwrap();
        assert_eq!(detail.kind, FailureKind::ApplicationExit);
    }

    #[test]
    fn test_classify_timeout_beats_exit_code() {
        let mut timed_out = result(None);
        timed_out.timed_out = true;
        assert_eq!(classify(&timed_out).unwrap().kind, FailureKind::Timeout);
    }

    #[test]
    fn test_classify_resource_kill() {
        let mut killed = result(None);
        killed.resource_exceeded = true;
        assert_eq!(
            classify(&killed).unwrap().kind,
            FailureKind::ResourceExceeded
        );
    }
}
