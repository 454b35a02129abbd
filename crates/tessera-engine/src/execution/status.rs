//! Status machines for executions and node executions.

use serde::{Deserialize, Serialize};

/// Status of a workflow execution.
///
/// `Pending -> Running -> {Completed, Failed, Cancelled}`, with `Paused`
/// reachable from `Running` while a node awaits human input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, not yet scheduled.
    Pending,
    /// The scheduler is dispatching nodes.
    Running,
    /// Every reachable node succeeded or was skipped by design.
    Completed,
    /// A node failure propagated to the execution level.
    Failed,
    /// Cancelled by external request.
    Cancelled,
    /// Suspended while a node awaits human input.
    Paused,
}

impl ExecutionStatus {
    /// Returns whether this status is terminal.
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Returns whether the scheduler is still responsible for this
    /// execution.
    pub const fn is_active(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Pending | ExecutionStatus::Running | ExecutionStatus::Paused
        )
    }
}

/// Status of one node within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeStatus {
    /// Not yet dispatched.
    Pending,
    /// Currently executing in the sandbox.
    Running,
    /// Completed with exit code zero.
    Succeeded,
    /// Failed terminally (retries exhausted or non-retryable).
    Failed,
    /// Not executed: disabled, or skipped by an edge condition.
    Skipped,
    /// Blocked on a human interaction.
    WaitingForInput,
}

impl NodeStatus {
    /// Returns whether this status is terminal.
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Skipped
        )
    }
}

/// How an execution was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TriggerKind {
    /// Started by a user from the UI.
    Manual,
    /// Started by the platform scheduler.
    Scheduled,
    /// Started through the public API.
    Api,
    /// Re-run of a previous execution.
    Rerun,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
        assert!(ExecutionStatus::Paused.is_active());

        assert!(NodeStatus::Skipped.is_terminal());
        assert!(!NodeStatus::WaitingForInput.is_terminal());
    }

    #[test]
    fn test_display_snake_case() {
        assert_eq!(NodeStatus::WaitingForInput.to_string(), "waiting_for_input");
        assert_eq!(ExecutionStatus::Running.to_string(), "running");
    }
}
