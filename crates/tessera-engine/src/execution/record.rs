//! Execution aggregates: workflow and node execution records.

use std::collections::BTreeMap;
use std::time::Duration;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessera_sandbox::{ResourceUsage, RunOutcome};

use super::status::{ExecutionStatus, NodeStatus, TriggerKind};
use crate::error::FailureKind;
use crate::graph::{ExecutionId, NodeId, UserId, Workflow, WorkflowId};

/// Normalized result of one node attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    /// Exit code; `None` when the run was killed.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Files left in the sandbox working directory.
    pub output_files: Vec<String>,
    /// Measured wall-clock duration.
    pub duration: Duration,
    /// Observed resource usage.
    pub resource_usage: ResourceUsage,
    /// The attempt hit its wall-clock timeout.
    pub timed_out: bool,
    /// The attempt breached its resource ceiling.
    pub resource_exceeded: bool,
}

impl NodeResult {
    /// Returns whether the attempt succeeded.
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.resource_exceeded
    }
}

impl From<RunOutcome> for NodeResult {
    fn from(outcome: RunOutcome) -> Self {
        Self {
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            output_files: outcome.output_files,
            duration: outcome.duration,
            resource_usage: outcome.resource_usage,
            timed_out: outcome.timed_out,
            resource_exceeded: outcome.resource_exceeded,
        }
    }
}

/// Error detail recorded on a failed node execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeErrorDetail {
    /// Failure classification of the last attempt.
    pub kind: FailureKind,
    /// Human-readable message.
    pub message: String,
}

/// One node's execution record within a workflow execution.
///
/// Retries mutate this single record (bumping `attempts`); they never
/// create additional records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    /// The workflow node this record tracks.
    pub node_id: NodeId,
    /// Current status.
    pub status: NodeStatus,
    /// Attempts made so far (0 until first dispatch).
    pub attempts: u32,
    /// Captured standard output of the last attempt.
    #[serde(default)]
    pub stdout: String,
    /// Captured standard error of the last attempt.
    #[serde(default)]
    pub stderr: String,
    /// Exit code of the last attempt.
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Output files of the last attempt.
    #[serde(default)]
    pub output_files: Vec<String>,
    /// Resource usage of the last attempt.
    #[serde(default)]
    pub resource_usage: ResourceUsage,
    /// Wall-clock duration of the last attempt.
    #[serde(default)]
    pub duration: Option<Duration>,
    /// When the node first entered Running.
    #[serde(default)]
    pub started_at: Option<Timestamp>,
    /// When the node reached a terminal status.
    #[serde(default)]
    pub finished_at: Option<Timestamp>,
    /// Error detail when the node failed.
    #[serde(default)]
    pub error: Option<NodeErrorDetail>,
}

impl NodeExecution {
    /// Creates a pending record for a node.
    pub fn pending(node_id: NodeId) -> Self {
        Self {
            node_id,
            status: NodeStatus::Pending,
            attempts: 0,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            output_files: Vec::new(),
            resource_usage: ResourceUsage::default(),
            duration: None,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// Records the result of the latest attempt.
    pub fn record_result(&mut self, result: &NodeResult) {
        self.stdout = result.stdout.clone();
        self.stderr = result.stderr.clone();
        self.exit_code = result.exit_code;
        self.output_files = result.output_files.clone();
        self.resource_usage = result.resource_usage;
        self.duration = Some(result.duration);
    }

    /// Returns whether the node succeeded.
    pub fn is_success(&self) -> bool {
        self.status == NodeStatus::Succeeded
    }
}

/// Progress snapshot of a workflow execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProgress {
    /// Terminal nodes as a percentage of all planned nodes, 0-100.
    pub percent: u8,
    /// Index of the phase currently being dispatched.
    pub current_phase: usize,
    /// Per-node status map.
    pub node_statuses: BTreeMap<NodeId, NodeStatus>,
}

/// Error detail surfaced on a failed execution: the first fatal node plus
/// its message. The full per-node status map lives in
/// [`ExecutionProgress::node_statuses`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionErrorDetail {
    /// The node whose failure propagated, when there is one.
    #[serde(default)]
    pub node_id: Option<NodeId>,
    /// Failure classification, when node-level.
    #[serde(default)]
    pub kind: Option<FailureKind>,
    /// Human-readable message.
    pub message: String,
}

/// Context describing who and what triggered an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerContext {
    /// The triggering user.
    pub user: UserId,
    /// Trigger kind.
    pub kind: TriggerKind,
    /// Run-time inputs supplied by the trigger, merged into node user
    /// inputs.
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
}

impl TriggerContext {
    /// Creates a manual trigger context.
    pub fn manual(user: UserId) -> Self {
        Self {
            user,
            kind: TriggerKind::Manual,
            inputs: BTreeMap::new(),
        }
    }

    /// Creates an API trigger context.
    pub fn api(user: UserId) -> Self {
        Self {
            user,
            kind: TriggerKind::Api,
            inputs: BTreeMap::new(),
        }
    }
}

/// One run of a workflow: the aggregate the scheduler mutates through the
/// execution store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Execution id.
    pub id: ExecutionId,
    /// The workflow definition this run executes.
    pub workflow_id: WorkflowId,
    /// Triggering user.
    pub triggered_by: UserId,
    /// Trigger kind.
    pub trigger: TriggerKind,
    /// Current status.
    pub status: ExecutionStatus,
    /// Progress snapshot.
    pub progress: ExecutionProgress,
    /// Aggregated outputs of output-kind nodes, keyed by resolved label.
    #[serde(default)]
    pub results: BTreeMap<String, Value>,
    /// Error detail when the execution failed.
    #[serde(default)]
    pub error: Option<ExecutionErrorDetail>,
    /// Resource usage rolled up across all node attempts.
    #[serde(default)]
    pub resource_usage: ResourceUsage,
    /// Per-node execution records.
    pub nodes: BTreeMap<NodeId, NodeExecution>,
    /// When the record was created.
    pub created_at: Timestamp,
    /// When the execution entered Running.
    #[serde(default)]
    pub started_at: Option<Timestamp>,
    /// When the execution reached a terminal status.
    #[serde(default)]
    pub finished_at: Option<Timestamp>,
}

impl WorkflowExecution {
    /// Creates a pending execution for a validated workflow, with one
    /// pending node record per workflow node.
    pub fn pending(workflow: &Workflow, trigger: &TriggerContext) -> Self {
        let nodes: BTreeMap<NodeId, NodeExecution> = workflow
            .nodes
            .iter()
            .map(|node| (node.id, NodeExecution::pending(node.id)))
            .collect();
        let node_statuses = nodes.keys().map(|id| (*id, NodeStatus::Pending)).collect();

        Self {
            id: ExecutionId::new(),
            workflow_id: workflow.id,
            triggered_by: trigger.user,
            trigger: trigger.kind,
            status: ExecutionStatus::Pending,
            progress: ExecutionProgress {
                percent: 0,
                current_phase: 0,
                node_statuses,
            },
            results: BTreeMap::new(),
            error: None,
            resource_usage: ResourceUsage::default(),
            nodes,
            created_at: Timestamp::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Returns the node record for a node id.
    pub fn node(&self, id: NodeId) -> Option<&NodeExecution> {
        self.nodes.get(&id)
    }

    /// Recomputes the progress percentage and status map from the node
    /// records.
    pub fn recompute_progress(&mut self) {
        let total = self.nodes.len();
        let terminal = self
            .nodes
            .values()
            .filter(|n| n.status.is_terminal())
            .count();
        self.progress.percent = if total == 0 {
            100
        } else {
            ((terminal * 100) / total) as u8
        };
        self.progress.node_statuses = self
            .nodes
            .iter()
            .map(|(id, node)| (*id, node.status))
            .collect();
    }

    /// Returns how many nodes currently hold Running status.
    pub fn running_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| n.status == NodeStatus::Running)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ProgramId, WorkflowNode};

    #[test]
    fn test_pending_execution_tracks_all_nodes() {
        let mut workflow = Workflow::new("demo");
        let a = workflow.add_node(WorkflowNode::program(ProgramId::new()));
        let b = workflow.add_node(WorkflowNode::program(ProgramId::new()));

        let execution =
            WorkflowExecution::pending(&workflow, &TriggerContext::manual(UserId::new()));
        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert_eq!(execution.nodes.len(), 2);
        assert_eq!(execution.node(a).unwrap().status, NodeStatus::Pending);
        assert_eq!(execution.node(b).unwrap().attempts, 0);
    }

    #[test]
    fn test_progress_recompute() {
        let mut workflow = Workflow::new("demo");
        let a = workflow.add_node(WorkflowNode::program(ProgramId::new()));
        let _b = workflow.add_node(WorkflowNode::program(ProgramId::new()));

        let mut execution =
            WorkflowExecution::pending(&workflow, &TriggerContext::manual(UserId::new()));
        execution
            .nodes
            .get_mut(&a)
            .unwrap()
            .status = NodeStatus::Succeeded;
        execution.recompute_progress();

        assert_eq!(execution.progress.percent, 50);
        assert_eq!(
            execution.progress.node_statuses.get(&a),
            Some(&NodeStatus::Succeeded)
        );
    }
}
