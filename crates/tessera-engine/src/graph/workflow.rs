//! Workflow definition: the serializable aggregate owning nodes, edges,
//! and settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::edge::WorkflowEdge;
use super::id::{NodeId, UserId, WorkflowId};
use super::node::WorkflowNode;

/// Lifecycle status of a workflow definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[derive(strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WorkflowStatus {
    /// Editable, not yet runnable by others.
    #[default]
    Draft,
    /// Published and runnable.
    Active,
    /// Retained for history, no longer runnable.
    Archived,
}

/// Workflow-level execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Maximum nodes holding Running status at once for one execution.
    pub max_concurrent_nodes: usize,
    /// Global wall-clock budget for the whole execution. Zero defers to
    /// the engine-wide default.
    pub global_timeout: Duration,
    /// Notify the triggering user when the execution completes.
    #[serde(default)]
    pub notify_on_completion: bool,
    /// Notify the triggering user when the execution fails.
    #[serde(default)]
    pub notify_on_failure: bool,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_concurrent_nodes: 5,
            global_timeout: Duration::from_secs(3600),
            notify_on_completion: false,
            notify_on_failure: true,
        }
    }
}

/// Rollup statistics maintained across executions of a workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStats {
    /// Total executions triggered.
    pub execution_count: u64,
    /// Mean execution duration over completed runs.
    pub average_duration: Duration,
}

/// A workflow definition: nodes, edges, and settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Stable workflow id.
    pub id: WorkflowId,
    /// Display name.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: Option<String>,
    /// Lifecycle status.
    #[serde(default)]
    pub status: WorkflowStatus,
    /// Nodes, in definition order.
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
    /// Edges between nodes.
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
    /// Execution settings.
    #[serde(default)]
    pub settings: WorkflowSettings,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Monotonic version counter, bumped on every edit.
    #[serde(default)]
    pub version: u64,
    /// Owning user.
    #[serde(default)]
    pub created_by: Option<UserId>,
    /// Execution rollups.
    #[serde(default)]
    pub stats: WorkflowStats,
}

impl Workflow {
    /// Creates an empty draft workflow.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: WorkflowId::new(),
            name: name.into(),
            description: None,
            status: WorkflowStatus::Draft,
            nodes: Vec::new(),
            edges: Vec::new(),
            settings: WorkflowSettings::default(),
            tags: Vec::new(),
            version: 0,
            created_by: None,
            stats: WorkflowStats::default(),
        }
    }

    /// Adds a node, returning its id.
    pub fn add_node(&mut self, node: WorkflowNode) -> NodeId {
        let id = node.id;
        self.nodes.push(node);
        id
    }

    /// Adds an edge.
    pub fn add_edge(&mut self, edge: WorkflowEdge) -> &mut Self {
        self.edges.push(edge);
        self
    }

    /// Connects two nodes with a plain data edge.
    pub fn connect(&mut self, source: NodeId, target: NodeId) -> &mut Self {
        self.edges.push(WorkflowEdge::data(source, target));
        self
    }

    /// Returns the node with the given id, if present.
    pub fn node(&self, id: NodeId) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Returns the number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ProgramId;

    #[test]
    fn test_default_settings() {
        let settings = WorkflowSettings::default();
        assert_eq!(settings.max_concurrent_nodes, 5);
        assert!(settings.notify_on_failure);
    }

    #[test]
    fn test_connect() {
        let mut workflow = Workflow::new("demo");
        let a = workflow.add_node(WorkflowNode::program(ProgramId::new()));
        let b = workflow.add_node(WorkflowNode::program(ProgramId::new()));
        workflow.connect(a, b);
        assert_eq!(workflow.node_count(), 2);
        assert_eq!(workflow.edges.len(), 1);
        assert!(workflow.node(a).is_some());
    }
}
