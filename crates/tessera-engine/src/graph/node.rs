//! Workflow node model: kinds, input/output configuration, execution
//! settings.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessera_sandbox::ResourceLimits;

use super::id::{NodeId, ProgramId, VersionId};

/// Role of a node in the workflow graph.
///
/// A closed variant set; evaluation sites match exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeKind {
    /// Runs a user program in the sandbox.
    Program,
    /// Entry point carrying externally supplied data.
    Input,
    /// Exit point whose results are collected into the execution summary.
    Output,
    /// Evaluates a condition over upstream results without running a
    /// program.
    Condition,
}

/// Canvas position. Irrelevant to execution semantics, preserved for the
/// workflow editor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A legacy field-mapping rule: extracts one field from an upstream
/// node's bundle entry via a dot-path expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputMapping {
    /// Name the extracted value is bound to in the input bundle.
    pub target: String,
    /// Upstream node supplying the value.
    pub source_node: NodeId,
    /// Dot-path into the upstream bundle entry, e.g. `stdout` or
    /// `output_files.0`.
    pub expression: String,
}

/// Input configuration for a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Static inputs baked into the workflow definition.
    #[serde(default)]
    pub static_inputs: BTreeMap<String, Value>,
    /// Inputs supplied by the triggering user at run time.
    #[serde(default)]
    pub user_inputs: BTreeMap<String, Value>,
    /// Legacy field-mapping rules. Highest merge precedence.
    #[serde(default)]
    pub mappings: Vec<InputMapping>,
}

impl InputConfig {
    /// Returns whether no inputs of any sort are configured.
    pub fn is_empty(&self) -> bool {
        self.static_inputs.is_empty() && self.user_inputs.is_empty() && self.mappings.is_empty()
    }
}

/// Output configuration for a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Named output mappings exposed to the execution summary.
    #[serde(default)]
    pub mappings: BTreeMap<String, String>,
    /// How long downstream consumers may reuse a cached result.
    #[serde(default)]
    pub cache_ttl: Option<Duration>,
}

/// Request for a human-in-the-loop pause before the node executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRequest {
    /// Interaction type understood by the frontend (form, approval, ...).
    pub kind: String,
    /// JSON schema describing the expected payload.
    #[serde(default)]
    pub schema: Value,
    /// How long to wait before the interaction times out.
    pub timeout: Duration,
}

/// Per-node execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Wall-clock timeout for one attempt.
    pub timeout: Duration,
    /// Number of retries after the first attempt. Zero defers to the
    /// engine-wide default policy.
    pub max_retries: u32,
    /// Base delay between retries.
    pub retry_delay: Duration,
    /// Doubles the delay on every retry when set.
    pub exponential_backoff: bool,
    /// Also retry ordinary non-zero exits, not just system faults.
    pub retry_application_errors: bool,
    /// Resource ceiling forwarded to the sandbox.
    pub limits: ResourceLimits,
    /// Whether the node may run concurrently with phase siblings.
    pub parallel_eligible: bool,
    /// Dispatch priority within a phase; lower runs first.
    pub priority: i32,
    /// Human-interaction gate evaluated before the node runs.
    #[serde(default)]
    pub interaction: Option<InteractionRequest>,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            max_retries: 0,
            retry_delay: Duration::from_secs(1),
            exponential_backoff: true,
            retry_application_errors: false,
            limits: ResourceLimits::default(),
            parallel_eligible: true,
            priority: 0,
            interaction: None,
        }
    }
}

/// Conditional-execution rule attached directly to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCondition {
    /// Expression evaluated against the aggregate execution state.
    pub expression: String,
    /// Skip the node (rather than failing it) when the condition does not
    /// hold.
    pub skip_if_false: bool,
}

/// One unit of work in a workflow, bound to a program version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Stable node id, referenced by edges.
    pub id: NodeId,
    /// The program this node runs.
    pub program_id: ProgramId,
    /// Specific program version; latest when absent.
    #[serde(default)]
    pub version_id: Option<VersionId>,
    /// Node role.
    pub kind: NodeKind,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Canvas position, editor-only.
    #[serde(default)]
    pub position: Position,
    /// Input configuration.
    #[serde(default)]
    pub inputs: InputConfig,
    /// Output configuration.
    #[serde(default)]
    pub outputs: OutputConfig,
    /// Execution settings.
    #[serde(default)]
    pub execution: ExecutionSettings,
    /// Conditional-execution rule.
    #[serde(default)]
    pub condition: Option<NodeCondition>,
    /// Disabled nodes are skipped without executing.
    #[serde(default)]
    pub disabled: bool,
}

impl WorkflowNode {
    /// Creates a program node with default settings.
    pub fn program(program_id: ProgramId) -> Self {
        Self {
            id: NodeId::new(),
            program_id,
            version_id: None,
            kind: NodeKind::Program,
            name: None,
            position: Position::default(),
            inputs: InputConfig::default(),
            outputs: OutputConfig::default(),
            execution: ExecutionSettings::default(),
            condition: None,
            disabled: false,
        }
    }

    /// Creates a node of the given kind.
    pub fn with_kind(program_id: ProgramId, kind: NodeKind) -> Self {
        Self {
            kind,
            ..Self::program(program_id)
        }
    }

    /// Sets the node id (used when loading persisted definitions).
    pub fn with_id(mut self, id: NodeId) -> Self {
        self.id = id;
        self
    }

    /// Sets the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the dispatch priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.execution.priority = priority;
        self
    }

    /// Marks the node disabled.
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = ExecutionSettings::default();
        assert_eq!(settings.max_retries, 0);
        assert!(settings.exponential_backoff);
        assert!(!settings.retry_application_errors);
    }

    #[test]
    fn test_node_builder() {
        let node = WorkflowNode::program(ProgramId::new())
            .with_name("extract")
            .with_priority(3);
        assert_eq!(node.kind, NodeKind::Program);
        assert_eq!(node.name.as_deref(), Some("extract"));
        assert_eq!(node.execution.priority, 3);
    }
}
