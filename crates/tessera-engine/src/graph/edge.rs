//! Workflow edge model: kinds, conditions, transformations.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::id::{EdgeId, NodeId};

/// Kind of dependency an edge expresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EdgeKind {
    /// The downstream node consumes the upstream node's result.
    Data,
    /// Ordering only; no data flows across the edge.
    Control,
}

/// What happens to the downstream node when an edge's condition does not
/// hold (or its upstream dependency failed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ConditionFailureAction {
    /// Mark the downstream node skipped without executing it.
    Skip,
    /// Propagate the failure to the whole execution.
    Fail,
    /// Substitute a configured payload as the upstream result and proceed.
    UseDefault {
        /// Payload injected in place of the upstream bundle entry.
        default: Value,
    },
}

/// Condition gating an edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeCondition {
    /// Expression evaluated against the aggregate execution state, e.g.
    /// `source.success` or `source.exit_code == 0`.
    pub expression: String,
    /// Action taken when the condition evaluates false or the upstream
    /// node failed.
    pub on_failure: ConditionFailureAction,
}

/// Expression language of an edge transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransformLanguage {
    /// Dot-path selection into the upstream bundle entry.
    Path,
    /// Wrap the selected value under a named key.
    Template,
}

/// Transformation applied to data crossing an edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeTransform {
    /// Expression language.
    pub language: TransformLanguage,
    /// The transformation expression.
    pub expression: String,
    /// Validate the transformed value is non-null before passing it on.
    #[serde(default)]
    pub validate: bool,
}

/// A directed dependency between two workflow nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEdge {
    /// Stable edge id.
    pub id: EdgeId,
    /// Upstream node.
    pub source: NodeId,
    /// Downstream node.
    pub target: NodeId,
    /// Named output port on the source.
    #[serde(default)]
    pub source_port: Option<String>,
    /// Named input port on the target.
    #[serde(default)]
    pub target_port: Option<String>,
    /// Edge kind.
    pub kind: EdgeKind,
    /// Optional gating condition.
    #[serde(default)]
    pub condition: Option<EdgeCondition>,
    /// Optional transformation of crossing data.
    #[serde(default)]
    pub transform: Option<EdgeTransform>,
    /// Disabled edges are ignored by the scheduler and resolver.
    #[serde(default)]
    pub disabled: bool,
}

impl WorkflowEdge {
    /// Creates a data edge between two nodes.
    pub fn data(source: NodeId, target: NodeId) -> Self {
        Self {
            id: EdgeId::new(),
            source,
            target,
            source_port: None,
            target_port: None,
            kind: EdgeKind::Data,
            condition: None,
            transform: None,
            disabled: false,
        }
    }

    /// Creates a control edge between two nodes.
    pub fn control(source: NodeId, target: NodeId) -> Self {
        Self {
            kind: EdgeKind::Control,
            ..Self::data(source, target)
        }
    }

    /// Attaches a gating condition.
    pub fn with_condition(mut self, condition: EdgeCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Attaches a transformation.
    pub fn with_transform(mut self, transform: EdgeTransform) -> Self {
        self.transform = Some(transform);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_action_serde_tag() {
        let action = ConditionFailureAction::UseDefault {
            default: serde_json::json!({"ok": true}),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "use_default");
        assert_eq!(json["default"]["ok"], true);
    }

    #[test]
    fn test_edge_builders() {
        let a = NodeId::new();
        let b = NodeId::new();
        let edge = WorkflowEdge::data(a, b).with_condition(EdgeCondition {
            expression: "source.success".into(),
            on_failure: ConditionFailureAction::Skip,
        });
        assert_eq!(edge.kind, EdgeKind::Data);
        assert!(edge.condition.is_some());
        assert_eq!(WorkflowEdge::control(a, b).kind, EdgeKind::Control);
    }
}
