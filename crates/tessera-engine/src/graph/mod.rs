//! Workflow graph model: definitions, runtime graph, validation, and
//! execution planning.

mod edge;
mod graph;
mod id;
mod node;
mod plan;
mod validator;
mod workflow;

pub use edge::{
    ConditionFailureAction, EdgeCondition, EdgeKind, EdgeTransform, TransformLanguage,
    WorkflowEdge,
};
pub use graph::WorkflowGraph;
pub use id::{
    EdgeId, ExecutionId, InteractionId, NodeId, ProgramId, UserId, VersionId, WorkflowId,
};
pub use node::{
    ExecutionSettings, InputConfig, InputMapping, InteractionRequest, NodeCondition, NodeKind,
    OutputConfig, Position, WorkflowNode,
};
pub use plan::ExecutionPlan;
pub use validator::{plan, validate};
pub use workflow::{Workflow, WorkflowSettings, WorkflowStats, WorkflowStatus};
