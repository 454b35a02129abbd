//! Convenience re-exports for embedding the engine.

pub use crate::config::{EngineConfig, ServiceConfig};
pub use crate::error::{EngineError, EngineResult, FailureKind};
pub use crate::execution::{
    ExecutionStatus, NodeStatus, TriggerContext, TriggerKind, WorkflowExecution,
};
pub use crate::graph::{
    ConditionFailureAction, EdgeCondition, EdgeKind, ExecutionId, InteractionId, NodeId, NodeKind,
    ProgramId, UserId, Workflow, WorkflowEdge, WorkflowId, WorkflowNode,
};
pub use crate::interact::{InteractionStatus, InteractionStore, UiInteraction};
pub use crate::program::ProgramLookup;
pub use crate::resolver::InputBundle;
pub use crate::store::ExecutionStore;
pub use crate::stream::{ExecutionEvent, OutputChannel};
pub use crate::{WorkflowService, WorkflowServiceBuilder};
