//! Execution aggregates and their status machines.

mod record;
mod status;

pub use record::{
    ExecutionErrorDetail, ExecutionProgress, NodeErrorDetail, NodeExecution, NodeResult,
    TriggerContext, WorkflowExecution,
};
pub use status::{ExecutionStatus, NodeStatus, TriggerKind};
