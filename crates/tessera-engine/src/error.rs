//! Engine error types and the node failure taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{EdgeId, ExecutionId, InteractionId, NodeId, ProgramId};

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Classification of a node-level failure.
///
/// The retry manager consults this to decide whether another attempt is
/// worthwhile: system-level faults are transient, an ordinary non-zero
/// exit is the program's own verdict and is not retried by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// The run exceeded its wall-clock timeout and was killed.
    Timeout,
    /// The run breached its resource ceiling and was killed.
    ResourceExceeded,
    /// The sandbox could not launch or supervise the process.
    LaunchFailure,
    /// The program exited non-zero with no system-level fault.
    ApplicationExit,
    /// The run was cancelled externally.
    Cancelled,
    /// A required human interaction timed out or was cancelled.
    Interaction,
}

impl FailureKind {
    /// Returns whether this kind is transient (retryable by default).
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureKind::Timeout | FailureKind::ResourceExceeded | FailureKind::LaunchFailure
        )
    }
}

/// Errors that can occur during workflow validation and execution.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The workflow graph contains a cycle. Structural, never retryable.
    #[error("cycle detected in workflow graph: {}", format_cycle(.path))]
    CyclicGraph {
        /// One closed walk through the cycle, in edge order.
        path: Vec<NodeId>,
    },

    /// An edge references a node id that does not exist in the workflow.
    #[error("edge {edge_id} references missing node {node_id}")]
    DanglingReference {
        /// The offending edge.
        edge_id: EdgeId,
        /// The referenced but absent node id.
        node_id: NodeId,
    },

    /// Two nodes share the same id.
    #[error("duplicate node id {node_id} in workflow")]
    DuplicateNode {
        /// The duplicated id.
        node_id: NodeId,
    },

    /// No execution with the given id exists in the store.
    #[error("execution {0} not found")]
    ExecutionNotFound(ExecutionId),

    /// No interaction with the given id exists in the store.
    #[error("interaction {0} not found")]
    InteractionNotFound(InteractionId),

    /// The program catalog has no executable for the given id.
    #[error("program {0} not found")]
    ProgramNotFound(ProgramId),

    /// The persistence collaborator failed after bounded retries.
    /// In-flight node results are held and re-applied, never discarded.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The execution was cancelled by an external request.
    #[error("execution cancelled")]
    Cancelled,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Returns whether this error is structural: detected at validation
    /// time, before any execution record exists.
    pub const fn is_structural(&self) -> bool {
        matches!(
            self,
            EngineError::CyclicGraph { .. }
                | EngineError::DanglingReference { .. }
                | EngineError::DuplicateNode { .. }
        )
    }
}

fn format_cycle(path: &[NodeId]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds() {
        assert!(FailureKind::Timeout.is_transient());
        assert!(FailureKind::ResourceExceeded.is_transient());
        assert!(FailureKind::LaunchFailure.is_transient());
        assert!(!FailureKind::ApplicationExit.is_transient());
        assert!(!FailureKind::Cancelled.is_transient());
    }

    #[test]
    fn test_structural_classification() {
        let err = EngineError::DuplicateNode {
            node_id: NodeId::new(),
        };
        assert!(err.is_structural());
        assert!(!EngineError::Cancelled.is_structural());
    }
}
