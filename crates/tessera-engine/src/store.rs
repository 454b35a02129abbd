//! Execution persistence: the store trait and an in-memory
//! implementation.
//!
//! The store is the engine's single shared mutable resource. All writes
//! are atomic per execution id (+ node id for node-level updates) so
//! concurrent node completions cannot lose updates, and reads observe
//! every previously acknowledged write (read-after-write).

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use jiff::Timestamp;
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::execution::{
    ExecutionErrorDetail, ExecutionStatus, NodeErrorDetail, NodeResult, NodeStatus,
    WorkflowExecution,
};
use crate::graph::{ExecutionId, NodeId};

/// A partial, atomically-applied update to one node execution record.
#[derive(Debug, Clone, Default)]
pub struct NodeUpdate {
    /// New status; Running stamps `started_at`, terminal statuses stamp
    /// `finished_at`.
    pub status: Option<NodeStatus>,
    /// New attempt count.
    pub attempts: Option<u32>,
    /// Latest attempt result; also absorbed into the execution-level
    /// resource rollup.
    pub result: Option<NodeResult>,
    /// Error detail for a failed attempt.
    pub error: Option<NodeErrorDetail>,
}

impl NodeUpdate {
    /// Update that only moves the status.
    pub fn status(status: NodeStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Sets the attempt count.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Sets the attempt result.
    pub fn with_result(mut self, result: NodeResult) -> Self {
        self.result = Some(result);
        self
    }

    /// Sets the error detail.
    pub fn with_error(mut self, error: NodeErrorDetail) -> Self {
        self.error = Some(error);
        self
    }
}

/// Persistence collaborator for execution aggregates.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persists a freshly created execution.
    async fn create(&self, execution: WorkflowExecution) -> EngineResult<()>;

    /// Loads an execution by id.
    async fn get(&self, id: ExecutionId) -> EngineResult<WorkflowExecution>;

    /// Compare-and-set status transition. Returns `false` (without
    /// writing) when the current status is not one of `expected`.
    /// Entering Running stamps `started_at`; terminal statuses stamp
    /// `finished_at`.
    async fn transition(
        &self,
        id: ExecutionId,
        expected: &[ExecutionStatus],
        to: ExecutionStatus,
    ) -> EngineResult<bool>;

    /// Records the phase the scheduler is currently dispatching.
    async fn advance_phase(&self, id: ExecutionId, phase: usize) -> EngineResult<()>;

    /// Applies a node-level update atomically and recomputes progress.
    async fn update_node(
        &self,
        id: ExecutionId,
        node_id: NodeId,
        update: NodeUpdate,
    ) -> EngineResult<()>;

    /// Finalizes an execution with a terminal status, optional error
    /// detail, and aggregated results.
    async fn finish(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        error: Option<ExecutionErrorDetail>,
        results: BTreeMap<String, Value>,
    ) -> EngineResult<()>;

    /// Deletes terminal executions created before the cutoff. Returns the
    /// ids of the removed records so callers can release per-execution
    /// resources held elsewhere (event channels, caches).
    async fn purge_created_before(&self, cutoff: Timestamp) -> EngineResult<Vec<ExecutionId>>;
}

/// In-memory [`ExecutionStore`] for tests and embedded use.
///
/// The arena is execution id -> aggregate (node id -> record inside);
/// a single mutex gives the per-key atomicity the trait requires at this
/// scale.
#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    executions: Mutex<HashMap<ExecutionId, WorkflowExecution>>,
}

impl MemoryExecutionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ExecutionId, WorkflowExecution>> {
        match self.executions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn create(&self, execution: WorkflowExecution) -> EngineResult<()> {
        self.lock().insert(execution.id, execution);
        Ok(())
    }

    async fn get(&self, id: ExecutionId) -> EngineResult<WorkflowExecution> {
        self.lock()
            .get(&id)
            .cloned()
            .ok_or(EngineError::ExecutionNotFound(id))
    }

    async fn transition(
        &self,
        id: ExecutionId,
        expected: &[ExecutionStatus],
        to: ExecutionStatus,
    ) -> EngineResult<bool> {
        let mut executions = self.lock();
        let execution = executions
            .get_mut(&id)
            .ok_or(EngineError::ExecutionNotFound(id))?;
        if !expected.contains(&execution.status) {
            return Ok(false);
        }
        execution.status = to;
        if to == ExecutionStatus::Running && execution.started_at.is_none() {
            execution.started_at = Some(Timestamp::now());
        }
        if to.is_terminal() {
            execution.finished_at = Some(Timestamp::now());
        }
        Ok(true)
    }

    async fn advance_phase(&self, id: ExecutionId, phase: usize) -> EngineResult<()> {
        let mut executions = self.lock();
        let execution = executions
            .get_mut(&id)
            .ok_or(EngineError::ExecutionNotFound(id))?;
        execution.progress.current_phase = phase;
        Ok(())
    }

    async fn update_node(
        &self,
        id: ExecutionId,
        node_id: NodeId,
        update: NodeUpdate,
    ) -> EngineResult<()> {
        let mut executions = self.lock();
        let execution = executions
            .get_mut(&id)
            .ok_or(EngineError::ExecutionNotFound(id))?;
        let record = execution
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| EngineError::Internal(format!("unknown node {node_id} in {id}")))?;

        if let Some(attempts) = update.attempts {
            record.attempts = attempts;
        }
        if let Some(result) = &update.result {
            record.record_result(result);
            execution.resource_usage.absorb(&result.resource_usage);
        }
        if let Some(error) = update.error {
            record.error = Some(error);
        }
        if let Some(status) = update.status {
            record.status = status;
            match status {
                NodeStatus::Running if record.started_at.is_none() => {
                    record.started_at = Some(Timestamp::now());
                }
                s if s.is_terminal() => {
                    record.finished_at = Some(Timestamp::now());
                }
                _ => {}
            }
        }
        execution.recompute_progress();
        Ok(())
    }

    async fn finish(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        error: Option<ExecutionErrorDetail>,
        results: BTreeMap<String, Value>,
    ) -> EngineResult<()> {
        let mut executions = self.lock();
        let execution = executions
            .get_mut(&id)
            .ok_or(EngineError::ExecutionNotFound(id))?;
        execution.status = status;
        execution.error = error;
        execution.results = results;
        execution.finished_at = Some(Timestamp::now());
        execution.recompute_progress();
        Ok(())
    }

    async fn purge_created_before(&self, cutoff: Timestamp) -> EngineResult<Vec<ExecutionId>> {
        let mut executions = self.lock();
        let mut removed = Vec::new();
        executions.retain(|id, e| {
            if e.status.is_terminal() && e.created_at < cutoff {
                removed.push(*id);
                false
            } else {
                true
            }
        });
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::TriggerContext;
    use crate::graph::{ProgramId, UserId, Workflow, WorkflowNode};

    fn seeded() -> (MemoryExecutionStore, WorkflowExecution, NodeId) {
        let mut workflow = Workflow::new("demo");
        let node = workflow.add_node(WorkflowNode::program(ProgramId::new()));
        let execution =
            WorkflowExecution::pending(&workflow, &TriggerContext::manual(UserId::new()));
        (MemoryExecutionStore::new(), execution, node)
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let (store, execution, _) = seeded();
        let id = execution.id;
        store.create(execution).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().status, ExecutionStatus::Pending);
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let (store, execution, _) = seeded();
        let id = execution.id;
        store.create(execution).await.unwrap();

        let moved = store
            .transition(id, &[ExecutionStatus::Pending], ExecutionStatus::Running)
            .await
            .unwrap();
        assert!(moved);

        // Second identical CAS fails: status is no longer Pending.
        let moved = store
            .transition(id, &[ExecutionStatus::Pending], ExecutionStatus::Running)
            .await
            .unwrap();
        assert!(!moved);
        assert!(store.get(id).await.unwrap().started_at.is_some());
    }

    #[tokio::test]
    async fn test_node_update_recomputes_progress() {
        let (store, execution, node) = seeded();
        let id = execution.id;
        store.create(execution).await.unwrap();

        store
            .update_node(id, node, NodeUpdate::status(NodeStatus::Succeeded))
            .await
            .unwrap();
        let execution = store.get(id).await.unwrap();
        assert_eq!(execution.progress.percent, 100);
        assert!(execution.node(node).unwrap().finished_at.is_some());
    }

    #[tokio::test]
    async fn test_purge_only_removes_terminal() {
        let (store, execution, _) = seeded();
        let id = execution.id;
        store.create(execution).await.unwrap();

        // Still pending: retained regardless of age.
        let removed = store.purge_created_before(Timestamp::now()).await.unwrap();
        assert!(removed.is_empty());

        store
            .finish(id, ExecutionStatus::Completed, None, BTreeMap::new())
            .await
            .unwrap();
        let removed = store.purge_created_before(Timestamp::now()).await.unwrap();
        assert_eq!(removed, vec![id]);
        assert!(store.get(id).await.is_err());
    }
}
