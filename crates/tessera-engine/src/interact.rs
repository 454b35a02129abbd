//! Human-interaction gates: pause points where a node blocks awaiting
//! external input.
//!
//! Pausing is a first-class suspension state in the node state machine,
//! not a blocking call: the scheduler parks the branch, the execution
//! shows `Paused`, and an external actor resolves the interaction through
//! the store.

use std::time::Duration;

use async_trait::async_trait;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};
use crate::graph::{ExecutionId, InteractionId, InteractionRequest, NodeId};

/// Status of a human-interaction gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InteractionStatus {
    /// Awaiting the external actor.
    Pending,
    /// Resolved with a payload; the node resumes.
    Completed,
    /// The deadline passed without resolution.
    TimedOut,
    /// Cancelled externally.
    Cancelled,
}

impl InteractionStatus {
    /// Returns whether this status is terminal.
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, InteractionStatus::Pending)
    }
}

/// A pause point awaiting external user input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiInteraction {
    /// Interaction id.
    pub id: InteractionId,
    /// Owning execution.
    pub execution_id: ExecutionId,
    /// The node blocked on this interaction.
    pub node_id: NodeId,
    /// Interaction type understood by the frontend.
    pub kind: String,
    /// JSON schema describing the expected payload.
    #[serde(default)]
    pub schema: Value,
    /// Current status.
    pub status: InteractionStatus,
    /// Resolution payload, once completed.
    #[serde(default)]
    pub payload: Option<Value>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Deadline after which the interaction times out.
    pub deadline: Timestamp,
}

impl UiInteraction {
    /// Creates a pending interaction for a node's gate request.
    pub fn pending(
        execution_id: ExecutionId,
        node_id: NodeId,
        request: &InteractionRequest,
    ) -> Self {
        let created_at = Timestamp::now();
        Self {
            id: InteractionId::new(),
            execution_id,
            node_id,
            kind: request.kind.clone(),
            schema: request.schema.clone(),
            status: InteractionStatus::Pending,
            payload: None,
            created_at,
            deadline: created_at + request.timeout,
        }
    }
}

/// Persistence collaborator for interaction records.
#[async_trait]
pub trait InteractionStore: Send + Sync {
    /// Persists a freshly created interaction.
    async fn create(&self, interaction: UiInteraction) -> EngineResult<()>;

    /// Loads an interaction by id.
    async fn get(&self, id: InteractionId) -> EngineResult<UiInteraction>;

    /// Resolves a pending interaction. Returns `false` without writing
    /// when the interaction already reached a terminal status.
    async fn resolve(
        &self,
        id: InteractionId,
        status: InteractionStatus,
        payload: Option<Value>,
    ) -> EngineResult<bool>;

    /// Marks every pending interaction of an execution as `Cancelled`.
    /// Called when the execution stops before its gates resolve, so no
    /// record stays pending with nothing left to resume. Returns how
    /// many interactions were cancelled.
    async fn cancel_pending(&self, execution_id: ExecutionId) -> EngineResult<usize>;

    /// Deletes terminal interactions created before the cutoff.
    async fn purge_created_before(&self, cutoff: Timestamp) -> EngineResult<usize>;
}

/// Polls the store until the interaction resolves, its deadline passes,
/// or the execution is cancelled.
///
/// A passed deadline is written back as `TimedOut` so external observers
/// see the same terminal status the engine acted on.
pub async fn await_resolution(
    store: &dyn InteractionStore,
    id: InteractionId,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> EngineResult<UiInteraction> {
    loop {
        let interaction = store.get(id).await?;
        if interaction.status.is_terminal() {
            return Ok(interaction);
        }
        if Timestamp::now() > interaction.deadline {
            store.resolve(id, InteractionStatus::TimedOut, None).await?;
            return store.get(id).await;
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

/// In-memory [`InteractionStore`] for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryInteractionStore {
    interactions: std::sync::Mutex<std::collections::HashMap<InteractionId, UiInteraction>>,
}

impl MemoryInteractionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all interactions still awaiting resolution.
    pub fn pending(&self) -> Vec<UiInteraction> {
        self.lock()
            .values()
            .filter(|i| i.status == InteractionStatus::Pending)
            .cloned()
            .collect()
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, std::collections::HashMap<InteractionId, UiInteraction>> {
        match self.interactions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl InteractionStore for MemoryInteractionStore {
    async fn create(&self, interaction: UiInteraction) -> EngineResult<()> {
        self.lock().insert(interaction.id, interaction);
        Ok(())
    }

    async fn get(&self, id: InteractionId) -> EngineResult<UiInteraction> {
        self.lock()
            .get(&id)
            .cloned()
            .ok_or(EngineError::InteractionNotFound(id))
    }

    async fn resolve(
        &self,
        id: InteractionId,
        status: InteractionStatus,
        payload: Option<Value>,
    ) -> EngineResult<bool> {
        let mut interactions = self.lock();
        let interaction = interactions
            .get_mut(&id)
            .ok_or(EngineError::InteractionNotFound(id))?;
        if interaction.status.is_terminal() {
            return Ok(false);
        }
        interaction.status = status;
        interaction.payload = payload;
        Ok(true)
    }

    async fn cancel_pending(&self, execution_id: ExecutionId) -> EngineResult<usize> {
        let mut interactions = self.lock();
        let mut cancelled = 0;
        for interaction in interactions.values_mut() {
            if interaction.execution_id == execution_id
                && interaction.status == InteractionStatus::Pending
            {
                interaction.status = InteractionStatus::Cancelled;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn purge_created_before(&self, cutoff: Timestamp) -> EngineResult<usize> {
        let mut interactions = self.lock();
        let before = interactions.len();
        interactions.retain(|_, i| !(i.status.is_terminal() && i.created_at < cutoff));
        Ok(before - interactions.len())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn request(timeout: Duration) -> InteractionRequest {
        InteractionRequest {
            kind: "approval".to_string(),
            schema: Value::Null,
            timeout,
        }
    }

    #[tokio::test]
    async fn test_resolve_is_single_shot() {
        let store = MemoryInteractionStore::new();
        let interaction = UiInteraction::pending(
            ExecutionId::new(),
            NodeId::new(),
            &request(Duration::from_secs(60)),
        );
        let id = interaction.id;
        store.create(interaction).await.unwrap();

        assert!(
            store
                .resolve(id, InteractionStatus::Completed, Some(json!({"ok": true})))
                .await
                .unwrap()
        );
        assert!(
            !store
                .resolve(id, InteractionStatus::Cancelled, None)
                .await
                .unwrap()
        );
        let interaction = store.get(id).await.unwrap();
        assert_eq!(interaction.status, InteractionStatus::Completed);
        assert_eq!(interaction.payload, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_await_resolution_completes() {
        let store = std::sync::Arc::new(MemoryInteractionStore::new());
        let interaction = UiInteraction::pending(
            ExecutionId::new(),
            NodeId::new(),
            &request(Duration::from_secs(60)),
        );
        let id = interaction.id;
        store.create(interaction).await.unwrap();

        let resolver = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            resolver
                .resolve(id, InteractionStatus::Completed, Some(json!("input")))
                .await
                .unwrap();
        });

        let resolved = await_resolution(
            store.as_ref(),
            id,
            Duration::from_millis(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(resolved.status, InteractionStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_pending_scopes_to_execution() {
        let store = MemoryInteractionStore::new();
        let execution_id = ExecutionId::new();
        let mine = UiInteraction::pending(
            execution_id,
            NodeId::new(),
            &request(Duration::from_secs(60)),
        );
        let other = UiInteraction::pending(
            ExecutionId::new(),
            NodeId::new(),
            &request(Duration::from_secs(60)),
        );
        let mine_id = mine.id;
        let other_id = other.id;
        store.create(mine).await.unwrap();
        store.create(other).await.unwrap();

        assert_eq!(store.cancel_pending(execution_id).await.unwrap(), 1);
        assert_eq!(
            store.get(mine_id).await.unwrap().status,
            InteractionStatus::Cancelled
        );
        assert_eq!(
            store.get(other_id).await.unwrap().status,
            InteractionStatus::Pending
        );
        // Already-terminal records are left alone on a second sweep.
        assert_eq!(store.cancel_pending(execution_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_await_resolution_times_out() {
        let store = MemoryInteractionStore::new();
        let interaction = UiInteraction::pending(
            ExecutionId::new(),
            NodeId::new(),
            &request(Duration::from_millis(20)),
        );
        let id = interaction.id;
        store.create(interaction).await.unwrap();

        let resolved = await_resolution(
            &store,
            id,
            Duration::from_millis(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(resolved.status, InteractionStatus::TimedOut);
    }
}
