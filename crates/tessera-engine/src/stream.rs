//! Execution lifecycle event streaming.
//!
//! One publisher per execution (the scheduler task) pushes events into a
//! per-execution broadcast channel. A bounded recent-history ring lets a
//! late subscriber catch up on what it missed. Delivery is best-effort
//! and at-most-once; publish failures are logged and never affect the
//! execution itself.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tessera_sandbox::ResourceUsage;
use tokio::sync::broadcast;

use crate::TRACING_TARGET;
use crate::execution::{ExecutionStatus, NodeStatus};
use crate::graph::{ExecutionId, NodeId};

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutputChannel {
    Stdout,
    Stderr,
}

/// A lifecycle event published while an execution runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// The execution entered Running.
    Started {
        execution_id: ExecutionId,
        timestamp: Timestamp,
    },
    /// A node's status changed.
    NodeStatusChanged {
        execution_id: ExecutionId,
        node_id: NodeId,
        status: NodeStatus,
        timestamp: Timestamp,
    },
    /// Captured program output.
    OutputChunk {
        execution_id: ExecutionId,
        node_id: NodeId,
        channel: OutputChannel,
        chunk: String,
    },
    /// Progress percentage / phase advanced.
    ProgressUpdate {
        execution_id: ExecutionId,
        percent: u8,
        phase: usize,
    },
    /// Resource usage observed for a node attempt.
    ResourceUsageSample {
        execution_id: ExecutionId,
        node_id: NodeId,
        usage: ResourceUsage,
    },
    /// The execution reached a terminal status.
    Completed {
        execution_id: ExecutionId,
        status: ExecutionStatus,
        timestamp: Timestamp,
    },
}

impl ExecutionEvent {
    /// Returns the execution this event belongs to.
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            ExecutionEvent::Started { execution_id, .. }
            | ExecutionEvent::NodeStatusChanged { execution_id, .. }
            | ExecutionEvent::OutputChunk { execution_id, .. }
            | ExecutionEvent::ProgressUpdate { execution_id, .. }
            | ExecutionEvent::ResourceUsageSample { execution_id, .. }
            | ExecutionEvent::Completed { execution_id, .. } => *execution_id,
        }
    }
}

struct ExecutionChannel {
    tx: broadcast::Sender<ExecutionEvent>,
    history: VecDeque<ExecutionEvent>,
}

/// Per-execution event publisher with bounded history.
#[derive(Debug)]
pub struct EventStreamer {
    channels: Mutex<HashMap<ExecutionId, ExecutionChannel>>,
    /// Broadcast channel capacity per execution.
    channel_capacity: usize,
    /// Recent-history ring capacity per execution; oldest evicted.
    history_capacity: usize,
}

impl std::fmt::Debug for ExecutionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionChannel")
            .field("history_len", &self.history.len())
            .finish()
    }
}

impl EventStreamer {
    /// Default broadcast capacity per execution.
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;
    /// Default recent-history capacity per execution.
    pub const DEFAULT_HISTORY_CAPACITY: usize = 128;

    /// Creates a streamer with default capacities.
    pub fn new() -> Self {
        Self::with_capacities(Self::DEFAULT_CHANNEL_CAPACITY, Self::DEFAULT_HISTORY_CAPACITY)
    }

    /// Creates a streamer with explicit capacities.
    pub fn with_capacities(channel_capacity: usize, history_capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            channel_capacity: channel_capacity.max(1),
            history_capacity: history_capacity.max(1),
        }
    }

    /// Publishes an event to the execution's subscribers and records it
    /// in the history ring. Never fails: a lagging or absent subscriber
    /// is an observability concern, not a correctness one.
    pub fn publish(&self, event: ExecutionEvent) {
        let execution_id = event.execution_id();
        let mut channels = match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let channel = channels
            .entry(execution_id)
            .or_insert_with(|| ExecutionChannel {
                tx: broadcast::channel(self.channel_capacity).0,
                history: VecDeque::with_capacity(self.history_capacity),
            });

        if channel.history.len() == self.history_capacity {
            channel.history.pop_front();
        }
        channel.history.push_back(event.clone());

        if let Err(err) = channel.tx.send(event) {
            // No live subscribers; the history ring still serves
            // late-comers.
            tracing::trace!(
                target: TRACING_TARGET,
                execution_id = %execution_id,
                error = %err,
                "Event published with no subscribers"
            );
        }
    }

    /// Subscribes to an execution's events, returning the retained recent
    /// history followed by a live receiver.
    pub fn subscribe(
        &self,
        execution_id: ExecutionId,
    ) -> (Vec<ExecutionEvent>, broadcast::Receiver<ExecutionEvent>) {
        let mut channels = match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let channel = channels
            .entry(execution_id)
            .or_insert_with(|| ExecutionChannel {
                tx: broadcast::channel(self.channel_capacity).0,
                history: VecDeque::with_capacity(self.history_capacity),
            });
        (
            channel.history.iter().cloned().collect(),
            channel.tx.subscribe(),
        )
    }

    /// Drops an execution's channel and history, typically after the
    /// execution record itself is purged.
    pub fn forget(&self, execution_id: ExecutionId) {
        let mut channels = match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels.remove(&execution_id);
    }
}

impl Default for EventStreamer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(execution_id: ExecutionId) -> ExecutionEvent {
        ExecutionEvent::Started {
            execution_id,
            timestamp: Timestamp::now(),
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_published_events() {
        let streamer = EventStreamer::new();
        let execution_id = ExecutionId::new();

        let (history, mut rx) = streamer.subscribe(execution_id);
        assert!(history.is_empty());

        streamer.publish(started(execution_id));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.execution_id(), execution_id);
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_history() {
        let streamer = EventStreamer::new();
        let execution_id = ExecutionId::new();

        streamer.publish(started(execution_id));
        let (history, _rx) = streamer.subscribe(execution_id);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_history_evicts_oldest() {
        let streamer = EventStreamer::with_capacities(16, 2);
        let execution_id = ExecutionId::new();

        for percent in 0..4u8 {
            streamer.publish(ExecutionEvent::ProgressUpdate {
                execution_id,
                percent,
                phase: 0,
            });
        }
        let (history, _rx) = streamer.subscribe(execution_id);
        assert_eq!(history.len(), 2);
        assert!(matches!(
            history[0],
            ExecutionEvent::ProgressUpdate { percent: 2, .. }
        ));
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let streamer = EventStreamer::new();
        streamer.publish(started(ExecutionId::new()));
    }
}
