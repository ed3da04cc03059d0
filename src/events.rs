//! Execution event bus
//!
//! Status transitions and log events fan out over a broadcast channel so any
//! number of SSE subscribers can follow an execution without reaching into
//! engine state. Lagging subscribers drop oldest events (broadcast
//! semantics); the persisted log remains the source of truth.

use crate::model::{ExecutionId, ExecutionStatus, LogEvent, NodeExecutionStatus, NodeId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// One streamed engine event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExecutionEvent {
    /// Execution status transition
    #[serde(rename_all = "camelCase")]
    Status {
        execution_id: ExecutionId,
        status: ExecutionStatus,
        timestamp: DateTime<Utc>,
    },
    /// Node execution status transition
    #[serde(rename_all = "camelCase")]
    Node {
        execution_id: ExecutionId,
        node_id: NodeId,
        status: NodeExecutionStatus,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },
    /// Log line
    Log(LogEvent),
}

impl ExecutionEvent {
    /// Execution this event belongs to.
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            ExecutionEvent::Status { execution_id, .. }
            | ExecutionEvent::Node { execution_id, .. } => *execution_id,
            ExecutionEvent::Log(event) => event.execution_id,
        }
    }
}

/// Broadcast bus for execution events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Dropped silently when nobody is subscribed.
    pub fn publish(&self, event: ExecutionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn publish_status(&self, execution_id: ExecutionId, status: ExecutionStatus) {
        self.publish(ExecutionEvent::Status {
            execution_id,
            status,
            timestamp: Utc::now(),
        });
    }

    pub fn publish_node(
        &self,
        execution_id: ExecutionId,
        node_id: NodeId,
        status: NodeExecutionStatus,
        attempts: u32,
    ) {
        self.publish(ExecutionEvent::Node {
            execution_id,
            node_id,
            status,
            attempts,
            timestamp: Utc::now(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
