//! Per-execution context passed through every call
//!
//! Replaces ambient globals: ids, the cooperative cancellation signal, the
//! execution-scoped logger, and trigger variables all travel together.

use crate::events::{EventBus, ExecutionEvent};
use crate::model::{ExecutionId, LogEvent, LogLevel, NodeId, WorkflowId};
use crate::state::SharedGateway;
use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Cancellation sender, held by the coordinator.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Flip the signal. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
            _keepalive: None,
        }
    }
}

/// Cancellation receiver, checked at every suspension point.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
    /// Keeps an inert signal's sender alive so `cancelled()` pends instead of erroring
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

impl CancelSignal {
    /// Non-blocking check.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation is observed. Never resolves spuriously: if
    /// the handle is dropped without cancelling, this pends forever.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }

    /// A signal that never fires, for contexts outside a live execution.
    pub fn inert() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _keepalive: Some(Arc::new(tx)),
        }
    }
}

/// Create a linked cancel handle/signal pair.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (
        CancelHandle { tx },
        CancelSignal {
            rx,
            _keepalive: None,
        },
    )
}

/// Execution-scoped logger. Writes rows through the gateway, mirrors onto the
/// event bus, and echoes to `tracing`. Row-write failures never propagate.
#[derive(Clone)]
pub struct ExecutionLogger {
    gateway: SharedGateway,
    bus: EventBus,
    execution_id: ExecutionId,
    node_id: Option<NodeId>,
    seq: Arc<AtomicU64>,
}

impl ExecutionLogger {
    pub fn new(gateway: SharedGateway, bus: EventBus, execution_id: ExecutionId) -> Self {
        Self {
            gateway,
            bus,
            execution_id,
            node_id: None,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Logger scoped to one node; shares the execution's sequence counter so
    /// events stay totally ordered per execution.
    pub fn for_node(&self, node_id: NodeId) -> Self {
        Self {
            node_id: Some(node_id),
            ..self.clone()
        }
    }

    pub async fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message.into(), None).await;
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message.into(), None).await;
    }

    pub async fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message.into(), None).await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message.into(), None).await;
    }

    pub async fn log(&self, level: LogLevel, message: String, data: Option<Value>) {
        let event = LogEvent {
            execution_id: self.execution_id,
            node_id: self.node_id.clone(),
            level,
            message,
            data,
            timestamp: Utc::now(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        match level {
            LogLevel::Debug => tracing::debug!(
                execution = %self.execution_id,
                node = self.node_id.as_deref().unwrap_or("-"),
                "{}", event.message
            ),
            LogLevel::Info => tracing::info!(
                execution = %self.execution_id,
                node = self.node_id.as_deref().unwrap_or("-"),
                "{}", event.message
            ),
            LogLevel::Warn => tracing::warn!(
                execution = %self.execution_id,
                node = self.node_id.as_deref().unwrap_or("-"),
                "{}", event.message
            ),
            LogLevel::Error => tracing::error!(
                execution = %self.execution_id,
                node = self.node_id.as_deref().unwrap_or("-"),
                "{}", event.message
            ),
        }
        self.bus.publish(ExecutionEvent::Log(event.clone()));
        // A log row that fails to persist must never fail the execution
        if let Err(err) = self.gateway.append_log_event(&event).await {
            tracing::warn!(execution = %self.execution_id, error = %err, "log row write failed");
        }
    }
}

/// Everything a handler or executor needs about the execution it runs in.
#[derive(Clone)]
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub cancel: CancelSignal,
    pub logger: ExecutionLogger,
    /// Trigger payload, read-only
    pub variables: Arc<Value>,
}

impl ExecutionContext {
    pub fn new(
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        cancel: CancelSignal,
        logger: ExecutionLogger,
        variables: Value,
    ) -> Self {
        Self {
            execution_id,
            workflow_id,
            cancel,
            logger,
            variables: Arc::new(variables),
        }
    }

    /// Context narrowed to one node (scopes the logger).
    pub fn for_node(&self, node_id: NodeId) -> Self {
        Self {
            logger: self.logger.for_node(node_id),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_signal_observes_handle() {
        let (handle, signal) = cancel_pair();
        assert!(!signal.is_cancelled());
        handle.cancel();
        assert!(signal.is_cancelled());
        // resolves immediately once set
        signal.cancelled().await;
    }

    #[tokio::test]
    async fn inert_signal_never_fires() {
        let signal = CancelSignal::inert();
        assert!(!signal.is_cancelled());
        let timed = tokio::time::timeout(std::time::Duration::from_millis(20), signal.cancelled());
        assert!(timed.await.is_err());
    }
}
