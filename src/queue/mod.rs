//! Durable execution queue
//!
//! A FIFO of execution ids persisted through the gateway: at-least-once
//! delivery with per-message acknowledgement and a visibility timeout.
//! Unacked leases expire and the message becomes deliverable again, so a
//! crashed worker's executions are picked up after restart. Deduplication is
//! by execution id.

use crate::config::QueueConfig;
use crate::error::EngineResult;
use crate::model::ExecutionId;
use crate::state::{QueueMessage, SharedGateway};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// A leased message. The worker must `ack` after the execution reaches a
/// safe point; dropping the lease without acking lets it expire and
/// redeliver.
#[derive(Debug, Clone)]
pub struct Lease {
    pub execution_id: ExecutionId,
    pub deliveries: u32,
}

/// Durable execution queue over the persistence gateway.
pub struct ExecutionQueue {
    gateway: SharedGateway,
    config: QueueConfig,
    notify: Arc<Notify>,
}

impl ExecutionQueue {
    pub fn new(gateway: SharedGateway, config: QueueConfig) -> Self {
        Self {
            gateway,
            config,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Prefetch cap: concurrent in-flight executions per worker process.
    pub fn prefetch(&self) -> usize {
        self.config.prefetch.max(1)
    }

    /// Enqueue an execution. Returns false when it was already queued.
    pub async fn enqueue(&self, execution_id: ExecutionId) -> EngineResult<bool> {
        let inserted = self
            .gateway
            .queue_put(&QueueMessage {
                execution_id,
                enqueued_at: Utc::now(),
                deliveries: 0,
                leased_until: None,
            })
            .await?;
        if inserted {
            debug!(execution = %execution_id, "execution enqueued");
            self.notify.notify_waiters();
        }
        Ok(inserted)
    }

    /// Receive the next deliverable message, waiting until one is available.
    /// The returned lease is invisible to other receivers until the
    /// visibility timeout elapses.
    pub async fn receive(&self) -> EngineResult<Lease> {
        loop {
            if let Some(lease) = self.try_receive().await? {
                return Ok(lease);
            }
            // Wake on enqueue, or poll for expired leases
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
    }

    /// Non-blocking receive.
    pub async fn try_receive(&self) -> EngineResult<Option<Lease>> {
        let now = Utc::now();
        let visibility = ChronoDuration::from_std(self.config.visibility_timeout)
            .unwrap_or_else(|_| ChronoDuration::seconds(300));
        for mut message in self.gateway.queue_scan().await? {
            let leased = message
                .leased_until
                .map(|until| until > now)
                .unwrap_or(false);
            if leased {
                continue;
            }
            message.deliveries += 1;
            message.leased_until = Some(now + visibility);
            self.gateway.queue_update(&message).await?;
            return Ok(Some(Lease {
                execution_id: message.execution_id,
                deliveries: message.deliveries,
            }));
        }
        Ok(None)
    }

    /// Acknowledge and delete a message.
    pub async fn ack(&self, execution_id: ExecutionId) -> EngineResult<()> {
        self.gateway.queue_remove(execution_id).await?;
        Ok(())
    }

    /// Return a message to the queue immediately (worker giving up early).
    pub async fn nack(&self, execution_id: ExecutionId) -> EngineResult<()> {
        for mut message in self.gateway.queue_scan().await? {
            if message.execution_id == execution_id {
                message.leased_until = None;
                self.gateway.queue_update(&message).await?;
                self.notify.notify_waiters();
                break;
            }
        }
        Ok(())
    }

    /// Startup recovery: re-enqueue executions that were pending or running
    /// when the process last stopped.
    pub async fn recover(&self) -> EngineResult<usize> {
        let mut recovered = 0;
        for execution_id in self.gateway.list_ready_executions().await? {
            if self.enqueue(execution_id).await? {
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}
