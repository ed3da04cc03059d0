//! Email and notification blocks
//!
//! Delivery channels are external collaborators; the handlers validate,
//! compose, and hand off through the injected port.

use crate::context::ExecutionContext;
use crate::error::EngineResult;
use crate::handlers::{opt_str, require_str, with_cancel, EmailSender, NotificationSink};
use crate::model::{BlockType, Node};
use crate::registry::BlockHandler;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Email block.
pub struct EmailHandler {
    mailer: Arc<dyn EmailSender>,
}

impl EmailHandler {
    pub fn new(mailer: Arc<dyn EmailSender>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl BlockHandler for EmailHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Email
    }

    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        _input: &Value,
    ) -> EngineResult<Value> {
        let to = require_str(node, "to")?;
        let subject = require_str(node, "subject")?;
        let body = opt_str(node, "body").unwrap_or_default();

        let message_id =
            with_cancel(ctx, self.mailer.send(&to, &subject, &body)).await?;

        Ok(json!({
            "delivered": true,
            "messageId": message_id,
        }))
    }
}

/// Notification block.
pub struct NotificationHandler {
    sink: Arc<dyn NotificationSink>,
}

impl NotificationHandler {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl BlockHandler for NotificationHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Notification
    }

    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        _input: &Value,
    ) -> EngineResult<Value> {
        let title = require_str(node, "title")?;
        let message = opt_str(node, "message").unwrap_or_default();
        let channel = opt_str(node, "channel").unwrap_or_else(|| "default".to_string());

        with_cancel(ctx, self.sink.notify(&title, &message, &channel)).await?;

        Ok(json!({ "delivered": true }))
    }
}

/// Development mailer: logs the delivery and succeeds.
pub struct LogMailer;

#[async_trait]
impl EmailSender for LogMailer {
    async fn send(&self, to: &str, subject: &str, _body: &str) -> EngineResult<String> {
        let message_id = format!("log-{}", Uuid::new_v4());
        info!(%to, %subject, %message_id, "email delivery (log mailer)");
        Ok(message_id)
    }
}

/// Development notifier: logs the notification and succeeds.
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, title: &str, message: &str, channel: &str) -> EngineResult<()> {
        info!(%title, %message, %channel, "notification delivery (log notifier)");
        Ok(())
    }
}
