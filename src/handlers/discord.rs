//! Discord webhook block

use crate::context::ExecutionContext;
use crate::error::{EngineError, EngineResult};
use crate::handlers::{opt_str, require_str, with_cancel};
use crate::model::{BlockType, Node};
use crate::registry::BlockHandler;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

/// Posts a message to a Discord channel webhook.
pub struct DiscordHandler {
    client: Client,
}

impl DiscordHandler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BlockHandler for DiscordHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Discord
    }

    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        _input: &Value,
    ) -> EngineResult<Value> {
        let webhook_url = require_str(node, "webhookUrl")?;
        let content = require_str(node, "content")?;

        let mut payload = json!({ "content": content });
        if let Some(username) = opt_str(node, "username") {
            payload["username"] = Value::String(username);
        }

        let response = with_cancel(ctx, async {
            self.client
                .post(&webhook_url)
                .json(&payload)
                .send()
                .await
                .map_err(|e| EngineError::Execution(format!("network error: {}", e)))
        })
        .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(EngineError::Execution(
                "rate limit: discord webhook returned 429".to_string(),
            ));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Execution(format!(
                "discord webhook returned {}: {}",
                status, body
            )));
        }

        Ok(json!({ "delivered": true }))
    }
}
