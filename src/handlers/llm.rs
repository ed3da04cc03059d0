//! LLM prompt block

use crate::context::ExecutionContext;
use crate::error::{EngineError, EngineResult};
use crate::handlers::{opt_str, require_str, with_cancel, PromptClient};
use crate::model::{BlockType, Node};
use crate::registry::BlockHandler;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

const DEFAULT_MODEL: &str = "default";

/// Sends the (already template-resolved) prompt to the provider and returns
/// the completion.
pub struct LlmPromptHandler {
    client: Arc<dyn PromptClient>,
}

impl LlmPromptHandler {
    pub fn new(client: Arc<dyn PromptClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BlockHandler for LlmPromptHandler {
    fn block_type(&self) -> BlockType {
        BlockType::LlmPrompt
    }

    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        _input: &Value,
    ) -> EngineResult<Value> {
        let prompt = require_str(node, "prompt")?;
        let model = opt_str(node, "model").unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let max_tokens = node
            .config
            .get("maxTokens")
            .and_then(Value::as_u64);

        let completion =
            with_cancel(ctx, self.client.complete(&model, &prompt, max_tokens)).await?;

        Ok(json!({
            "completion": completion,
            "model": model,
        }))
    }
}

/// Placeholder provider until a deployment injects a real one.
pub struct DisconnectedPromptClient;

#[async_trait]
impl PromptClient for DisconnectedPromptClient {
    async fn complete(
        &self,
        _model: &str,
        _prompt: &str,
        _max_tokens: Option<u64>,
    ) -> EngineResult<String> {
        Err(EngineError::Execution(
            "no LLM provider configured".to_string(),
        ))
    }
}
