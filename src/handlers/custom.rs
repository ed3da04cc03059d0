//! User-defined (CUSTOM) block, backed by the sandbox

use crate::config::SandboxConfig;
use crate::context::ExecutionContext;
use crate::error::{EngineError, EngineResult};
use crate::handlers::require_str;
use crate::model::{BlockType, Node};
use crate::registry::BlockHandler;
use crate::sandbox::{CustomKind, Sandbox};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Evaluates user-supplied logic of a declared kind against declared inputs.
pub struct CustomHandler {
    sandbox: Sandbox,
}

impl CustomHandler {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            sandbox: Sandbox::new(config),
        }
    }

    /// Declared field names from an `inputs`/`outputs` config list, which
    /// accepts both `["x", "y"]` and `[{"name": "x"}, ...]`.
    fn declared_names(node: &Node, key: &str) -> HashSet<String> {
        node.config
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(s) => Some(s.clone()),
                        Value::Object(map) => map
                            .get("name")
                            .and_then(Value::as_str)
                            .map(|s| s.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl BlockHandler for CustomHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Custom
    }

    fn validate_config(&self, node: &Node) -> EngineResult<()> {
        let kind = require_str(node, "kind")?;
        CustomKind::parse(&kind)?;
        Ok(())
    }

    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        input: &Value,
    ) -> EngineResult<Value> {
        let kind = CustomKind::parse(&require_str(node, "kind")?)?;
        let code = require_str(node, "code")?;
        let declared_inputs = Self::declared_names(node, "inputs");
        let declared_outputs = Self::declared_names(node, "outputs");

        let inputs: Map<String, Value> = input.as_object().cloned().unwrap_or_default();
        let outcome = self
            .sandbox
            .evaluate(kind, &code, &inputs, &declared_inputs)
            .await?;

        // Replay sandbox log lines onto the execution logger
        for (level, line) in outcome.logs {
            ctx.logger.log(level, line, None).await;
        }

        // Declared outputs must all be present in the produced map
        if let Some(map) = outcome.output.as_object() {
            for name in &declared_outputs {
                if !map.contains_key(name) {
                    return Err(EngineError::Config(format!(
                        "node {} did not produce declared output {:?}",
                        node.id, name
                    )));
                }
            }
        }

        Ok(outcome.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CancelSignal, ExecutionLogger};
    use crate::events::EventBus;
    use crate::model::ExecutionId;
    use crate::state::{SharedGateway, SledGateway};
    use serde_json::json;
    use std::sync::Arc;

    fn ctx() -> (ExecutionContext, SharedGateway) {
        let gateway: SharedGateway = Arc::new(SledGateway::open_temporary().unwrap());
        let execution_id = ExecutionId::new();
        let logger = ExecutionLogger::new(gateway.clone(), EventBus::default(), execution_id);
        (
            ExecutionContext::new(
                execution_id,
                crate::model::WorkflowId::new(),
                CancelSignal::inert(),
                logger,
                json!({}),
            ),
            gateway,
        )
    }

    fn handler() -> CustomHandler {
        CustomHandler::new(&SandboxConfig::default())
    }

    #[tokio::test]
    async fn expression_kind_produces_result() {
        let node: Node = serde_json::from_value(json!({
            "id": "c",
            "blockType": "CUSTOM",
            "config": {
                "kind": "expression",
                "code": "amount * rate",
                "inputs": ["amount", "rate"],
                "outputs": ["result"],
            },
        }))
        .unwrap();
        let (ctx, _gw) = ctx();
        let out = handler()
            .execute(&node, &ctx, &json!({"amount": 100, "rate": 0.5}))
            .await
            .unwrap();
        assert_eq!(out, json!({"result": 50}));
    }

    #[tokio::test]
    async fn sandbox_logs_reach_the_execution_log() {
        let node: Node = serde_json::from_value(json!({
            "id": "c",
            "blockType": "CUSTOM",
            "config": {
                "kind": "script",
                "code": "log('seen', n); return n + 1;",
                "inputs": ["n"],
            },
        }))
        .unwrap();
        let (ctx, gateway) = ctx();
        let out = handler()
            .execute(&node, &ctx, &json!({"n": 1}))
            .await
            .unwrap();
        assert_eq!(out, json!({"result": 2}));
        let logs = gateway.list_logs(ctx.execution_id, 10).await.unwrap();
        assert!(logs.iter().any(|l| l.message == "seen 1"));
    }

    #[tokio::test]
    async fn bad_kind_is_config_error() {
        let node: Node = serde_json::from_value(json!({
            "id": "c",
            "blockType": "CUSTOM",
            "config": {"kind": "macro", "code": "1"},
        }))
        .unwrap();
        let (ctx, _gw) = ctx();
        let err = handler().execute(&node, &ctx, &json!({})).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[tokio::test]
    async fn missing_declared_output_fails() {
        let node: Node = serde_json::from_value(json!({
            "id": "c",
            "blockType": "CUSTOM",
            "config": {
                "kind": "expression",
                "code": "1 + 1",
                "outputs": ["total"],
            },
        }))
        .unwrap();
        let (ctx, _gw) = ctx();
        let err = handler().execute(&node, &ctx, &json!({})).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }
}
