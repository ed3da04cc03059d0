//! Control-flow and transform blocks: schedule, delay, condition, transform,
//! calculator

use crate::context::ExecutionContext;
use crate::error::{EngineError, EngineResult};
use crate::handlers::{coerce_f64, require_f64, require_str};
use crate::model::{BlockType, Node};
use crate::registry::BlockHandler;
use crate::sandbox::expr::{self, parse_expression, Evaluator};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Schedule trigger block. Cron evaluation happens upstream (the trigger
/// service enqueues the execution); at run time the block just reports the
/// firing instant downstream.
pub struct ScheduleHandler;

#[async_trait]
impl BlockHandler for ScheduleHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Schedule
    }

    async fn execute(
        &self,
        node: &Node,
        _ctx: &ExecutionContext,
        _input: &Value,
    ) -> EngineResult<Value> {
        // cron is validated at authoring; required here so a schedule block
        // cannot be saved blank
        let _ = require_str(node, "cron")?;
        Ok(json!({ "firedAt": Utc::now().to_rfc3339() }))
    }
}

/// Delay block: sleeps for the configured duration, cancellation-aware.
pub struct DelayHandler;

#[async_trait]
impl BlockHandler for DelayHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Delay
    }

    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        _input: &Value,
    ) -> EngineResult<Value> {
        let millis = require_f64(node, "durationMs")?;
        if millis < 0.0 {
            return Err(EngineError::Config(format!(
                "node {} durationMs must be non-negative",
                node.id
            )));
        }
        let duration = Duration::from_millis(millis as u64);
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
            _ = tokio::time::sleep(duration) => {}
        }
        Ok(json!({ "waitedMs": millis as u64 }))
    }
}

/// Condition block: evaluates a boolean expression over the assembled input
/// and routes downstream on the `true`/`false` handles.
pub struct ConditionHandler;

#[async_trait]
impl BlockHandler for ConditionHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Condition
    }

    async fn execute(
        &self,
        node: &Node,
        _ctx: &ExecutionContext,
        input: &Value,
    ) -> EngineResult<Value> {
        let source = require_str(node, "expression")?;
        let parsed = parse_expression(&source)?;
        let inputs: Map<String, Value> = input.as_object().cloned().unwrap_or_default();
        let value = Evaluator::new(&inputs).eval(&parsed)?;
        let result = expr::truthy(&value);
        Ok(json!({
            "result": result,
            "route": if result { "true" } else { "false" },
        }))
    }
}

/// Transform block: renders a configured template (any JSON shape) against
/// the assembled input.
pub struct TransformHandler;

#[async_trait]
impl BlockHandler for TransformHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Transform
    }

    async fn execute(
        &self,
        node: &Node,
        _ctx: &ExecutionContext,
        input: &Value,
    ) -> EngineResult<Value> {
        let template = node.config.get("template").ok_or_else(|| {
            EngineError::Config(format!("node {} missing required config field \"template\"", node.id))
        })?;
        let value = crate::template::render(template, input);
        Ok(json!({ "value": value }))
    }
}

/// Calculator block: one arithmetic operation over named numeric inputs.
/// Inputs coerce from numeric strings here, at the declared handler site.
pub struct CalculatorHandler;

impl CalculatorHandler {
    fn operand(inputs: &Map<String, Value>, node: &Node, key: &str) -> EngineResult<f64> {
        let value = inputs.get(key).ok_or_else(|| {
            EngineError::Config(format!("node {} calculator input {:?} missing", node.id, key))
        })?;
        coerce_f64(value, &format!("node {} calculator input {:?}", node.id, key))
    }
}

#[async_trait]
impl BlockHandler for CalculatorHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Calculator
    }

    async fn execute(
        &self,
        node: &Node,
        _ctx: &ExecutionContext,
        _input: &Value,
    ) -> EngineResult<Value> {
        let operation = require_str(node, "operation")?;
        let inputs = node
            .config
            .get("inputs")
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| {
                EngineError::Config(format!(
                    "node {} missing required config field \"inputs\"",
                    node.id
                ))
            })?;

        let x = Self::operand(&inputs, node, "x")?;
        let y = Self::operand(&inputs, node, "y")?;

        let result = match operation.as_str() {
            "add" => x + y,
            "subtract" => x - y,
            "multiply" => x * y,
            "divide" => {
                if y == 0.0 {
                    return Err(EngineError::Execution("division by zero".to_string()));
                }
                x / y
            }
            "modulo" => {
                if y == 0.0 {
                    return Err(EngineError::Execution("division by zero".to_string()));
                }
                x % y
            }
            "power" => x.powf(y),
            other => {
                return Err(EngineError::Config(format!(
                    "node {} unknown calculator operation {:?}",
                    node.id, other
                )))
            }
        };

        Ok(json!({ "result": expr::number(result) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CancelSignal, ExecutionLogger};
    use crate::events::EventBus;
    use crate::model::ExecutionId;
    use crate::state::{SharedGateway, SledGateway};
    use std::sync::Arc;

    fn ctx() -> ExecutionContext {
        let gateway: SharedGateway = Arc::new(SledGateway::open_temporary().unwrap());
        let execution_id = ExecutionId::new();
        let logger = ExecutionLogger::new(gateway, EventBus::default(), execution_id);
        ExecutionContext::new(
            execution_id,
            crate::model::WorkflowId::new(),
            CancelSignal::inert(),
            logger,
            json!({}),
        )
    }

    fn node(ty: &str, config: Value) -> Node {
        serde_json::from_value(json!({"id": "n", "blockType": ty, "config": config})).unwrap()
    }

    #[tokio::test]
    async fn calculator_multiplies_with_string_coercion() {
        let n = node(
            "CALCULATOR",
            json!({"operation": "multiply", "inputs": {"x": "2", "y": 3}}),
        );
        let out = CalculatorHandler.execute(&n, &ctx(), &json!({})).await.unwrap();
        assert_eq!(out, json!({"result": 6}));
    }

    #[tokio::test]
    async fn calculator_rejects_unknown_operation() {
        let n = node(
            "CALCULATOR",
            json!({"operation": "cube", "inputs": {"x": 1, "y": 2}}),
        );
        let err = CalculatorHandler.execute(&n, &ctx(), &json!({})).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[tokio::test]
    async fn condition_routes_on_input() {
        let n = node("CONDITION", json!({"expression": "total > 100"}));
        let out = ConditionHandler
            .execute(&n, &ctx(), &json!({"total": 250}))
            .await
            .unwrap();
        assert_eq!(out, json!({"result": true, "route": "true"}));
    }

    #[tokio::test]
    async fn transform_renders_template_shape() {
        let n = node(
            "TRANSFORM",
            json!({"template": {"greeting": "hi {{user.name}}", "count": 3}}),
        );
        let out = TransformHandler
            .execute(&n, &ctx(), &json!({"user": {"name": "ada"}}))
            .await
            .unwrap();
        assert_eq!(out["value"], json!({"greeting": "hi ada", "count": 3}));
    }

    #[tokio::test]
    async fn delay_observes_cancellation() {
        let (handle, signal) = crate::context::cancel_pair();
        let gateway: SharedGateway = Arc::new(SledGateway::open_temporary().unwrap());
        let execution_id = ExecutionId::new();
        let logger = ExecutionLogger::new(gateway, EventBus::default(), execution_id);
        let ctx = ExecutionContext::new(
            execution_id,
            crate::model::WorkflowId::new(),
            signal,
            logger,
            json!({}),
        );
        let n = node("DELAY", json!({"durationMs": 60000}));
        let task = tokio::spawn(async move { DelayHandler.execute(&n, &ctx, &json!({})).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }
}
