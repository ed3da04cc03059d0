//! Handler registry and the handler contract
//!
//! Maps block types to handler values. Every registered handler is wrapped in
//! the [`Metered`] decorator, which records timing and outcome regardless of
//! what the inner handler does. A missing block type resolves to the unknown
//! handler, which fails with a config error.

use crate::context::ExecutionContext;
use crate::error::{EngineError, EngineResult};
use crate::model::{BlockSchema, BlockType, Node};
use crate::resilience::BreakerKey;
use crate::state::{BlockExecution, SharedGateway};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Contract every block implements.
///
/// Handlers are side-effect-bearing and may call external systems, but must
/// never mutate their inputs, and must honor the context's cancellation
/// signal on all blocking I/O. Error messages should surface the raw
/// provider text so the retry classifier can pattern-match it.
#[async_trait]
pub trait BlockHandler: Send + Sync {
    fn block_type(&self) -> BlockType;

    fn schema(&self) -> BlockSchema {
        self.block_type().schema()
    }

    /// Extra config validation beyond the declared schema.
    fn validate_config(&self, _node: &Node) -> EngineResult<()> {
        Ok(())
    }

    /// Circuit breaker key for this node, when the handler opts in. The node
    /// config may disable it (`useCircuitBreaker: false`) or override the
    /// scope (`scope`).
    fn breaker_key(&self, _node: &Node) -> Option<BreakerKey> {
        None
    }

    /// Run the block against its materialized config and assembled input,
    /// producing the output map.
    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        input: &Value,
    ) -> EngineResult<Value>;
}

/// Metrics decorator around a handler. Emits lifecycle log events, `metrics`
/// counters and histograms, and appends a `block_executions` audit row.
pub struct Metered {
    inner: Arc<dyn BlockHandler>,
    gateway: SharedGateway,
}

impl Metered {
    pub fn new(inner: Arc<dyn BlockHandler>, gateway: SharedGateway) -> Self {
        Self { inner, gateway }
    }
}

#[async_trait]
impl BlockHandler for Metered {
    fn block_type(&self) -> BlockType {
        self.inner.block_type()
    }

    fn schema(&self) -> BlockSchema {
        self.inner.schema()
    }

    fn validate_config(&self, node: &Node) -> EngineResult<()> {
        self.inner.validate_config(node)
    }

    fn breaker_key(&self, node: &Node) -> Option<BreakerKey> {
        self.inner.breaker_key(node)
    }

    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        input: &Value,
    ) -> EngineResult<Value> {
        let block_type = self.block_type().to_string();
        let started_at = Utc::now();
        let clock = Instant::now();
        ctx.logger
            .debug(format!("{} handler started", block_type))
            .await;

        let result = self.inner.execute(node, ctx, input).await;

        let elapsed = clock.elapsed();
        let success = result.is_ok();
        metrics::counter!(
            "block_executions_total",
            "block_type" => block_type.clone(),
            "outcome" => if success { "success" } else { "failure" },
        )
        .increment(1);
        metrics::histogram!(
            "block_execution_duration_seconds",
            "block_type" => block_type.clone(),
        )
        .record(elapsed.as_secs_f64());

        match &result {
            Ok(_) => {
                ctx.logger
                    .info(format!(
                        "{} handler finished in {}ms",
                        block_type,
                        elapsed.as_millis()
                    ))
                    .await;
            }
            Err(err) => {
                ctx.logger
                    .error(format!("{} handler failed: {}", block_type, err))
                    .await;
            }
        }

        let row = BlockExecution {
            execution_id: ctx.execution_id,
            node_id: node.id.clone(),
            block_type,
            started_at,
            finished_at: Utc::now(),
            duration_ms: elapsed.as_millis() as u64,
            success,
            error: result.as_ref().err().map(|e| e.to_string()),
        };
        // Audit rows follow log-write rules: never fail the execution
        if let Err(err) = self.gateway.append_block_execution(&row).await {
            tracing::warn!(node = %node.id, error = %err, "block execution row write failed");
        }

        result
    }
}

/// Fallback handler for unrecognized block types.
pub struct UnknownHandler;

#[async_trait]
impl BlockHandler for UnknownHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Unknown
    }

    async fn execute(
        &self,
        node: &Node,
        _ctx: &ExecutionContext,
        _input: &Value,
    ) -> EngineResult<Value> {
        Err(EngineError::Config(format!(
            "no handler registered for block type of node {}",
            node.id
        )))
    }
}

/// Block-type to handler map. All lookups return metered handlers.
pub struct HandlerRegistry {
    handlers: HashMap<BlockType, Arc<dyn BlockHandler>>,
    unknown: Arc<dyn BlockHandler>,
    gateway: SharedGateway,
}

impl HandlerRegistry {
    pub fn new(gateway: SharedGateway) -> Self {
        let unknown: Arc<dyn BlockHandler> =
            Arc::new(Metered::new(Arc::new(UnknownHandler), gateway.clone()));
        Self {
            handlers: HashMap::new(),
            unknown,
            gateway,
        }
    }

    /// Register a handler under its own block type, wrapped in the metrics
    /// decorator. Re-registering a type replaces the previous handler.
    pub fn register(&mut self, handler: Arc<dyn BlockHandler>) {
        let block_type = handler.block_type();
        let metered = Arc::new(Metered::new(handler, self.gateway.clone()));
        self.handlers.insert(block_type, metered);
    }

    /// Resolve a block type; unknown types get the unknown handler.
    pub fn get(&self, block_type: BlockType) -> Arc<dyn BlockHandler> {
        self.handlers
            .get(&block_type)
            .cloned()
            .unwrap_or_else(|| self.unknown.clone())
    }

    pub fn registered_types(&self) -> Vec<BlockType> {
        self.handlers.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CancelSignal, ExecutionLogger};
    use crate::events::EventBus;
    use crate::model::ExecutionId;
    use crate::state::SledGateway;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl BlockHandler for EchoHandler {
        fn block_type(&self) -> BlockType {
            BlockType::Transform
        }

        async fn execute(
            &self,
            _node: &Node,
            _ctx: &ExecutionContext,
            input: &Value,
        ) -> EngineResult<Value> {
            Ok(input.clone())
        }
    }

    fn test_context(gateway: SharedGateway) -> ExecutionContext {
        let execution_id = ExecutionId::new();
        let bus = EventBus::default();
        let logger = ExecutionLogger::new(gateway, bus, execution_id);
        ExecutionContext::new(
            execution_id,
            crate::model::WorkflowId::new(),
            CancelSignal::inert(),
            logger,
            json!({}),
        )
    }

    fn node() -> Node {
        serde_json::from_value(json!({"id": "n", "blockType": "TRANSFORM", "config": {}})).unwrap()
    }

    #[tokio::test]
    async fn unknown_type_resolves_to_config_error() {
        let gateway: SharedGateway = Arc::new(SledGateway::open_temporary().unwrap());
        let registry = HandlerRegistry::new(gateway.clone());
        let handler = registry.get(BlockType::Email);
        let err = handler
            .execute(&node(), &test_context(gateway), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[tokio::test]
    async fn registered_handler_is_metered() {
        let gateway: SharedGateway = Arc::new(SledGateway::open_temporary().unwrap());
        let mut registry = HandlerRegistry::new(gateway.clone());
        registry.register(Arc::new(EchoHandler));
        let ctx = test_context(gateway.clone());
        let out = registry
            .get(BlockType::Transform)
            .execute(&node(), &ctx, &json!({"a": 1}))
            .await
            .unwrap();
        assert_eq!(out, json!({"a": 1}));
        // decorator emitted lifecycle logs independent of the handler
        let logs = gateway.list_logs(ctx.execution_id, 100).await.unwrap();
        assert!(logs.iter().any(|l| l.message.contains("handler finished")));
    }
}
