//! Per-node executor
//!
//! Runs one (execution, node) pair through the pipeline: pause check, input
//! materialization, input validation, dispatch under a per-attempt timeout,
//! retry with backoff on recoverable failures, output validation, persist.

use crate::config::ExecutorConfig;
use crate::context::ExecutionContext;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::events::EventBus;
use crate::model::{
    ErrorInfo, FieldSpec, Node, NodeExecution, NodeExecutionStatus,
};
use crate::registry::HandlerRegistry;
use crate::resilience::{CircuitBreaker, RetryPolicy};
use crate::state::SharedGateway;
use crate::template;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one node run, as seen by the scheduler.
#[derive(Debug)]
pub enum NodeOutcome {
    /// Output map produced (or replayed from a previous successful run)
    Succeeded(Value),
    /// A pause record short-circuited the node; its subtree stays parked
    Paused,
    /// Fatal for this node; the error's kind tells the scheduler why
    Failed(EngineError),
}

/// Executes single nodes. Shared by all of an execution's node tasks.
pub struct NodeExecutor {
    gateway: SharedGateway,
    registry: Arc<HandlerRegistry>,
    breaker: Arc<CircuitBreaker>,
    bus: EventBus,
    config: ExecutorConfig,
}

impl NodeExecutor {
    pub fn new(
        gateway: SharedGateway,
        registry: Arc<HandlerRegistry>,
        breaker: Arc<CircuitBreaker>,
        bus: EventBus,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            gateway,
            registry,
            breaker,
            bus,
            config,
        }
    }

    /// Run one node with its assembled input.
    pub async fn execute_node(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        input: Value,
    ) -> NodeOutcome {
        let ctx = ctx.for_node(node.id.clone());
        match self.execute_node_inner(node, &ctx, input).await {
            Ok(Some(output)) => NodeOutcome::Succeeded(output),
            Ok(None) => NodeOutcome::Paused,
            Err(err) => NodeOutcome::Failed(err),
        }
    }

    /// `Ok(Some(output))` on success, `Ok(None)` when paused.
    async fn execute_node_inner(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        input: Value,
    ) -> EngineResult<Option<Value>> {
        // Replay: a row that already succeeded (resume after pause/retry)
        // short-circuits with its recorded output.
        if let Some(existing) = self
            .gateway
            .get_node_execution(ctx.execution_id, &node.id)
            .await?
        {
            if existing.status == NodeExecutionStatus::Succeeded {
                return Ok(Some(existing.output));
            }
        }

        // Pause check comes before any work
        if self
            .gateway
            .get_pause(ctx.execution_id, Some(&node.id))
            .await?
            .is_some()
        {
            let row = self.ensure_row(node, ctx, &input).await?;
            self.gateway
                .update_node_execution_status(row.id, NodeExecutionStatus::Paused, row.attempts, None)
                .await?;
            self.bus
                .publish_node(ctx.execution_id, node.id.clone(), NodeExecutionStatus::Paused, row.attempts);
            ctx.logger.info(format!("node {} paused", node.id)).await;
            return Ok(None);
        }

        // Input materialization: resolve templates in config and input
        // against the assembled input map (trigger variables reachable
        // under `variables`).
        let mut scope = input.as_object().cloned().unwrap_or_default();
        scope.insert("variables".to_string(), (*ctx.variables).clone());
        let scope = Value::Object(scope);
        let resolved_input = template::render(&input, &scope);
        let mut resolved = node.clone();
        resolved.config = match template::render(&Value::Object(node.config.clone()), &scope) {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        let handler = self.registry.get(resolved.block_type);
        let schema = handler.schema();
        let row = self.ensure_row(node, ctx, &resolved_input).await?;

        // Input schema validation: missing required is a config failure,
        // persisted on the row like every other failure kind
        if let Err(msg) = validate_fields(&resolved_input, &schema.inputs, "input") {
            return self
                .fail_row(&row, ctx, row.attempts, EngineError::Config(msg))
                .await;
        }
        if let Err(err) = handler.validate_config(&resolved) {
            return self.fail_row(&row, ctx, row.attempts, err).await;
        }

        let policy = self.retry_policy(&resolved);
        let timeout = self.node_timeout(&resolved);
        let breaker_key = handler.breaker_key(&resolved);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.gateway
                .update_node_execution_status(row.id, NodeExecutionStatus::Running, attempt, None)
                .await?;
            self.bus.publish_node(
                ctx.execution_id,
                node.id.clone(),
                NodeExecutionStatus::Running,
                attempt,
            );

            let result = self
                .attempt(&resolved, ctx, &resolved_input, &handler, timeout, breaker_key.as_ref())
                .await;

            match result {
                Ok(output) => {
                    if let Err(msg) = validate_fields(&output, &schema.outputs, "output") {
                        return self
                            .fail_row(&row, ctx, attempt, EngineError::Validation(msg))
                            .await;
                    }
                    self.gateway
                        .set_node_execution_output(row.id, output.clone())
                        .await?;
                    self.gateway
                        .update_node_execution_status(
                            row.id,
                            NodeExecutionStatus::Succeeded,
                            attempt,
                            None,
                        )
                        .await?;
                    self.bus.publish_node(
                        ctx.execution_id,
                        node.id.clone(),
                        NodeExecutionStatus::Succeeded,
                        attempt,
                    );
                    return Ok(Some(output));
                }
                Err(err) => {
                    if policy.should_retry(&err, attempt) && !ctx.cancel.is_cancelled() {
                        let delay = policy.backoff(attempt);
                        ctx.logger
                            .warn(format!(
                                "node {} attempt {}/{} failed ({}), retrying in {}ms",
                                node.id,
                                attempt,
                                policy.max_attempts,
                                err,
                                delay.as_millis()
                            ))
                            .await;
                        tokio::select! {
                            biased;
                            _ = ctx.cancel.cancelled() => {
                                return self.fail_row(&row, ctx, attempt, EngineError::Cancelled)
                                    .await;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }
                    return self.fail_row(&row, ctx, attempt, err).await;
                }
            }
        }
    }

    /// One dispatch attempt: breaker gate, handler call, timeout, breaker
    /// accounting.
    async fn attempt(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        input: &Value,
        handler: &Arc<dyn crate::registry::BlockHandler>,
        timeout: Duration,
        breaker_key: Option<&crate::resilience::BreakerKey>,
    ) -> EngineResult<Value> {
        if ctx.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if let Some(key) = breaker_key {
            self.breaker.check(key).await?;
        }

        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(EngineError::Cancelled),
            dispatched = tokio::time::timeout(timeout, handler.execute(node, ctx, input)) => {
                match dispatched {
                    Ok(inner) => inner,
                    Err(_) => Err(EngineError::Timeout(timeout)),
                }
            }
        };

        if let Some(key) = breaker_key {
            match &result {
                Ok(_) => self.breaker.record_success(key).await?,
                // The breaker's own refusal and cooperative cancellation do
                // not count as failures of the external system
                Err(EngineError::CircuitOpen(_)) | Err(EngineError::Cancelled) => {}
                Err(_) => self.breaker.record_failure(key).await?,
            }
        }
        result
    }

    async fn ensure_row(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        input: &Value,
    ) -> EngineResult<NodeExecution> {
        if let Some(existing) = self
            .gateway
            .get_node_execution(ctx.execution_id, &node.id)
            .await?
        {
            return Ok(existing);
        }
        let row = NodeExecution::new(ctx.execution_id, node.id.clone(), input.clone());
        self.gateway.create_node_execution(&row).await?;
        Ok(row)
    }

    async fn fail_row(
        &self,
        row: &NodeExecution,
        ctx: &ExecutionContext,
        attempts: u32,
        err: EngineError,
    ) -> EngineResult<Option<Value>> {
        let info = ErrorInfo::from_error(&err);
        self.gateway
            .update_node_execution_status(row.id, NodeExecutionStatus::Failed, attempts, Some(info))
            .await?;
        self.bus.publish_node(
            ctx.execution_id,
            row.node_id.clone(),
            NodeExecutionStatus::Failed,
            attempts,
        );
        if err.kind() != ErrorKind::Cancelled {
            ctx.logger
                .error(format!("node {} failed: {}", row.node_id, err))
                .await;
        }
        Err(err)
    }

    fn retry_policy(&self, node: &Node) -> RetryPolicy {
        let mut policy = RetryPolicy::from_config(&self.config);
        if let Some(n) = node.config.get("maxAttempts").and_then(Value::as_u64) {
            policy.max_attempts = (n as u32).max(1);
        }
        if let Some(ms) = node.config.get("baseDelayMs").and_then(Value::as_u64) {
            policy.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = node.config.get("maxDelayMs").and_then(Value::as_u64) {
            policy.max_delay = Duration::from_millis(ms);
        }
        policy
    }

    fn node_timeout(&self, node: &Node) -> Duration {
        node.config
            .get("timeoutMs")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or(self.config.node_timeout)
    }
}

/// Schema field validation shared by input and output checks.
fn validate_fields(value: &Value, fields: &[FieldSpec], what: &str) -> Result<(), String> {
    if fields.is_empty() {
        return Ok(());
    }
    let map = match value {
        Value::Object(map) => map,
        _ => return Err(format!("{} is not an object", what)),
    };
    for field in fields {
        match map.get(&field.name) {
            None => {
                if field.required {
                    return Err(format!("{} missing required field {:?}", what, field.name));
                }
            }
            Some(v) => {
                if !field.ty.accepts(v) {
                    return Err(format!(
                        "{} field {:?} expected {:?}",
                        what, field.name, field.ty
                    ));
                }
            }
        }
    }
    Ok(())
}
