//! Execution coordinator
//!
//! Owns the full lifecycle of one execution: load, revalidate, run the
//! scheduler, finalize. Cancel, pause, and resume act through persisted
//! records and per-execution cancellation handles. A persistence failure on
//! a lifecycle write aborts the run without acking, so the queue redelivers.

use crate::config::EngineConfig;
use crate::context::{cancel_pair, CancelHandle, ExecutionContext, ExecutionLogger};
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::events::EventBus;
use crate::executor::NodeExecutor;
use crate::model::{
    ErrorInfo, Execution, ExecutionId, ExecutionStatus, NodeExecutionStatus, NodeId, Workflow,
};
use crate::registry::HandlerRegistry;
use crate::resilience::CircuitBreaker;
use crate::scheduler::{RunOutcome, Scheduler};
use crate::state::{PauseRecord, SharedGateway};
use crate::validation;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Coordinates execution lifecycles. One instance per worker process.
pub struct Coordinator {
    gateway: SharedGateway,
    scheduler: Scheduler,
    bus: EventBus,
    /// Cancel handles for executions currently running in this process
    active: DashMap<ExecutionId, Arc<CancelHandle>>,
}

impl Coordinator {
    pub fn new(
        config: &EngineConfig,
        gateway: SharedGateway,
        registry: Arc<HandlerRegistry>,
        breaker: Arc<CircuitBreaker>,
        bus: EventBus,
    ) -> Self {
        let executor = Arc::new(NodeExecutor::new(
            gateway.clone(),
            registry,
            breaker,
            bus.clone(),
            config.executor.clone(),
        ));
        let scheduler = Scheduler::new(
            executor,
            gateway.clone(),
            bus.clone(),
            config.scheduler.max_in_flight,
        );
        Self {
            gateway,
            scheduler,
            bus,
            active: DashMap::new(),
        }
    }

    /// Run one execution to a safe point (terminal status or paused).
    /// Idempotent: redelivery of a terminal execution returns immediately.
    pub async fn run(&self, execution_id: ExecutionId) -> EngineResult<()> {
        let Some(execution) = self.gateway.get_execution(execution_id).await? else {
            warn!(execution = %execution_id, "queued execution no longer exists");
            return Ok(());
        };
        if execution.status.is_terminal() {
            return Ok(());
        }

        let Some(workflow) = self.gateway.load_workflow(execution.workflow_id).await? else {
            self.finalize_failed(
                execution_id,
                ErrorInfo {
                    kind: ErrorKind::Validation,
                    message: format!("workflow {} not found", execution.workflow_id),
                },
            )
            .await?;
            return Ok(());
        };

        // Revalidate: the graph is checked again right before running, so a
        // workflow edited after enqueue cannot slip an invalid version in
        if let Err(violations) = validation::validate(&workflow) {
            let message = violations
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            self.finalize_failed(
                execution_id,
                ErrorInfo {
                    kind: ErrorKind::Validation,
                    message,
                },
            )
            .await?;
            return Ok(());
        }

        let execution = self
            .gateway
            .update_execution_status(execution_id, ExecutionStatus::Running, None)
            .await?;
        self.bus.publish_status(execution_id, ExecutionStatus::Running);

        let (handle, signal) = cancel_pair();
        let handle = Arc::new(handle);
        self.active.insert(execution_id, handle.clone());

        let logger = ExecutionLogger::new(self.gateway.clone(), self.bus.clone(), execution_id);
        logger.info("execution started").await;
        let ctx = ExecutionContext::new(
            execution_id,
            execution.workflow_id,
            signal,
            logger.clone(),
            execution.variables.clone(),
        );

        let outcome = self.run_with_deadline(&workflow, &ctx).await;
        self.active.remove(&execution_id);

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                // Persistence failures abandon the execution: no finalize,
                // no ack, queue redelivery restarts it
                if err.kind() == ErrorKind::Persistence {
                    return Err(err);
                }
                RunOutcome::Failed {
                    error: ErrorInfo::from_error(&err),
                }
            }
        };

        match outcome {
            RunOutcome::Completed { result } => {
                self.gateway
                    .set_execution_result(execution_id, result)
                    .await?;
                self.gateway
                    .update_execution_status(execution_id, ExecutionStatus::Completed, None)
                    .await?;
                logger.info("execution completed").await;
                self.bus
                    .publish_status(execution_id, ExecutionStatus::Completed);
            }
            RunOutcome::Failed { error } => {
                logger
                    .error(format!("execution failed: {}", error.message))
                    .await;
                self.finalize_failed(execution_id, error).await?;
            }
            RunOutcome::Cancelled => {
                self.gateway
                    .update_execution_status(execution_id, ExecutionStatus::Cancelled, None)
                    .await?;
                logger.info("execution cancelled").await;
                self.bus
                    .publish_status(execution_id, ExecutionStatus::Cancelled);
            }
            RunOutcome::Paused => {
                self.gateway
                    .update_execution_status(execution_id, ExecutionStatus::Paused, None)
                    .await?;
                logger.info("execution paused").await;
                self.bus
                    .publish_status(execution_id, ExecutionStatus::Paused);
            }
        }
        Ok(())
    }

    /// Apply the optional execution-wide deadline (workflow metadata
    /// `executionDeadlineMs`); it supersedes per-node budgets.
    async fn run_with_deadline(
        &self,
        workflow: &Workflow,
        ctx: &ExecutionContext,
    ) -> EngineResult<RunOutcome> {
        let deadline = workflow
            .metadata
            .get("executionDeadlineMs")
            .and_then(Value::as_u64)
            .map(std::time::Duration::from_millis);
        match deadline {
            Some(budget) => match tokio::time::timeout(budget, self.scheduler.run(workflow, ctx)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(EngineError::Timeout(budget)),
            },
            None => self.scheduler.run(workflow, ctx).await,
        }
    }

    async fn finalize_failed(
        &self,
        execution_id: ExecutionId,
        error: ErrorInfo,
    ) -> EngineResult<()> {
        self.gateway
            .update_execution_status(execution_id, ExecutionStatus::Failed, Some(error))
            .await?;
        self.bus.publish_status(execution_id, ExecutionStatus::Failed);
        Ok(())
    }

    /// Cooperative cancel. Running executions observe the signal at their
    /// next suspension point; pending and paused executions finalize
    /// directly.
    pub async fn cancel(&self, execution_id: ExecutionId) -> EngineResult<()> {
        if let Some(handle) = self.active.get(&execution_id) {
            info!(execution = %execution_id, "cancellation requested");
            handle.cancel();
            return Ok(());
        }
        let execution = self.require_execution(execution_id).await?;
        match execution.status {
            ExecutionStatus::Pending | ExecutionStatus::Paused => {
                self.gateway
                    .update_execution_status(execution_id, ExecutionStatus::Cancelled, None)
                    .await?;
                self.gateway.queue_remove(execution_id).await?;
                self.bus
                    .publish_status(execution_id, ExecutionStatus::Cancelled);
                Ok(())
            }
            ExecutionStatus::Running => {
                // Running on another worker: that owner observes the status
                // row is untouched, so cancellation must wait for it. The
                // queue guarantees one owner, so this is a lost-handle case.
                Err(EngineError::Internal(format!(
                    "execution {} is running but has no cancel handle in this process",
                    execution_id
                )))
            }
            _ => Ok(()),
        }
    }

    /// Pause the whole execution or a single node.
    pub async fn pause(
        &self,
        execution_id: ExecutionId,
        node_id: Option<NodeId>,
        requested_by: String,
    ) -> EngineResult<()> {
        let execution = self.require_execution(execution_id).await?;
        if execution.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                from: format!("{:?}", execution.status),
                to: "Paused".to_string(),
            });
        }
        self.gateway
            .set_pause(&PauseRecord {
                execution_id,
                node_id,
                requested_by,
                created_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    /// Clear a pause record; a paused execution goes back to pending so the
    /// queue reruns it (succeeded nodes replay from their rows).
    pub async fn resume(
        &self,
        execution_id: ExecutionId,
        node_id: Option<NodeId>,
    ) -> EngineResult<bool> {
        self.gateway.clear_pause(execution_id, node_id.as_deref()).await?;
        let execution = self.require_execution(execution_id).await?;
        if execution.status == ExecutionStatus::Paused {
            let remaining = self.gateway.list_pauses(execution_id).await?;
            if remaining.is_empty() {
                // no pause records left anywhere: eligible to run again
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Rewind a failed execution for rerun: failed node rows reset to
    /// pending (succeeded rows are kept and replayed), the execution returns
    /// to pending.
    pub async fn retry(&self, execution_id: ExecutionId) -> EngineResult<()> {
        let execution = self.require_execution(execution_id).await?;
        if execution.status != ExecutionStatus::Failed {
            return Err(EngineError::InvalidTransition {
                from: format!("{:?}", execution.status),
                to: "Pending".to_string(),
            });
        }
        for row in self.gateway.list_node_executions(execution_id).await? {
            if matches!(
                row.status,
                NodeExecutionStatus::Failed
                    | NodeExecutionStatus::Skipped
                    | NodeExecutionStatus::Paused
                    | NodeExecutionStatus::Running
            ) {
                self.gateway
                    .update_node_execution_status(row.id, NodeExecutionStatus::Pending, 0, None)
                    .await?;
            }
        }
        self.gateway
            .update_execution_status(execution_id, ExecutionStatus::Pending, None)
            .await?;
        self.bus.publish_status(execution_id, ExecutionStatus::Pending);
        Ok(())
    }

    async fn require_execution(&self, execution_id: ExecutionId) -> EngineResult<Execution> {
        self.gateway
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))
    }
}
