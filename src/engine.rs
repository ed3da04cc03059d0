//! Engine facade
//!
//! Wires the gateway, handler registry, circuit breaker, queue, and
//! coordinator together, and exposes the operations the HTTP surface and the
//! binary consume. Queue workers run as background tasks; each leases one
//! execution at a time and acks only after the coordinator reaches a safe
//! point.

use crate::config::EngineConfig;
use crate::coordinator::Coordinator;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, ExecutionEvent};
use crate::handlers::{self, HandlerPorts};
use crate::model::{
    Execution, ExecutionId, LogEvent, NodeExecution, NodeExecutionId, NodeId, TriggerSource,
    Workflow, WorkflowId,
};
use crate::queue::ExecutionQueue;
use crate::registry::HandlerRegistry;
use crate::resilience::CircuitBreaker;
use crate::state::SharedGateway;
use crate::validation::{self, Violation};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// The assembled workflow engine.
pub struct Engine {
    config: EngineConfig,
    gateway: SharedGateway,
    queue: Arc<ExecutionQueue>,
    coordinator: Arc<Coordinator>,
    bus: EventBus,
}

impl Engine {
    /// Assemble an engine over the given gateway and outbound ports.
    pub fn new(config: EngineConfig, gateway: SharedGateway, ports: HandlerPorts) -> Self {
        let bus = EventBus::default();
        let registry = Arc::new(handlers::default_registry(
            &config,
            gateway.clone(),
            ports,
        ));
        Self::with_registry(config, gateway, registry, bus)
    }

    /// Assemble with a custom registry (tests inject scripted handlers).
    pub fn with_registry(
        config: EngineConfig,
        gateway: SharedGateway,
        registry: Arc<HandlerRegistry>,
        bus: EventBus,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker.clone(),
            gateway.clone(),
        ));
        let coordinator = Arc::new(Coordinator::new(
            &config,
            gateway.clone(),
            registry,
            breaker,
            bus.clone(),
        ));
        let queue = Arc::new(ExecutionQueue::new(gateway.clone(), config.queue.clone()));
        Self {
            config,
            gateway,
            queue,
            coordinator,
            bus,
        }
    }

    pub fn gateway(&self) -> &SharedGateway {
        &self.gateway
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to status/log events (SSE feed).
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.bus.subscribe()
    }

    /// Start queue workers (`prefetch` concurrent leases) and the startup
    /// recovery sweep. Returns the worker task handles.
    pub async fn start_workers(self: &Arc<Self>) -> EngineResult<Vec<JoinHandle<()>>> {
        let recovered = self.queue.recover().await?;
        if recovered > 0 {
            info!(recovered, "re-enqueued in-flight executions");
        }
        let mut workers = Vec::with_capacity(self.queue.prefetch());
        for worker_id in 0..self.queue.prefetch() {
            let engine = self.clone();
            workers.push(tokio::spawn(async move {
                engine.worker_loop(worker_id).await;
            }));
        }
        Ok(workers)
    }

    async fn worker_loop(&self, worker_id: usize) {
        info!(worker_id, "queue worker started");
        loop {
            let lease = match self.queue.receive().await {
                Ok(lease) => lease,
                Err(err) => {
                    error!(worker_id, %err, "queue receive failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };
            match self.coordinator.run(lease.execution_id).await {
                Ok(()) => {
                    if let Err(err) = self.queue.ack(lease.execution_id).await {
                        error!(execution = %lease.execution_id, %err, "ack failed");
                    }
                }
                Err(err) => {
                    // Abandoned (lifecycle persistence failure): leave the
                    // lease to expire and redeliver
                    error!(execution = %lease.execution_id, %err, "execution abandoned");
                }
            }
        }
    }

    // -- workflow management --

    pub async fn save_workflow(&self, workflow: &Workflow) -> EngineResult<()> {
        self.gateway.save_workflow(workflow).await
    }

    pub async fn get_workflow(&self, id: WorkflowId) -> EngineResult<Workflow> {
        self.gateway
            .load_workflow(id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(id.to_string()))
    }

    pub async fn delete_workflow(&self, id: WorkflowId) -> EngineResult<()> {
        self.gateway.delete_workflow(id).await
    }

    pub async fn list_workflows(&self) -> EngineResult<Vec<Workflow>> {
        self.gateway.list_workflows().await
    }

    // -- execution lifecycle --

    /// Validate and enqueue one execution of a workflow. Validation failures
    /// return the violation list; no execution row is created.
    pub async fn execute_workflow(
        &self,
        workflow_id: WorkflowId,
        trigger_source: TriggerSource,
        initiator_id: String,
        payload: Value,
    ) -> EngineResult<Result<ExecutionId, Vec<Violation>>> {
        let workflow = self.get_workflow(workflow_id).await?;
        if let Err(violations) = validation::validate(&workflow) {
            return Ok(Err(violations));
        }
        let execution = Execution::new(workflow_id, trigger_source, initiator_id, payload);
        self.gateway.create_execution(&execution).await?;
        self.queue.enqueue(execution.id).await?;
        Ok(Ok(execution.id))
    }

    pub async fn get_execution(&self, id: ExecutionId) -> EngineResult<Execution> {
        self.gateway
            .get_execution(id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(id.to_string()))
    }

    pub async fn list_executions(
        &self,
        workflow: Option<WorkflowId>,
    ) -> EngineResult<Vec<Execution>> {
        self.gateway.list_executions(workflow).await
    }

    pub async fn cancel_execution(&self, id: ExecutionId) -> EngineResult<()> {
        self.coordinator.cancel(id).await
    }

    pub async fn pause_execution(
        &self,
        id: ExecutionId,
        node_id: Option<NodeId>,
        requested_by: String,
    ) -> EngineResult<()> {
        self.coordinator.pause(id, node_id, requested_by).await
    }

    pub async fn resume_execution(
        &self,
        id: ExecutionId,
        node_id: Option<NodeId>,
    ) -> EngineResult<()> {
        let runnable = self.coordinator.resume(id, node_id).await?;
        if runnable {
            // the coordinator resumes Paused -> Running when the lease runs
            self.queue.enqueue(id).await?;
        }
        Ok(())
    }

    pub async fn retry_execution(&self, id: ExecutionId) -> EngineResult<()> {
        self.coordinator.retry(id).await?;
        self.queue.enqueue(id).await?;
        Ok(())
    }

    // -- inspection --

    pub async fn node_executions(&self, id: ExecutionId) -> EngineResult<Vec<NodeExecution>> {
        self.gateway.list_node_executions(id).await
    }

    pub async fn recent_logs(&self, id: ExecutionId, limit: usize) -> EngineResult<Vec<LogEvent>> {
        self.gateway.list_logs(id, limit).await
    }

    pub async fn node_logs_by_node(
        &self,
        id: ExecutionId,
        node_id: &str,
    ) -> EngineResult<Vec<LogEvent>> {
        self.gateway.list_node_logs(id, node_id).await
    }

    pub async fn node_logs(&self, node_execution_id: NodeExecutionId) -> EngineResult<Vec<LogEvent>> {
        let row = self
            .gateway
            .get_node_execution_by_id(node_execution_id)
            .await?
            .ok_or_else(|| {
                EngineError::ExecutionNotFound(node_execution_id.to_string())
            })?;
        self.gateway
            .list_node_logs(row.execution_id, &row.node_id)
            .await
    }
}
