//! Persistence gateway
//!
//! Single seam between the engine and durable storage. The engine defines one
//! canonical row shape per table; any external naming is mapped at this
//! boundary only. Lifecycle writes propagate their errors (the coordinator
//! abandons the execution and lets the queue redeliver); log writes never do.

pub mod store;

use crate::error::EngineResult;
use crate::model::{
    ErrorInfo, Execution, ExecutionId, ExecutionStatus, LogEvent, NodeExecution, NodeExecutionId,
    NodeExecutionStatus, NodeId, Workflow, WorkflowId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub use store::SledGateway;

/// Shared gateway handle passed through the engine.
pub type SharedGateway = Arc<dyn PersistenceGateway>;

/// A pause record blocks the scheduler from advancing past a node (or, with
/// no node, past the whole execution).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseRecord {
    pub execution_id: ExecutionId,
    /// Absent means the execution is paused as a whole
    pub node_id: Option<NodeId>,
    pub requested_by: String,
    pub created_at: DateTime<Utc>,
}

/// Persisted circuit breaker row, keyed by `(scope, operation)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitRecord {
    pub state: CircuitStateKind,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Circuit breaker position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

impl Default for CircuitRecord {
    fn default() -> Self {
        Self {
            state: CircuitStateKind::Closed,
            consecutive_failures: 0,
            opened_at: None,
            last_success_at: None,
        }
    }
}

/// Handler-level audit row written by the metrics decorator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockExecution {
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    pub block_type: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
}

/// Durable queue row. A leased message is invisible until `leased_until`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub execution_id: ExecutionId,
    pub enqueued_at: DateTime<Utc>,
    pub deliveries: u32,
    pub leased_until: Option<DateTime<Utc>>,
}

/// Storage operations the engine needs. Row-granular and transactional per
/// call; no cross-row transactions are assumed.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    // -- workflows --
    async fn save_workflow(&self, workflow: &Workflow) -> EngineResult<()>;
    async fn load_workflow(&self, id: WorkflowId) -> EngineResult<Option<Workflow>>;
    /// Cascade: removes the workflow's executions and their children.
    async fn delete_workflow(&self, id: WorkflowId) -> EngineResult<()>;
    async fn list_workflows(&self) -> EngineResult<Vec<Workflow>>;

    // -- executions --
    async fn create_execution(&self, execution: &Execution) -> EngineResult<()>;
    async fn get_execution(&self, id: ExecutionId) -> EngineResult<Option<Execution>>;
    /// Guarded status transition; returns the updated row.
    async fn update_execution_status(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        error: Option<ErrorInfo>,
    ) -> EngineResult<Execution>;
    async fn set_execution_result(&self, id: ExecutionId, result: Value) -> EngineResult<()>;
    async fn list_executions(&self, workflow: Option<WorkflowId>) -> EngineResult<Vec<Execution>>;
    /// Executions still owed work (pending or running), for queue recovery.
    async fn list_ready_executions(&self) -> EngineResult<Vec<ExecutionId>>;

    // -- node executions --
    async fn create_node_execution(&self, row: &NodeExecution) -> EngineResult<()>;
    async fn update_node_execution_status(
        &self,
        id: NodeExecutionId,
        status: NodeExecutionStatus,
        attempts: u32,
        error: Option<ErrorInfo>,
    ) -> EngineResult<()>;
    async fn set_node_execution_output(
        &self,
        id: NodeExecutionId,
        output: Value,
    ) -> EngineResult<()>;
    async fn get_node_execution(
        &self,
        execution: ExecutionId,
        node: &str,
    ) -> EngineResult<Option<NodeExecution>>;
    async fn get_node_execution_by_id(
        &self,
        id: NodeExecutionId,
    ) -> EngineResult<Option<NodeExecution>>;
    async fn list_node_executions(&self, execution: ExecutionId)
        -> EngineResult<Vec<NodeExecution>>;

    // -- logs --
    async fn append_log_event(&self, event: &LogEvent) -> EngineResult<()>;
    async fn list_logs(&self, execution: ExecutionId, limit: usize) -> EngineResult<Vec<LogEvent>>;
    async fn list_node_logs(
        &self,
        execution: ExecutionId,
        node: &str,
    ) -> EngineResult<Vec<LogEvent>>;

    // -- pauses --
    async fn set_pause(&self, record: &PauseRecord) -> EngineResult<()>;
    async fn get_pause(
        &self,
        execution: ExecutionId,
        node: Option<&str>,
    ) -> EngineResult<Option<PauseRecord>>;
    async fn clear_pause(&self, execution: ExecutionId, node: Option<&str>) -> EngineResult<()>;
    async fn list_pauses(&self, execution: ExecutionId) -> EngineResult<Vec<PauseRecord>>;

    // -- circuit breaker --
    async fn load_circuit(&self, key: &str) -> EngineResult<Option<CircuitRecord>>;
    async fn save_circuit(&self, key: &str, record: &CircuitRecord) -> EngineResult<()>;

    // -- block executions --
    async fn append_block_execution(&self, row: &BlockExecution) -> EngineResult<()>;

    // -- queue --
    /// Insert if absent; returns false when the execution is already queued.
    async fn queue_put(&self, message: &QueueMessage) -> EngineResult<bool>;
    async fn queue_scan(&self) -> EngineResult<Vec<QueueMessage>>;
    async fn queue_update(&self, message: &QueueMessage) -> EngineResult<()>;
    async fn queue_remove(&self, execution: ExecutionId) -> EngineResult<()>;
}
