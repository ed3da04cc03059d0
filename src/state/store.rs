//! Sled-backed persistence gateway
//!
//! One tree per table, JSON row encoding, string keys shaped for prefix
//! scans. Timestamps serialize as ISO-8601 UTC through chrono's serde.

use crate::error::{EngineError, EngineResult};
use crate::model::{
    ErrorInfo, Execution, ExecutionId, ExecutionStatus, LogEvent, NodeExecution, NodeExecutionId,
    NodeExecutionStatus, Workflow, WorkflowId,
};
use crate::state::{
    BlockExecution, CircuitRecord, PauseRecord, PersistenceGateway, QueueMessage,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sled::{Db, Tree};
use std::path::Path;

/// Sled gateway with one tree per persisted table.
pub struct SledGateway {
    _db: Db,
    workflows: Tree,
    executions: Tree,
    node_executions: Tree,
    node_execution_ids: Tree,
    logs: Tree,
    pauses: Tree,
    circuits: Tree,
    block_executions: Tree,
    queue: Tree,
}

impl SledGateway {
    /// Open (or create) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            workflows: db.open_tree("workflows")?,
            executions: db.open_tree("workflow_executions")?,
            node_executions: db.open_tree("node_executions")?,
            node_execution_ids: db.open_tree("node_execution_ids")?,
            logs: db.open_tree("execution_logs")?,
            pauses: db.open_tree("workflow_pauses")?,
            circuits: db.open_tree("circuit_breaker_state")?,
            block_executions: db.open_tree("block_executions")?,
            queue: db.open_tree("execution_queue")?,
            _db: db,
        })
    }

    /// Open a throwaway database in a temporary location (tests, `validate`).
    pub fn open_temporary() -> EngineResult<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config
            .open()
            .map_err(|e| EngineError::Persistence(format!("temporary db: {}", e)))?;
        Ok(Self {
            workflows: db.open_tree("workflows")?,
            executions: db.open_tree("workflow_executions")?,
            node_executions: db.open_tree("node_executions")?,
            node_execution_ids: db.open_tree("node_execution_ids")?,
            logs: db.open_tree("execution_logs")?,
            pauses: db.open_tree("workflow_pauses")?,
            circuits: db.open_tree("circuit_breaker_state")?,
            block_executions: db.open_tree("block_executions")?,
            queue: db.open_tree("execution_queue")?,
            _db: db,
        })
    }

    fn put<T: Serialize>(tree: &Tree, key: &str, row: &T) -> EngineResult<()> {
        let value = serde_json::to_vec(row)?;
        tree.insert(key.as_bytes(), value)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(tree: &Tree, key: &str) -> EngineResult<Option<T>> {
        match tree.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_prefix<T: DeserializeOwned>(tree: &Tree, prefix: &str) -> EngineResult<Vec<T>> {
        let mut rows = Vec::new();
        for item in tree.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = item?;
            rows.push(serde_json::from_slice(&bytes)?);
        }
        Ok(rows)
    }

    fn node_key(execution: ExecutionId, node: &str) -> String {
        format!("{}/{}", execution, node)
    }

    fn log_key(event: &LogEvent) -> String {
        format!(
            "{}/{:020}/{:010}",
            event.execution_id,
            event.timestamp.timestamp_millis().max(0),
            event.seq
        )
    }

    fn pause_key(execution: ExecutionId, node: Option<&str>) -> String {
        format!("{}/{}", execution, node.unwrap_or("*"))
    }

    fn load_node_row(&self, id: NodeExecutionId) -> EngineResult<Option<(String, NodeExecution)>> {
        let Some(key_bytes) = self.node_execution_ids.get(id.to_string().as_bytes())? else {
            return Ok(None);
        };
        let key = String::from_utf8_lossy(&key_bytes).to_string();
        let row: Option<NodeExecution> = Self::get(&self.node_executions, &key)?;
        Ok(row.map(|r| (key, r)))
    }

    /// Apply a guarded execution status transition.
    fn apply_status(
        execution: &mut Execution,
        status: ExecutionStatus,
        error: Option<ErrorInfo>,
    ) -> EngineResult<()> {
        match status {
            ExecutionStatus::Running => match execution.status {
                ExecutionStatus::Paused => execution.resume(),
                // Re-entry after crash recovery: the row is already running
                ExecutionStatus::Running => Ok(()),
                _ => execution.start(),
            },
            ExecutionStatus::Paused => execution.pause(),
            ExecutionStatus::Completed => {
                let result = execution.result.take().unwrap_or(Value::Null);
                execution.complete(result)
            }
            ExecutionStatus::Failed => execution.fail(error.unwrap_or(ErrorInfo {
                kind: crate::error::ErrorKind::Execution,
                message: "execution failed".to_string(),
            })),
            ExecutionStatus::Cancelled => execution.cancel(),
            ExecutionStatus::Pending => execution.reset_for_retry(),
        }
    }
}

#[async_trait]
impl PersistenceGateway for SledGateway {
    async fn save_workflow(&self, workflow: &Workflow) -> EngineResult<()> {
        Self::put(&self.workflows, &workflow.id.to_string(), workflow)
    }

    async fn load_workflow(&self, id: WorkflowId) -> EngineResult<Option<Workflow>> {
        Self::get(&self.workflows, &id.to_string())
    }

    async fn delete_workflow(&self, id: WorkflowId) -> EngineResult<()> {
        // Cascade: executions and everything they own
        let executions = self.list_executions(Some(id)).await?;
        for execution in executions {
            let exec_id = execution.id.to_string();
            for item in self.node_executions.scan_prefix(exec_id.as_bytes()) {
                let (key, bytes) = item?;
                if let Ok(row) = serde_json::from_slice::<NodeExecution>(&bytes) {
                    self.node_execution_ids.remove(row.id.to_string().as_bytes())?;
                }
                self.node_executions.remove(key)?;
            }
            for tree in [&self.logs, &self.pauses, &self.block_executions] {
                for item in tree.scan_prefix(exec_id.as_bytes()) {
                    let (key, _) = item?;
                    tree.remove(key)?;
                }
            }
            self.queue.remove(exec_id.as_bytes())?;
            self.executions.remove(exec_id.as_bytes())?;
        }
        self.workflows.remove(id.to_string().as_bytes())?;
        Ok(())
    }

    async fn list_workflows(&self) -> EngineResult<Vec<Workflow>> {
        Self::scan_prefix(&self.workflows, "")
    }

    async fn create_execution(&self, execution: &Execution) -> EngineResult<()> {
        Self::put(&self.executions, &execution.id.to_string(), execution)
    }

    async fn get_execution(&self, id: ExecutionId) -> EngineResult<Option<Execution>> {
        Self::get(&self.executions, &id.to_string())
    }

    async fn update_execution_status(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        error: Option<ErrorInfo>,
    ) -> EngineResult<Execution> {
        let mut execution = self
            .get_execution(id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(id.to_string()))?;
        Self::apply_status(&mut execution, status, error)?;
        Self::put(&self.executions, &id.to_string(), &execution)?;
        Ok(execution)
    }

    async fn set_execution_result(&self, id: ExecutionId, result: Value) -> EngineResult<()> {
        let mut execution = self
            .get_execution(id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(id.to_string()))?;
        execution.result = Some(result);
        Self::put(&self.executions, &id.to_string(), &execution)
    }

    async fn list_executions(&self, workflow: Option<WorkflowId>) -> EngineResult<Vec<Execution>> {
        let mut rows: Vec<Execution> = Self::scan_prefix(&self.executions, "")?;
        if let Some(workflow_id) = workflow {
            rows.retain(|e| e.workflow_id == workflow_id);
        }
        rows.sort_by_key(|e| e.created_at);
        Ok(rows)
    }

    async fn list_ready_executions(&self) -> EngineResult<Vec<ExecutionId>> {
        let rows: Vec<Execution> = Self::scan_prefix(&self.executions, "")?;
        Ok(rows
            .into_iter()
            .filter(|e| {
                matches!(
                    e.status,
                    ExecutionStatus::Pending | ExecutionStatus::Running
                )
            })
            .map(|e| e.id)
            .collect())
    }

    async fn create_node_execution(&self, row: &NodeExecution) -> EngineResult<()> {
        let key = Self::node_key(row.execution_id, &row.node_id);
        Self::put(&self.node_executions, &key, row)?;
        self.node_execution_ids
            .insert(row.id.to_string().as_bytes(), key.as_bytes())?;
        Ok(())
    }

    async fn update_node_execution_status(
        &self,
        id: NodeExecutionId,
        status: NodeExecutionStatus,
        attempts: u32,
        error: Option<ErrorInfo>,
    ) -> EngineResult<()> {
        let Some((key, mut row)) = self.load_node_row(id)? else {
            return Err(EngineError::Persistence(format!(
                "node execution {} not found",
                id
            )));
        };
        // Terminal rows only move again on a retry reset
        if row.status.is_terminal()
            && status != NodeExecutionStatus::Pending
            && row.status != status
        {
            return Err(EngineError::InvalidTransition {
                from: format!("{:?}", row.status),
                to: format!("{:?}", status),
            });
        }
        if row.started_at.is_none() && status == NodeExecutionStatus::Running {
            row.started_at = Some(chrono::Utc::now());
        }
        if status.is_terminal() || status == NodeExecutionStatus::Paused {
            row.completed_at = Some(chrono::Utc::now());
        }
        row.status = status;
        row.attempts = attempts;
        row.error = error;
        Self::put(&self.node_executions, &key, &row)
    }

    async fn set_node_execution_output(
        &self,
        id: NodeExecutionId,
        output: Value,
    ) -> EngineResult<()> {
        let Some((key, mut row)) = self.load_node_row(id)? else {
            return Err(EngineError::Persistence(format!(
                "node execution {} not found",
                id
            )));
        };
        row.output = output;
        Self::put(&self.node_executions, &key, &row)
    }

    async fn get_node_execution(
        &self,
        execution: ExecutionId,
        node: &str,
    ) -> EngineResult<Option<NodeExecution>> {
        Self::get(&self.node_executions, &Self::node_key(execution, node))
    }

    async fn get_node_execution_by_id(
        &self,
        id: NodeExecutionId,
    ) -> EngineResult<Option<NodeExecution>> {
        Ok(self.load_node_row(id)?.map(|(_, row)| row))
    }

    async fn list_node_executions(
        &self,
        execution: ExecutionId,
    ) -> EngineResult<Vec<NodeExecution>> {
        let mut rows: Vec<NodeExecution> =
            Self::scan_prefix(&self.node_executions, &format!("{}/", execution))?;
        rows.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(rows)
    }

    async fn append_log_event(&self, event: &LogEvent) -> EngineResult<()> {
        Self::put(&self.logs, &Self::log_key(event), event)
    }

    async fn list_logs(&self, execution: ExecutionId, limit: usize) -> EngineResult<Vec<LogEvent>> {
        let rows: Vec<LogEvent> = Self::scan_prefix(&self.logs, &format!("{}/", execution))?;
        let skip = rows.len().saturating_sub(limit);
        Ok(rows.into_iter().skip(skip).collect())
    }

    async fn list_node_logs(
        &self,
        execution: ExecutionId,
        node: &str,
    ) -> EngineResult<Vec<LogEvent>> {
        let rows: Vec<LogEvent> = Self::scan_prefix(&self.logs, &format!("{}/", execution))?;
        Ok(rows
            .into_iter()
            .filter(|e| e.node_id.as_deref() == Some(node))
            .collect())
    }

    async fn set_pause(&self, record: &PauseRecord) -> EngineResult<()> {
        let key = Self::pause_key(record.execution_id, record.node_id.as_deref());
        Self::put(&self.pauses, &key, record)
    }

    async fn get_pause(
        &self,
        execution: ExecutionId,
        node: Option<&str>,
    ) -> EngineResult<Option<PauseRecord>> {
        Self::get(&self.pauses, &Self::pause_key(execution, node))
    }

    async fn clear_pause(&self, execution: ExecutionId, node: Option<&str>) -> EngineResult<()> {
        self.pauses
            .remove(Self::pause_key(execution, node).as_bytes())?;
        Ok(())
    }

    async fn list_pauses(&self, execution: ExecutionId) -> EngineResult<Vec<PauseRecord>> {
        Self::scan_prefix(&self.pauses, &format!("{}/", execution))
    }

    async fn load_circuit(&self, key: &str) -> EngineResult<Option<CircuitRecord>> {
        Self::get(&self.circuits, key)
    }

    async fn save_circuit(&self, key: &str, record: &CircuitRecord) -> EngineResult<()> {
        Self::put(&self.circuits, key, record)
    }

    async fn append_block_execution(&self, row: &BlockExecution) -> EngineResult<()> {
        let key = format!(
            "{}/{:020}/{}",
            row.execution_id,
            row.started_at.timestamp_millis().max(0),
            row.node_id
        );
        Self::put(&self.block_executions, &key, row)
    }

    async fn queue_put(&self, message: &QueueMessage) -> EngineResult<bool> {
        let key = message.execution_id.to_string();
        if self.queue.contains_key(key.as_bytes())? {
            return Ok(false);
        }
        Self::put(&self.queue, &key, message)?;
        Ok(true)
    }

    async fn queue_scan(&self) -> EngineResult<Vec<QueueMessage>> {
        let mut rows: Vec<QueueMessage> = Self::scan_prefix(&self.queue, "")?;
        rows.sort_by_key(|m| m.enqueued_at);
        Ok(rows)
    }

    async fn queue_update(&self, message: &QueueMessage) -> EngineResult<()> {
        Self::put(&self.queue, &message.execution_id.to_string(), message)
    }

    async fn queue_remove(&self, execution: ExecutionId) -> EngineResult<()> {
        self.queue.remove(execution.to_string().as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TriggerSource;
    use serde_json::json;

    fn gateway() -> SledGateway {
        SledGateway::open_temporary().unwrap()
    }

    fn execution() -> Execution {
        Execution::new(
            WorkflowId::new(),
            TriggerSource::Manual,
            "tester".to_string(),
            json!({}),
        )
    }

    #[tokio::test]
    async fn execution_round_trip() {
        let gw = gateway();
        let exec = execution();
        gw.create_execution(&exec).await.unwrap();
        let loaded = gw.get_execution(exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Pending);

        gw.update_execution_status(exec.id, ExecutionStatus::Running, None)
            .await
            .unwrap();
        gw.set_execution_result(exec.id, json!({"ok": true}))
            .await
            .unwrap();
        let done = gw
            .update_execution_status(exec.id, ExecutionStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let gw = gateway();
        let exec = execution();
        gw.create_execution(&exec).await.unwrap();
        // pending -> completed skips running
        assert!(gw
            .update_execution_status(exec.id, ExecutionStatus::Completed, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn node_execution_lookup_by_id_and_pair() {
        let gw = gateway();
        let exec = execution();
        gw.create_execution(&exec).await.unwrap();
        let row = NodeExecution::new(exec.id, "b".to_string(), json!({"x": 1}));
        gw.create_node_execution(&row).await.unwrap();

        gw.update_node_execution_status(row.id, NodeExecutionStatus::Running, 1, None)
            .await
            .unwrap();
        gw.set_node_execution_output(row.id, json!({"y": 2}))
            .await
            .unwrap();
        gw.update_node_execution_status(row.id, NodeExecutionStatus::Succeeded, 1, None)
            .await
            .unwrap();

        let by_pair = gw.get_node_execution(exec.id, "b").await.unwrap().unwrap();
        assert_eq!(by_pair.status, NodeExecutionStatus::Succeeded);
        assert_eq!(by_pair.output, json!({"y": 2}));
        let by_id = gw.get_node_execution_by_id(row.id).await.unwrap().unwrap();
        assert_eq!(by_id.node_id, "b");
    }

    #[tokio::test]
    async fn logs_keep_order_and_tail_limit() {
        let gw = gateway();
        let exec_id = ExecutionId::new();
        let now = chrono::Utc::now();
        for seq in 0..5u64 {
            gw.append_log_event(&LogEvent {
                execution_id: exec_id,
                node_id: Some("n".to_string()),
                level: crate::model::LogLevel::Info,
                message: format!("line {}", seq),
                data: None,
                timestamp: now,
                seq,
            })
            .await
            .unwrap();
        }
        let all = gw.list_logs(exec_id, 100).await.unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].seq < w[1].seq));
        let tail = gw.list_logs(exec_id, 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].message, "line 3");
    }

    #[tokio::test]
    async fn queue_dedups_by_execution() {
        let gw = gateway();
        let message = QueueMessage {
            execution_id: ExecutionId::new(),
            enqueued_at: chrono::Utc::now(),
            deliveries: 0,
            leased_until: None,
        };
        assert!(gw.queue_put(&message).await.unwrap());
        assert!(!gw.queue_put(&message).await.unwrap());
        gw.queue_remove(message.execution_id).await.unwrap();
        assert!(gw.queue_put(&message).await.unwrap());
    }

    #[tokio::test]
    async fn workflow_delete_cascades() {
        let gw = gateway();
        let workflow: Workflow = serde_json::from_value(json!({
            "name": "w",
            "nodes": [{"id": "a", "blockType": "EMAIL", "config": {"to": "x", "subject": "s"}}],
            "edges": []
        }))
        .unwrap();
        gw.save_workflow(&workflow).await.unwrap();
        let mut exec = execution();
        exec.workflow_id = workflow.id;
        gw.create_execution(&exec).await.unwrap();
        let row = NodeExecution::new(exec.id, "a".to_string(), json!({}));
        gw.create_node_execution(&row).await.unwrap();

        gw.delete_workflow(workflow.id).await.unwrap();
        assert!(gw.load_workflow(workflow.id).await.unwrap().is_none());
        assert!(gw.get_execution(exec.id).await.unwrap().is_none());
        assert!(gw.get_node_execution(exec.id, "a").await.unwrap().is_none());
        assert!(gw.get_node_execution_by_id(row.id).await.unwrap().is_none());
    }
}
