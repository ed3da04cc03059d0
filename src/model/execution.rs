//! Execution, node execution, and log rows

use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::model::workflow::{NodeId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for one workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    /// Generate a new execution ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from string
    pub fn parse_str(s: &str) -> EngineResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| EngineError::Validation(format!("invalid execution id: {}", e)))
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one node execution row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeExecutionId(pub Uuid);

impl NodeExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse_str(s: &str) -> EngineResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| EngineError::Validation(format!("invalid node execution id: {}", e)))
    }
}

impl Default for NodeExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal states are final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// What triggered the execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Manual,
    Schedule,
    Webhook,
    Api,
}

/// Error snapshot persisted on executions and node executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorInfo {
    pub fn from_error(err: &EngineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// One run of a workflow. Created on enqueue, terminal once the coordinator
/// writes `completed`, `failed`, or `cancelled`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub trigger_source: TriggerSource,
    pub initiator_id: String,
    /// Trigger payload handed to the entry node as its input
    #[serde(default)]
    pub variables: Value,
    pub result: Option<Value>,
    pub last_error: Option<ErrorInfo>,
}

impl Execution {
    /// Create a pending execution.
    pub fn new(
        workflow_id: WorkflowId,
        trigger_source: TriggerSource,
        initiator_id: String,
        variables: Value,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            workflow_id,
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            trigger_source,
            initiator_id,
            variables,
            result: None,
            last_error: None,
        }
    }

    fn transition_err(&self, to: ExecutionStatus) -> EngineError {
        EngineError::InvalidTransition {
            from: format!("{:?}", self.status),
            to: format!("{:?}", to),
        }
    }

    /// Start the execution.
    pub fn start(&mut self) -> EngineResult<()> {
        match self.status {
            ExecutionStatus::Pending => {
                self.status = ExecutionStatus::Running;
                self.started_at = Some(Utc::now());
                Ok(())
            }
            _ => Err(self.transition_err(ExecutionStatus::Running)),
        }
    }

    /// Park the execution while pause records block every live branch.
    pub fn pause(&mut self) -> EngineResult<()> {
        match self.status {
            ExecutionStatus::Running => {
                self.status = ExecutionStatus::Paused;
                Ok(())
            }
            _ => Err(self.transition_err(ExecutionStatus::Paused)),
        }
    }

    /// Resume a paused execution.
    pub fn resume(&mut self) -> EngineResult<()> {
        match self.status {
            ExecutionStatus::Paused => {
                self.status = ExecutionStatus::Running;
                Ok(())
            }
            _ => Err(self.transition_err(ExecutionStatus::Running)),
        }
    }

    /// Complete successfully with the terminal nodes' outputs.
    pub fn complete(&mut self, result: Value) -> EngineResult<()> {
        match self.status {
            ExecutionStatus::Running | ExecutionStatus::Paused => {
                self.status = ExecutionStatus::Completed;
                self.completed_at = Some(Utc::now());
                self.result = Some(result);
                Ok(())
            }
            _ => Err(self.transition_err(ExecutionStatus::Completed)),
        }
    }

    /// Fail with the first fatal error.
    pub fn fail(&mut self, error: ErrorInfo) -> EngineResult<()> {
        match self.status {
            ExecutionStatus::Running | ExecutionStatus::Paused => {
                self.status = ExecutionStatus::Failed;
                self.completed_at = Some(Utc::now());
                self.last_error = Some(error);
                Ok(())
            }
            _ => Err(self.transition_err(ExecutionStatus::Failed)),
        }
    }

    /// Rewind a failed or cancelled execution to pending so the queue can
    /// rerun it. Clears the previous outcome; succeeded node rows are kept
    /// and skipped by the scheduler on the rerun.
    pub fn reset_for_retry(&mut self) -> EngineResult<()> {
        match self.status {
            ExecutionStatus::Failed | ExecutionStatus::Cancelled => {
                self.status = ExecutionStatus::Pending;
                self.started_at = None;
                self.completed_at = None;
                self.result = None;
                self.last_error = None;
                Ok(())
            }
            _ => Err(self.transition_err(ExecutionStatus::Pending)),
        }
    }

    /// Cancel cooperatively.
    pub fn cancel(&mut self) -> EngineResult<()> {
        match self.status {
            ExecutionStatus::Pending | ExecutionStatus::Running | ExecutionStatus::Paused => {
                self.status = ExecutionStatus::Cancelled;
                self.completed_at = Some(Utc::now());
                Ok(())
            }
            _ => Err(self.transition_err(ExecutionStatus::Cancelled)),
        }
    }
}

/// Node execution lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Paused,
}

impl NodeExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeExecutionStatus::Succeeded
                | NodeExecutionStatus::Failed
                | NodeExecutionStatus::Skipped
        )
    }
}

/// One node's run within an execution. Exactly one terminal row per
/// `(execution, node)` pair; created on first dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecution {
    pub id: NodeExecutionId,
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    pub status: NodeExecutionStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub input: Value,
    pub output: Value,
    pub error: Option<ErrorInfo>,
}

impl NodeExecution {
    /// Create a row at first dispatch.
    pub fn new(execution_id: ExecutionId, node_id: NodeId, input: Value) -> Self {
        Self {
            id: NodeExecutionId::new(),
            execution_id,
            node_id,
            status: NodeExecutionStatus::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            input,
            output: Value::Null,
            error: None,
        }
    }
}

/// Log severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Append-only log row, streamed to the UI and persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub execution_id: ExecutionId,
    pub node_id: Option<NodeId>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
    /// Per-emitter sequence, breaks wall-clock ties
    pub seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lifecycle_happy_path() {
        let mut exec = Execution::new(
            WorkflowId::new(),
            TriggerSource::Manual,
            "user-1".to_string(),
            json!({}),
        );
        assert_eq!(exec.status, ExecutionStatus::Pending);
        exec.start().unwrap();
        assert!(exec.started_at.is_some());
        exec.complete(json!({"ok": true})).unwrap();
        assert!(exec.status.is_terminal());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut exec = Execution::new(
            WorkflowId::new(),
            TriggerSource::Api,
            "user-1".to_string(),
            json!({}),
        );
        exec.start().unwrap();
        exec.cancel().unwrap();
        assert!(exec.start().is_err());
        assert!(exec
            .fail(ErrorInfo {
                kind: ErrorKind::Execution,
                message: "late".to_string()
            })
            .is_err());
    }

    #[test]
    fn pause_resume_round_trip() {
        let mut exec = Execution::new(
            WorkflowId::new(),
            TriggerSource::Manual,
            "user-1".to_string(),
            json!({}),
        );
        exec.start().unwrap();
        exec.pause().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Paused);
        exec.resume().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Running);
    }

    #[test]
    fn statuses_serialize_lowercase() {
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
        assert_eq!(
            serde_json::to_string(&NodeExecutionStatus::Succeeded).unwrap(),
            "\"succeeded\""
        );
    }
}
