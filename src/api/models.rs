//! Request/response bodies for the REST surface

use crate::model::{Execution, LogEvent, NodeExecution, TriggerSource, WorkflowId};
use crate::validation::Violation;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveWorkflowResponse {
    pub id: WorkflowId,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub trigger_source: Option<TriggerSource>,
    #[serde(default)]
    pub initiator_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub execution_id: crate::model::ExecutionId,
}

#[derive(Debug, Serialize)]
pub struct ViolationsResponse {
    pub violations: Vec<Violation>,
}

/// Execution detail with embedded node executions and recent logs.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub execution: Execution,
    pub node_executions: Vec<NodeExecution>,
    pub logs: Vec<LogEvent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeActionRequest {
    #[serde(default)]
    pub node_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeLogsQuery {
    pub node_execution_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeLogsByNodeQuery {
    pub execution_id: String,
    pub node_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListExecutionsQuery {
    #[serde(default)]
    pub workflow_id: Option<String>,
}
