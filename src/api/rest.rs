//! REST + SSE surface
//!
//! Thin layer over the engine facade: parse, delegate, map errors. A UI
//! consumes these routes; ordering and shapes stay stable.

use crate::api::models::*;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::model::{
    ExecutionId, NodeExecutionId, TriggerSource, Workflow, WorkflowId,
};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Engine error mapped onto an HTTP response.
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::WorkflowNotFound(_) | EngineError::ExecutionNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            EngineError::Validation(_) | EngineError::Config(_) => StatusCode::BAD_REQUEST,
            EngineError::InvalidTransition { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the router over a shared engine.
pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/workflows", post(save_workflow).get(list_workflows))
        .route(
            "/workflows/:id",
            get(get_workflow).put(update_workflow).delete(delete_workflow),
        )
        .route("/workflows/:id/execute", post(execute_workflow))
        .route("/executions", get(list_executions))
        .route("/executions/node-logs", get(node_logs))
        .route("/executions/node-logs-by-node", get(node_logs_by_node))
        .route("/executions/:id", get(get_execution))
        .route("/executions/:id/cancel", post(cancel_execution))
        .route("/executions/:id/pause", post(pause_execution))
        .route("/executions/:id/resume", post(resume_execution))
        .route("/executions/:id/retry", post(retry_execution))
        .route("/executions/:id/stream", get(stream_execution))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn save_workflow(
    State(engine): State<Arc<Engine>>,
    Json(workflow): Json<Workflow>,
) -> ApiResult<Json<SaveWorkflowResponse>> {
    engine.save_workflow(&workflow).await?;
    Ok(Json(SaveWorkflowResponse { id: workflow.id }))
}

async fn list_workflows(
    State(engine): State<Arc<Engine>>,
) -> ApiResult<Json<Vec<Workflow>>> {
    Ok(Json(engine.list_workflows().await?))
}

async fn get_workflow(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Workflow>> {
    let id = WorkflowId::parse_str(&id)?;
    Ok(Json(engine.get_workflow(id).await?))
}

async fn update_workflow(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Json(mut workflow): Json<Workflow>,
) -> ApiResult<Json<SaveWorkflowResponse>> {
    let id = WorkflowId::parse_str(&id)?;
    // the path owns the identity
    workflow.id = id;
    engine.save_workflow(&workflow).await?;
    Ok(Json(SaveWorkflowResponse { id }))
}

async fn delete_workflow(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = WorkflowId::parse_str(&id)?;
    engine.delete_workflow(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn execute_workflow(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    body: Option<Json<ExecuteRequest>>,
) -> ApiResult<Response> {
    let id = WorkflowId::parse_str(&id)?;
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let outcome = engine
        .execute_workflow(
            id,
            request.trigger_source.unwrap_or(TriggerSource::Api),
            request.initiator_id.unwrap_or_else(|| "api".to_string()),
            request.payload.unwrap_or(json!({})),
        )
        .await?;
    match outcome {
        Ok(execution_id) => Ok(Json(ExecuteResponse { execution_id }).into_response()),
        Err(violations) => Ok((
            StatusCode::BAD_REQUEST,
            Json(ViolationsResponse { violations }),
        )
            .into_response()),
    }
}

async fn list_executions(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<ListExecutionsQuery>,
) -> ApiResult<Json<Vec<crate::model::Execution>>> {
    let workflow = match query.workflow_id {
        Some(raw) => Some(WorkflowId::parse_str(&raw)?),
        None => None,
    };
    Ok(Json(engine.list_executions(workflow).await?))
}

const RECENT_LOG_LIMIT: usize = 200;

async fn get_execution(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ExecutionDetail>> {
    let id = ExecutionId::parse_str(&id)?;
    let execution = engine.get_execution(id).await?;
    let node_executions = engine.node_executions(id).await?;
    let logs = engine.recent_logs(id, RECENT_LOG_LIMIT).await?;
    Ok(Json(ExecutionDetail {
        execution,
        node_executions,
        logs,
    }))
}

async fn cancel_execution(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = ExecutionId::parse_str(&id)?;
    engine.cancel_execution(id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn pause_execution(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    body: Option<Json<NodeActionRequest>>,
) -> ApiResult<StatusCode> {
    let id = ExecutionId::parse_str(&id)?;
    let node_id = body.and_then(|Json(r)| r.node_id);
    engine
        .pause_execution(id, node_id, "api".to_string())
        .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn resume_execution(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    body: Option<Json<NodeActionRequest>>,
) -> ApiResult<StatusCode> {
    let id = ExecutionId::parse_str(&id)?;
    let node_id = body.and_then(|Json(r)| r.node_id);
    engine.resume_execution(id, node_id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn retry_execution(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = ExecutionId::parse_str(&id)?;
    engine.retry_execution(id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn node_logs(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<NodeLogsQuery>,
) -> ApiResult<Json<Vec<crate::model::LogEvent>>> {
    let id = NodeExecutionId::parse_str(&query.node_execution_id)?;
    Ok(Json(engine.node_logs(id).await?))
}

async fn node_logs_by_node(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<NodeLogsByNodeQuery>,
) -> ApiResult<Json<Vec<crate::model::LogEvent>>> {
    let id = ExecutionId::parse_str(&query.execution_id)?;
    Ok(Json(engine.node_logs_by_node(id, &query.node_id).await?))
}

/// Server-sent events: status transitions and log lines for one execution,
/// in publication order.
async fn stream_execution(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let id = ExecutionId::parse_str(&id)?;
    // 404 for unknown executions before holding a subscription open
    engine.get_execution(id).await?;
    let rx = engine.subscribe();
    let stream = futures::stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) if event.execution_id() == id => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    return Some((Ok::<_, Infallible>(Event::default().data(data)), rx));
                }
                Ok(_) => continue,
                // dropped events are recoverable from the persisted log
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
