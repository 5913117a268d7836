/// Workflow instance REST API endpoints
///
/// Inspection and control of running instances: step, pause, resume, stop,
/// reset, plus the direct variable and node-status escape hatches a board UI
/// uses to drive an instance by hand.

use crate::{api::workflows::AppState, workflow::types::{NodeStatus, WorkflowInstance}};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

/// Request body for forcing a node status
#[derive(Debug, Deserialize)]
pub struct NodeStatusRequest {
    pub status: NodeStatus,
}

/// Create instance routes
pub fn create_instance_routes() -> Router<AppState> {
    Router::new()
        .route("/api/instances", get(list_instances))
        .route("/api/instances/{id}", get(get_instance).delete(delete_instance))
        .route("/api/instances/{id}/step", post(step_instance))
        .route("/api/instances/{id}/pause", post(pause_instance))
        .route("/api/instances/{id}/resume", post(resume_instance))
        .route("/api/instances/{id}/stop", post(stop_instance))
        .route("/api/instances/{id}/reset", post(reset_instance))
        .route("/api/instances/{id}/variables/{key}", put(update_variable))
        .route("/api/instances/{id}/nodes/{node_id}/status", put(set_node_status))
        .route("/api/instances/{id}/tasks", get(pending_tasks))
}

fn not_found(e: anyhow::Error) -> StatusCode {
    tracing::warn!("{:#}", e);
    StatusCode::NOT_FOUND
}

/// Wrap the outcome of a control call together with the resulting instance
async fn control_response(state: &AppState, id: &str, changed: bool) -> Result<Json<Value>, StatusCode> {
    let instance = state.engine.get_instance(id).await.ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!({ "changed": changed, "instance": instance })))
}

/// GET /api/instances
async fn list_instances(State(state): State<AppState>) -> Json<Value> {
    let instances = state.engine.list_instances().await;
    Json(json!({ "instances": instances }))
}

/// GET /api/instances/{id}
async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowInstance>, StatusCode> {
    state.engine.get_instance(&id).await.map(Json).ok_or(StatusCode::NOT_FOUND)
}

/// DELETE /api/instances/{id}
async fn delete_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    if !state.engine.remove_instance(&id).await {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(json!({ "id": id, "message": "Instance removed" })))
}

/// POST /api/instances/{id}/step
async fn step_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let running = state.engine.step(&id).await.map_err(not_found)?;
    control_response(&state, &id, running).await
}

/// POST /api/instances/{id}/pause
async fn pause_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let paused = state.engine.pause(&id).await.map_err(not_found)?;
    control_response(&state, &id, paused).await
}

/// POST /api/instances/{id}/resume
async fn resume_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let resumed = state.engine.resume(&id).await.map_err(not_found)?;
    control_response(&state, &id, resumed).await
}

/// POST /api/instances/{id}/stop
async fn stop_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    state.engine.stop(&id).await.map_err(not_found)?;
    control_response(&state, &id, true).await
}

/// POST /api/instances/{id}/reset
async fn reset_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    state.engine.reset(&id).await.map_err(not_found)?;
    control_response(&state, &id, true).await
}

/// PUT /api/instances/{id}/variables/{key}
/// Body: any JSON value
async fn update_variable(
    State(state): State<AppState>,
    Path((id, key)): Path<(String, String)>,
    Json(value): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    state.engine.update_variable(&id, &key, value).await.map_err(not_found)?;
    control_response(&state, &id, true).await
}

/// PUT /api/instances/{id}/nodes/{node_id}/status
/// Body: { "status": "idle" | "active" | "blocked" | "completed" }
async fn set_node_status(
    State(state): State<AppState>,
    Path((id, node_id)): Path<(String, String)>,
    Json(request): Json<NodeStatusRequest>,
) -> Result<Json<Value>, StatusCode> {
    state
        .engine
        .set_node_status(&id, &node_id, request.status)
        .await
        .map_err(not_found)?;
    control_response(&state, &id, true).await
}

/// GET /api/instances/{id}/tasks
async fn pending_tasks(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    if state.engine.get_instance(&id).await.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    let tasks = state.engine.scheduler().pending_tasks(Some(&id));
    Ok(Json(json!({ "tasks": tasks })))
}
