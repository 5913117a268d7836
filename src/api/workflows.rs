/// Workflow definition REST API endpoints
///
/// Registers definitions drawn on the board and starts instances from them.
/// Registering or updating a definition compiles it and swaps it into the
/// registry; instances already running keep the version they started with.

use crate::{
    config::EngineConfig,
    runtime::engine::WorkflowEngine,
    workflow::{registry::WorkflowRegistry, types::{WorkflowDefinition, WorkflowInstance}},
};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    /// Compiled workflow definitions
    pub registry: Arc<WorkflowRegistry>,
    /// Instance engine
    pub engine: Arc<WorkflowEngine>,
    /// Engine options for instances started without a body
    pub defaults: EngineConfig,
}

/// Response for workflow creation/update operations
#[derive(Debug, Serialize)]
pub struct WorkflowResponse {
    pub id: String,
    pub message: String,
}

/// Create workflow definition routes
pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", post(create_workflow).get(list_workflows))
        .route(
            "/api/workflows/{id}",
            get(get_workflow).put(update_workflow).delete(delete_workflow),
        )
        .route("/api/workflows/{id}/instances", post(start_instance))
}

/// Register a new workflow
///
/// POST /api/workflows
/// Body: { "id": "...", "name": "...", "nodes": [...], "edges": [...] }
async fn create_workflow(
    State(state): State<AppState>,
    Json(definition): Json<WorkflowDefinition>,
) -> Result<Json<WorkflowResponse>, StatusCode> {
    if definition.id.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    if state.registry.contains(&definition.id) {
        return Err(StatusCode::CONFLICT);
    }

    let id = definition.id.clone();
    if let Err(e) = state.registry.register(definition) {
        tracing::warn!("Rejected workflow {}: {:#}", id, e);
        return Err(StatusCode::BAD_REQUEST);
    }

    tracing::info!("🔥 Registered workflow: {}", id);
    Ok(Json(WorkflowResponse {
        message: format!("Workflow '{}' registered successfully", id),
        id,
    }))
}

/// List registered workflows
///
/// GET /api/workflows
/// Returns: { "workflows": [{ "id": "...", "name": "...", "nodes": 3, "edges": 2 }] }
async fn list_workflows(State(state): State<AppState>) -> Json<Value> {
    let workflows: Vec<Value> = state
        .registry
        .list_ids()
        .into_iter()
        .filter_map(|id| state.registry.get(&id))
        .map(|workflow| {
            json!({
                "id": workflow.definition.id,
                "name": workflow.definition.name,
                "nodes": workflow.definition.nodes.len(),
                "edges": workflow.definition.edges.len(),
            })
        })
        .collect();

    Json(json!({ "workflows": workflows }))
}

/// Get a workflow definition by ID
///
/// GET /api/workflows/{id}
async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowDefinition>, StatusCode> {
    state
        .registry
        .get(&id)
        .map(|workflow| Json(workflow.definition.clone()))
        .ok_or(StatusCode::NOT_FOUND)
}

/// Replace an existing workflow
///
/// PUT /api/workflows/{id}
async fn update_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut definition): Json<WorkflowDefinition>,
) -> Result<Json<WorkflowResponse>, StatusCode> {
    // The URL is authoritative for the id
    definition.id = id.clone();

    if !state.registry.contains(&id) {
        return Err(StatusCode::NOT_FOUND);
    }

    if let Err(e) = state.registry.register(definition) {
        tracing::warn!("Rejected update of workflow {}: {:#}", id, e);
        return Err(StatusCode::BAD_REQUEST);
    }

    tracing::info!("🔥 Hot-reloaded workflow: {}", id);
    Ok(Json(WorkflowResponse {
        message: format!("Workflow '{}' updated successfully", id),
        id,
    }))
}

/// Remove a workflow from the registry
///
/// DELETE /api/workflows/{id}
async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowResponse>, StatusCode> {
    if !state.registry.remove(&id) {
        return Err(StatusCode::NOT_FOUND);
    }

    tracing::info!("🗑️ Deleted workflow: {}", id);
    Ok(Json(WorkflowResponse {
        message: format!("Workflow '{}' deleted successfully", id),
        id,
    }))
}

/// Start an instance of a workflow
///
/// POST /api/workflows/{id}/instances
/// Body (optional): { "autoAdvance": true, "stepDelay": 100, "variables": {...} }
async fn start_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<WorkflowInstance>, StatusCode> {
    let workflow = state.registry.get(&id).ok_or(StatusCode::NOT_FOUND)?;

    let config = if body.iter().all(u8::is_ascii_whitespace) {
        state.defaults.clone()
    } else {
        serde_json::from_slice::<EngineConfig>(&body).map_err(|e| {
            tracing::warn!("Invalid engine config for workflow {}: {}", id, e);
            StatusCode::BAD_REQUEST
        })?
    };

    match state.engine.start(workflow, config, None).await {
        Ok(instance) => Ok(Json(instance)),
        Err(e) => {
            tracing::error!("Failed to start workflow {}: {:#}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
