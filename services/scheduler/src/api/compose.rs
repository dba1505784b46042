//! Compose and inspection endpoints under `/v0`.

use axum::{
    body::Bytes,
    extract::{Path, State},
    routing::{delete, get, put},
    Json, Router,
};
use serde::Serialize;

use super::error::{ApiError, OperationBody};
use crate::scheduler::ApplyReport;
use crate::state::AppState;
use crate::status::StatusEntry;
use crate::tasks::Task;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/compose/{project}", put(apply))
        .route("/compose/{project}/update", put(update))
        .route("/compose/{project}/{service}", delete(kill_service))
        .route("/compose/{project}/{service}/restart", put(restart))
        .route("/compose/{project}/{service}/{task}", delete(kill_task))
        .route("/tasks", get(list_tasks))
        .route("/tasks/{task}/restart", put(restart_task))
        .route("/status", get(status))
}

type OperationResult = Result<Json<OperationBody<ApplyReport>>, ApiError>;

/// Create or scale a project from a compose document.
async fn apply(State(state): State<AppState>, Path(project): Path<String>, body: Bytes) -> OperationResult {
    const OPERATION: &str = "apply";
    let report = state
        .scheduler()
        .apply_compose(&project, &body)
        .await
        .map_err(|e| ApiError::new(OPERATION, &e))?;
    Ok(Json(OperationBody::ok(OPERATION, format!("project '{project}' applied"), report)))
}

/// Make the document the project's whole service set.
async fn update(State(state): State<AppState>, Path(project): Path<String>, body: Bytes) -> OperationResult {
    const OPERATION: &str = "update";
    let report = state
        .scheduler()
        .update_compose(&project, &body)
        .await
        .map_err(|e| ApiError::new(OPERATION, &e))?;
    Ok(Json(OperationBody::ok(OPERATION, format!("project '{project}' updated"), report)))
}

async fn restart(
    State(state): State<AppState>,
    Path((project, service)): Path<(String, String)>,
) -> OperationResult {
    const OPERATION: &str = "restart";
    let report = state
        .scheduler()
        .restart_service(&project, &service)
        .await
        .map_err(|e| ApiError::new(OPERATION, &e))?;
    Ok(Json(OperationBody::ok(
        OPERATION,
        format!("service '{project}/{service}' restarting"),
        report,
    )))
}

/// Remove a service from the project and drain its tasks.
async fn kill_service(
    State(state): State<AppState>,
    Path((project, service)): Path<(String, String)>,
) -> OperationResult {
    const OPERATION: &str = "kill";
    let report = state
        .scheduler()
        .kill_service(&project, &service)
        .await
        .map_err(|e| ApiError::new(OPERATION, &e))?;
    Ok(Json(OperationBody::ok(
        OPERATION,
        format!("service '{project}/{service}' removed"),
        report,
    )))
}

async fn kill_task(
    State(state): State<AppState>,
    Path((project, service, task)): Path<(String, String, String)>,
) -> OperationResult {
    const OPERATION: &str = "kill";
    let report = state
        .scheduler()
        .kill_task(&project, &service, &task)
        .await
        .map_err(|e| ApiError::new(OPERATION, &e))?;
    Ok(Json(OperationBody::ok(OPERATION, format!("task '{task}' killed"), report)))
}

async fn restart_task(State(state): State<AppState>, Path(task): Path<String>) -> OperationResult {
    const OPERATION: &str = "restart";
    let report = state
        .scheduler()
        .restart_task(&task)
        .await
        .map_err(|e| ApiError::new(OPERATION, &e))?;
    Ok(Json(OperationBody::ok(OPERATION, format!("task '{task}' restarting"), report)))
}

#[derive(Debug, Serialize)]
struct TasksResponse {
    tasks: Vec<Task>,
}

async fn list_tasks(State(state): State<AppState>) -> Json<TasksResponse> {
    Json(TasksResponse {
        tasks: state.scheduler().tasks().await,
    })
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    errors: Vec<StatusEntry>,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        errors: state.scheduler().status().snapshot(),
    })
}
