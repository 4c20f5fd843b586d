//! HTTP routes.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    routing::{get, post},
    Json, Router,
};
use stageflow::{CreateTaskRequest, TaskDetail, TaskId, TaskService, TaskStore};
use std::sync::Arc;

use crate::error::{ApiError, ApiResponse};

/// Create the router for the task API.
pub fn create_router<S: TaskStore + 'static>(service: Arc<TaskService<S>>) -> Router {
    Router::new()
        .route("/api/tasks", post(create_task::<S>))
        .route("/api/tasks/:id", get(get_task::<S>))
        .with_state(service)
}

async fn create_task<S: TaskStore + 'static>(
    State(service): State<Arc<TaskService<S>>>,
    body: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> Result<ApiResponse<TaskDetail>, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::Validation(e.body_text()))?;
    let task = service.create_task(request).await?;
    Ok(ApiResponse::ok(task))
}

async fn get_task<S: TaskStore + 'static>(
    State(service): State<Arc<TaskService<S>>>,
    Path(id): Path<String>,
) -> Result<ApiResponse<TaskDetail>, ApiError> {
    let task = service.get_task(&TaskId::from(id.as_str())).await?;
    Ok(ApiResponse::ok(task))
}
