//! API endpoints for tasks.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::mesh::Mesh;
use crate::task::{TaskSnapshot, TaskSpec, TaskState};

use super::{ApiError, ApiResult};

#[derive(Serialize)]
pub struct CreateTaskResponse {
    pub task_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListTasksQuery {
    pub state: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GetTaskQuery {
    /// Block until the task is terminal or this many milliseconds pass.
    pub wait_ms: Option<u64>,
}

pub async fn create_task(
    State(mesh): State<Arc<Mesh>>,
    Json(spec): Json<TaskSpec>,
) -> ApiResult<(StatusCode, Json<CreateTaskResponse>)> {
    let task_id = mesh.submit(spec)?;
    Ok((StatusCode::CREATED, Json(CreateTaskResponse { task_id })))
}

pub async fn list_tasks(
    State(mesh): State<Arc<Mesh>>,
    Query(query): Query<ListTasksQuery>,
) -> ApiResult<Json<Vec<TaskSnapshot>>> {
    let state = query
        .state
        .as_deref()
        .map(str::parse::<TaskState>)
        .transpose()?;
    Ok(Json(mesh.list_tasks(state)))
}

/// Current snapshot. With `wait_ms`, returns early once the task is terminal
/// and otherwise the snapshot as of the deadline.
pub async fn get_task(
    State(mesh): State<Arc<Mesh>>,
    Path(id): Path<String>,
    Query(query): Query<GetTaskQuery>,
) -> ApiResult<Json<TaskSnapshot>> {
    if let Some(wait_ms) = query.wait_ms {
        match mesh.await_completion(&id, Some(Duration::from_millis(wait_ms))).await {
            Ok(snapshot) => return Ok(Json(snapshot)),
            Err(crate::error::Error::Timeout(_)) => {}
            Err(e) => return Err(ApiError::from(e)),
        }
    }
    Ok(Json(mesh.status(&id)?))
}

pub async fn cancel_task(
    State(mesh): State<Arc<Mesh>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<TaskSnapshot>)> {
    mesh.cancel(&id)?;
    Ok((StatusCode::ACCEPTED, Json(mesh.status(&id)?)))
}
