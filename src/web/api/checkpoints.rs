//! API endpoints for the checkpoint ledger.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::ledger::{Checkpoint, CheckpointRef};
use crate::mesh::Mesh;

use super::ApiResult;

#[derive(Debug, Default, Deserialize)]
pub struct ListCheckpointsQuery {
    pub subject_id: Option<String>,
}

#[derive(Deserialize)]
pub struct CleanupRequest {
    pub max_age_secs: u64,
}

#[derive(Serialize)]
pub struct CleanupResponse {
    pub deleted: usize,
}

pub async fn list_checkpoints(
    State(mesh): State<Arc<Mesh>>,
    Query(query): Query<ListCheckpointsQuery>,
) -> ApiResult<Json<Vec<CheckpointRef>>> {
    Ok(Json(mesh.list_checkpoints(query.subject_id.as_deref())?))
}

pub async fn get_checkpoint(
    State(mesh): State<Arc<Mesh>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Checkpoint>> {
    Ok(Json(mesh.restore_checkpoint(&id)?))
}

pub async fn cleanup_checkpoints(
    State(mesh): State<Arc<Mesh>>,
    Json(req): Json<CleanupRequest>,
) -> ApiResult<Json<CleanupResponse>> {
    let deleted = mesh.cleanup_checkpoints(Duration::from_secs(req.max_age_secs))?;
    tracing::info!(deleted, max_age_secs = req.max_age_secs, "Checkpoint cleanup via API");
    Ok(Json(CleanupResponse { deleted }))
}
