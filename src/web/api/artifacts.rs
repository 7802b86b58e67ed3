//! API endpoints for artifacts.
//!
//! Callers identify themselves with `x-requester` and list their capabilities
//! in `x-capabilities` (comma separated). Authentication of those headers is
//! left to whatever sits in front of this server.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::artifact::{Artifact, ArtifactFilter, ArtifactRef, Requester};
use crate::mesh::Mesh;

use super::ApiResult;

pub const REQUESTER_HEADER: &str = "x-requester";
pub const CAPABILITIES_HEADER: &str = "x-capabilities";

#[derive(Serialize)]
pub struct ArtifactResponse {
    #[serde(flatten)]
    pub artifact: Artifact,
    /// Base64 content.
    pub content: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct GetArtifactQuery {
    pub version: Option<u32>,
}

fn requester_from(headers: &HeaderMap) -> Requester {
    let id = headers
        .get(REQUESTER_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous");
    let capabilities = headers
        .get(CAPABILITIES_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    Requester::new(id, capabilities)
}

pub async fn get_artifact(
    State(mesh): State<Arc<Mesh>>,
    Path(id): Path<String>,
    Query(query): Query<GetArtifactQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<ArtifactResponse>> {
    let requester = requester_from(&headers);
    let found = mesh.get_artifact(&id, &requester, query.version).await?;
    Ok(Json(ArtifactResponse {
        artifact: found.artifact,
        content: STANDARD.encode(&found.content),
    }))
}

/// Metadata only; content needs a permission-checked `get_artifact`.
pub async fn list_artifacts(
    State(mesh): State<Arc<Mesh>>,
    Query(filter): Query<ArtifactFilter>,
) -> Json<Vec<ArtifactRef>> {
    Json(mesh.list_artifacts(&filter))
}
