//! API endpoints for messages.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;

use crate::mesh::{Mesh, SendReport};
use crate::protocol::Message;

use super::ApiResult;

/// Longest a mailbox poll may block.
const MAX_POLL: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Deserialize)]
pub struct SendQuery {
    /// Broadcast only to agents holding this capability.
    pub capability: Option<String>,
}

/// Route a wire-format message. Returns one receipt per recipient.
pub async fn send_message(
    State(mesh): State<Arc<Mesh>>,
    Query(query): Query<SendQuery>,
    body: Bytes,
) -> ApiResult<Json<SendReport>> {
    let message = Message::deserialize(&body)?;
    let report = match query.capability.as_deref() {
        Some(capability) => mesh.broadcast(&message, Some(capability)).await?,
        None => mesh.send(&message).await?,
    };
    Ok(Json(report))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReceiveQuery {
    #[serde(default)]
    pub timeout_ms: u64,
}

/// Pop the next message from a local agent's mailbox, long-polling up to
/// `timeout_ms`. 204 when nothing arrived.
pub async fn receive_message(
    State(mesh): State<Arc<Mesh>>,
    Path(agent_id): Path<String>,
    Query(query): Query<ReceiveQuery>,
) -> ApiResult<Response> {
    let timeout = Duration::from_millis(query.timeout_ms).min(MAX_POLL);
    Ok(match mesh.receive(&agent_id, timeout).await? {
        Some(message) => Json(message).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}
