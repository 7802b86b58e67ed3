//! Route definitions for web server.

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use super::api;
use crate::mesh::Mesh;

/// Room for JSON framing around a message at the size ceiling.
const BODY_SLACK: usize = 64 * 1024;

/// Create the API router.
pub fn create_api_router() -> Router<Arc<Mesh>> {
    Router::new()
        // Messages
        .route("/messages", post(api::send_message))
        // Agents
        .route("/agents", get(api::list_agents).post(api::create_agent))
        .route("/agents/:id", get(api::get_agent).delete(api::delete_agent))
        .route("/agents/:id/heartbeat", post(api::agent_heartbeat))
        .route("/agents/:id/messages", get(api::receive_message))
        // Tasks
        .route("/tasks", get(api::list_tasks).post(api::create_task))
        .route("/tasks/:id", get(api::get_task))
        .route("/tasks/:id/cancel", post(api::cancel_task))
        // Artifacts
        .route("/artifacts", get(api::list_artifacts))
        .route("/artifacts/:id", get(api::get_artifact))
        // Checkpoints
        .route("/checkpoints", get(api::list_checkpoints))
        .route("/checkpoints/cleanup", post(api::cleanup_checkpoints))
        .route("/checkpoints/:id", get(api::get_checkpoint))
}

/// Create the full app router.
pub fn create_app_router(mesh: Arc<Mesh>) -> Router {
    let body_limit = mesh.settings().messages.max_message_bytes + BODY_SLACK;
    Router::new()
        .nest("/api", create_api_router())
        .route("/health", get(health_check))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(mesh)
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "OK"
}
