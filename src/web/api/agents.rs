//! API endpoints for agents.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, RoutingError};
use crate::mesh::Mesh;
use crate::reliability::BreakerState;
use crate::router::{AgentRegistration, Endpoint};

use super::ApiResult;

/// Agent API response.
#[derive(Serialize)]
pub struct AgentResponse {
    #[serde(flatten)]
    pub registration: AgentRegistration,
    pub breaker: BreakerState,
}

impl AgentResponse {
    fn new(mesh: &Mesh, registration: AgentRegistration) -> Self {
        let breaker = mesh.router().breaker_state(&registration.agent_id);
        Self {
            registration,
            breaker,
        }
    }
}

/// Register agent request.
#[derive(Deserialize)]
pub struct CreateAgentRequest {
    pub agent_id: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default = "Endpoint::mailbox")]
    pub endpoint: Endpoint,
}

/// List all agents.
pub async fn list_agents(State(mesh): State<Arc<Mesh>>) -> Json<Vec<AgentResponse>> {
    let agents = mesh
        .agents()
        .into_iter()
        .map(|a| AgentResponse::new(&mesh, a))
        .collect();
    Json(agents)
}

/// Get a single agent.
pub async fn get_agent(
    State(mesh): State<Arc<Mesh>>,
    Path(id): Path<String>,
) -> ApiResult<Json<AgentResponse>> {
    let agent = mesh
        .router()
        .agent(&id)
        .ok_or_else(|| Error::from(RoutingError::NoSuchAgent(id.clone())))?;
    Ok(Json(AgentResponse::new(&mesh, agent)))
}

/// Register an agent.
pub async fn create_agent(
    State(mesh): State<Arc<Mesh>>,
    Json(payload): Json<CreateAgentRequest>,
) -> ApiResult<(StatusCode, Json<AgentResponse>)> {
    let registration =
        mesh.register_agent(&payload.agent_id, payload.capabilities, payload.endpoint)?;
    Ok((StatusCode::CREATED, Json(AgentResponse::new(&mesh, registration))))
}

/// Deregister an agent.
pub async fn delete_agent(
    State(mesh): State<Arc<Mesh>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    mesh.deregister_agent(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn agent_heartbeat(
    State(mesh): State<Arc<Mesh>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    mesh.heartbeat(&id)?;
    Ok(StatusCode::NO_CONTENT)
}
