//! API endpoints module.

pub mod agents;
pub mod artifacts;
pub mod checkpoints;
pub mod messages;
pub mod tasks;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::{Error, RoutingError};

pub use agents::{agent_heartbeat, create_agent, delete_agent, get_agent, list_agents};
pub use artifacts::{get_artifact, list_artifacts};
pub use checkpoints::{cleanup_checkpoints, get_checkpoint, list_checkpoints};
pub use messages::{receive_message, send_message};
pub use tasks::{cancel_task, create_task, get_task, list_tasks};

/// Error body returned by every endpoint.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub kind: &'static str,
    #[serde(skip)]
    pub status: StatusCode,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            kind: "validation",
            status: StatusCode::BAD_REQUEST,
        }
    }
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Validation { .. } => StatusCode::BAD_REQUEST,
        Error::Routing(RoutingError::NoSuchAgent(_)) => StatusCode::NOT_FOUND,
        Error::Routing(RoutingError::AgentUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Routing(RoutingError::Expired(_)) => StatusCode::GONE,
        Error::DuplicateAgent(_) | Error::AlreadyTerminal { .. } => StatusCode::CONFLICT,
        Error::Permission(_) => StatusCode::FORBIDDEN,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::TaskExecution { .. }
        | Error::Config(_)
        | Error::Ledger(_)
        | Error::Io(_)
        | Error::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::error!(kind = err.kind(), "API error: {}", err);
        } else {
            tracing::debug!(kind = err.kind(), "API rejection: {}", err);
        }
        Self {
            error: err.to_string(),
            kind: err.kind(),
            status,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (Error::validation("bad"), StatusCode::BAD_REQUEST),
            (RoutingError::NoSuchAgent("x".into()).into(), StatusCode::NOT_FOUND),
            (RoutingError::AgentUnavailable("x".into()).into(), StatusCode::SERVICE_UNAVAILABLE),
            (RoutingError::Expired("m".into()).into(), StatusCode::GONE),
            (Error::DuplicateAgent("x".into()), StatusCode::CONFLICT),
            (Error::Permission("x".into()), StatusCode::FORBIDDEN),
            (Error::Timeout("x".into()), StatusCode::GATEWAY_TIMEOUT),
            (Error::Ledger("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            let kind = err.kind();
            let api = ApiError::from(err);
            assert_eq!(api.status, expected, "{}", kind);
            assert_eq!(api.kind, kind);
        }
    }
}
