//! Error types for agentmesh.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Delivery failures reported by the router.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "target", rename_all = "snake_case")]
pub enum RoutingError {
    #[error("No such agent: {0}")]
    NoSuchAgent(String),

    #[error("Agent unavailable: {0}")]
    AgentUnavailable(String),

    #[error("Message expired: {0}")]
    Expired(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {reason}")]
    Validation { reason: String },

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Agent already registered: {0}")]
    DuplicateAgent(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Task execution error: {message}")]
    TaskExecution { message: String, retryable: bool },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Task {task_id} already terminal ({state})")]
    AlreadyTerminal { task_id: String, state: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn validation(reason: impl Into<String>) -> Self {
        Error::Validation {
            reason: reason.into(),
        }
    }

    /// Only transient delivery failures and handler errors flagged retryable
    /// are eligible for another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Routing(RoutingError::AgentUnavailable(_)) => true,
            Error::TaskExecution { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Stable label recorded in checkpoints and task snapshots.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "validation",
            Error::Routing(RoutingError::NoSuchAgent(_)) => "no_such_agent",
            Error::Routing(RoutingError::AgentUnavailable(_)) => "agent_unavailable",
            Error::Routing(RoutingError::Expired(_)) => "expired",
            Error::DuplicateAgent(_) => "duplicate_agent",
            Error::Permission(_) => "permission",
            Error::TaskExecution { .. } => "task_execution",
            Error::Timeout(_) => "timeout",
            Error::NotFound(_) => "not_found",
            Error::AlreadyTerminal { .. } => "already_terminal",
            Error::Config(_) => "config",
            Error::Ledger(_) => "ledger",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(Error::from(RoutingError::AgentUnavailable("a".into())).is_retryable());
        assert!(!Error::from(RoutingError::NoSuchAgent("a".into())).is_retryable());
        assert!(!Error::from(RoutingError::Expired("m".into())).is_retryable());
        assert!(!Error::validation("bad").is_retryable());
        assert!(!Error::Permission("nope".into()).is_retryable());
        assert!(Error::TaskExecution {
            message: "flaky".into(),
            retryable: true
        }
        .is_retryable());
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(Error::validation("x").kind(), "validation");
        assert_eq!(
            Error::from(RoutingError::NoSuchAgent("agent_x".into())).kind(),
            "no_such_agent"
        );
        assert_eq!(Error::Timeout("t".into()).kind(), "timeout");
    }
}
