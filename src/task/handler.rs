//! Handler interface and the task-type registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::artifact::ArtifactDraft;
use crate::error::Error;
use crate::ledger::Ledger;
use crate::protocol::AgentId;

use super::cancel::CancellationToken;
use super::state::TaskInput;

/// Handler failure, classified by the handler itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub retryable: bool,
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<HandlerError> for Error {
    fn from(err: HandlerError) -> Self {
        Error::TaskExecution {
            message: err.message,
            retryable: err.retryable,
        }
    }
}

impl From<Error> for HandlerError {
    fn from(err: Error) -> Self {
        Self {
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

/// Successful handler result.
#[derive(Debug, Clone, Default)]
pub struct TaskOutput {
    pub result: Value,
    /// Attached to the task only if it completes.
    pub artifacts: Vec<ArtifactDraft>,
}

impl TaskOutput {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifact(mut self, draft: ArtifactDraft) -> Self {
        self.artifacts.push(draft);
        self
    }
}

/// Per-task context passed into every handler call.
#[derive(Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub agent_id: Option<AgentId>,
    /// 1-based attempt number.
    pub attempt: u32,
    pub cancel: CancellationToken,
    ledger: Option<Arc<Ledger>>,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: String,
        agent_id: Option<AgentId>,
        attempt: u32,
        cancel: CancellationToken,
        ledger: Option<Arc<Ledger>>,
    ) -> Self {
        Self {
            task_id,
            agent_id,
            attempt,
            cancel,
            ledger,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Record a handler-defined recovery point against this task.
    ///
    /// Returns `None` when the manager runs without a ledger.
    pub fn checkpoint(
        &self,
        recovery_point: &str,
        state: Value,
        context: Value,
    ) -> crate::Result<Option<String>> {
        let Some(ledger) = &self.ledger else {
            return Ok(None);
        };
        let metadata = serde_json::json!({ "attempt": self.attempt, "source": "handler" });
        ledger
            .create_checkpoint(&self.task_id, state, context, recovery_point, metadata)
            .map(Some)
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("agent_id", &self.agent_id)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Business logic for one task type.
///
/// Long-running handlers should watch `ctx.cancel` and return promptly once
/// it fires; handlers that ignore it are abandoned at the task timeout.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, input: TaskInput, ctx: TaskContext) -> Result<TaskOutput, HandlerError>;
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TaskInput, TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TaskOutput, HandlerError>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskInput, TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TaskOutput, HandlerError>> + Send,
{
    async fn handle(&self, input: TaskInput, ctx: TaskContext) -> Result<TaskOutput, HandlerError> {
        (self.0)(input, ctx).await
    }
}

/// Task-type tag to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the handler for `task_type`.
    pub fn register(&self, task_type: impl Into<String>, handler: impl TaskHandler + 'static) {
        let task_type = task_type.into();
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.insert(task_type.clone(), Arc::new(handler)).is_some() {
            tracing::info!(task_type = %task_type, "Replaced task handler");
        } else {
            tracing::debug!(task_type = %task_type, "Registered task handler");
        }
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_type)
            .cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(task_type)
    }

    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}
