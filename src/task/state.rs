//! Task states and the records observed by callers.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::artifact::ArtifactRef;
use crate::error::Error;
use crate::protocol::{AgentId, Message, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Created | TaskState::Running)
    }

    /// Edges of `CREATED -> RUNNING -> {COMPLETED, FAILED, CANCELLED, TIMEOUT}`
    /// plus `CREATED -> CANCELLED`.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Created, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Timeout)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Created => "CREATED",
            TaskState::Running => "RUNNING",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
            TaskState::Cancelled => "CANCELLED",
            TaskState::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATED" => Ok(TaskState::Created),
            "RUNNING" => Ok(TaskState::Running),
            "COMPLETED" => Ok(TaskState::Completed),
            "FAILED" => Ok(TaskState::Failed),
            "CANCELLED" => Ok(TaskState::Cancelled),
            "TIMEOUT" => Ok(TaskState::Timeout),
            other => Err(Error::validation(format!("unknown task state '{}'", other))),
        }
    }
}

/// Error recorded on a terminal task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
    pub attempts: u32,
}

impl TaskError {
    pub fn from_error(err: &Error, attempts: u32) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
            attempts,
        }
    }
}

/// What a caller submits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Handler tag, resolved against the handler registry at creation.
    pub task_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input: Value,
    /// Falls back to the configured default.
    #[serde(default, with = "opt_millis", rename = "timeout_ms")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub priority: Priority,
    /// Agent the task runs on behalf of.
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    /// Message that triggered the task, when spawned by delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
}

impl TaskSpec {
    pub fn new(task_type: impl Into<String>, input: Value) -> Self {
        Self {
            task_type: task_type.into(),
            description: String::new(),
            input,
            timeout: None,
            priority: Priority::default(),
            agent_id: None,
            message: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<AgentId>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.message = Some(message);
        self
    }
}

/// Handed to the handler on every attempt.
#[derive(Debug, Clone)]
pub struct TaskInput {
    pub payload: Value,
    pub message: Option<Message>,
}

/// Point-in-time copy of a task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub task_type: String,
    pub description: String,
    pub agent_id: Option<AgentId>,
    pub state: TaskState,
    pub priority: Priority,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub timeout_ms: u64,
    pub attempts: u32,
    pub result: Option<Value>,
    pub artifacts: Vec<ArtifactRef>,
    pub error: Option<TaskError>,
}

impl TaskSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
