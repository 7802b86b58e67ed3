//! Delivery transports: in-process mailboxes/tasks and HTTP.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;

use crate::error::{Error, Result, RoutingError};
use crate::protocol::{MailboxStore, Message, Part};
use crate::task::{TaskManager, TaskSpec};

use super::registry::{AgentRegistration, Endpoint};

/// Successful hand-off to an agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivered {
    /// Task spawned by the delivery, if any.
    pub task_id: Option<String>,
}

/// One delivery attempt to one registered agent.
///
/// Transient failures must surface as `RoutingError::AgentUnavailable` so the
/// reliability layer retries them and counts them against the breaker.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, agent: &AgentRegistration, message: &Message) -> Result<Delivered>;

    /// Release whatever is kept for an agent that left.
    fn forget(&self, _agent_id: &str) {}
}

/// Delivers to local agents: into the agent's mailbox, or as a new task when
/// the endpoint names a task type.
pub struct LocalTransport {
    mailboxes: Arc<MailboxStore>,
    tasks: Option<Arc<TaskManager>>,
}

impl LocalTransport {
    pub fn new(mailboxes: Arc<MailboxStore>, tasks: Option<Arc<TaskManager>>) -> Self {
        Self { mailboxes, tasks }
    }

    pub fn mailboxes(&self) -> &Arc<MailboxStore> {
        &self.mailboxes
    }
}

/// Task payload for a delivered message: the first data part, else the text
/// parts joined, else null. The full message travels alongside.
pub fn task_payload(message: &Message) -> Value {
    if let Some(data) = message.parts.iter().find_map(|p| match p {
        Part::Data { data, .. } => Some(data.clone()),
        _ => None,
    }) {
        return data;
    }
    let text: Vec<&str> = message.parts.iter().filter_map(Part::as_text).collect();
    if text.is_empty() {
        Value::Null
    } else {
        Value::String(text.join("\n"))
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn deliver(&self, agent: &AgentRegistration, message: &Message) -> Result<Delivered> {
        let task_type = match &agent.endpoint {
            Endpoint::Local { task_type } => task_type.as_deref(),
            Endpoint::Http { .. } => {
                return Err(Error::validation(format!(
                    "agent {} has an http endpoint",
                    agent.agent_id
                )))
            }
        };

        match (task_type, &self.tasks) {
            (Some(task_type), Some(tasks)) => {
                let spec = TaskSpec::new(task_type, task_payload(message))
                    .with_description(format!("message {} from {}", message.id, message.sender))
                    .with_priority(message.priority)
                    .with_agent(agent.agent_id.clone())
                    .with_message(message.clone());
                let task_id = tasks.create_task(spec)?;
                tracing::debug!(
                    message_id = %message.id,
                    agent_id = %agent.agent_id,
                    task_id = %task_id,
                    "Delivery spawned task"
                );
                Ok(Delivered {
                    task_id: Some(task_id),
                })
            }
            (Some(task_type), None) => {
                tracing::warn!(
                    agent_id = %agent.agent_id,
                    task_type,
                    "No task manager attached, delivering to mailbox"
                );
                self.mailboxes.deliver(&agent.agent_id, message.clone());
                Ok(Delivered::default())
            }
            (None, _) => {
                self.mailboxes.deliver(&agent.agent_id, message.clone());
                Ok(Delivered::default())
            }
        }
    }

    fn forget(&self, agent_id: &str) {
        let dropped = self.mailboxes.remove(agent_id);
        if dropped > 0 {
            tracing::info!(agent_id, dropped, "Dropped undelivered mailbox messages");
        }
    }
}

/// POSTs the wire JSON of a message to the agent's URL.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, agent: &AgentRegistration, message: &Message) -> Result<Delivered> {
        let Endpoint::Http { url } = &agent.endpoint else {
            return Err(Error::validation(format!(
                "agent {} has no http endpoint",
                agent.agent_id
            )));
        };

        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(message.serialize()?)
            .send()
            .await
            .map_err(|e| {
                tracing::debug!(agent_id = %agent.agent_id, "HTTP delivery error: {}", e);
                RoutingError::AgentUnavailable(agent.agent_id.clone())
            })?;

        let status = response.status();
        if status.is_success() {
            // A remote mesh answers with the tasks it spawned; anything else is fine too.
            let task_id = response
                .json::<Value>()
                .await
                .ok()
                .and_then(|body| body.get("tasks")?.get(0)?.as_str().map(str::to_string));
            return Ok(Delivered { task_id });
        }

        tracing::debug!(agent_id = %agent.agent_id, %status, "HTTP delivery rejected");
        match status {
            StatusCode::NOT_FOUND => Err(RoutingError::NoSuchAgent(agent.agent_id.clone()).into()),
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                Err(RoutingError::AgentUnavailable(agent.agent_id.clone()).into())
            }
            s => Err(Error::validation(format!(
                "agent {} rejected message: {}",
                agent.agent_id, s
            ))),
        }
    }
}

/// Picks the transport by endpoint kind.
pub struct EndpointTransport {
    local: LocalTransport,
    http: HttpTransport,
}

impl EndpointTransport {
    pub fn new(local: LocalTransport, http: HttpTransport) -> Self {
        Self { local, http }
    }
}

#[async_trait]
impl Transport for EndpointTransport {
    async fn deliver(&self, agent: &AgentRegistration, message: &Message) -> Result<Delivered> {
        match agent.endpoint {
            Endpoint::Local { .. } => self.local.deliver(agent, message).await,
            Endpoint::Http { .. } => self.http.deliver(agent, message).await,
        }
    }

    fn forget(&self, agent_id: &str) {
        self.local.forget(agent_id);
    }
}
