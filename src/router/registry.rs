//! Agent registry: id to registration, guarded by its own lock.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, RoutingError};
use crate::protocol::{now_ms, AgentId};

/// Where deliveries for an agent go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Endpoint {
    /// In-process mailbox. With a task type, every delivery becomes a task.
    Local {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_type: Option<String>,
    },
    /// Remote agent accepting wire-format messages by POST.
    Http { url: String },
}

impl Endpoint {
    pub fn mailbox() -> Self {
        Endpoint::Local { task_type: None }
    }

    pub fn task(task_type: impl Into<String>) -> Self {
        Endpoint::Local {
            task_type: Some(task_type.into()),
        }
    }

    pub fn http(url: impl Into<String>) -> Self {
        Endpoint::Http { url: url.into() }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Endpoint::Local { task_type: Some(t) } if t.is_empty() => {
                Err(Error::validation("local endpoint task_type is empty"))
            }
            Endpoint::Http { url } if !(url.starts_with("http://") || url.starts_with("https://")) => {
                Err(Error::validation(format!("endpoint url '{}' is not http(s)", url)))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_id: AgentId,
    pub capabilities: BTreeSet<String>,
    pub endpoint: Endpoint,
    pub registered_at: i64,
    pub last_heartbeat: i64,
}

impl AgentRegistration {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, AgentRegistration>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        agent_id: &str,
        capabilities: BTreeSet<String>,
        endpoint: Endpoint,
    ) -> Result<AgentRegistration> {
        if agent_id.trim().is_empty() {
            return Err(Error::validation("agent id is empty"));
        }
        endpoint.validate()?;

        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        if agents.contains_key(agent_id) {
            return Err(Error::DuplicateAgent(agent_id.to_string()));
        }
        let now = now_ms();
        let registration = AgentRegistration {
            agent_id: agent_id.to_string(),
            capabilities,
            endpoint,
            registered_at: now,
            last_heartbeat: now,
        };
        agents.insert(agent_id.to_string(), registration.clone());
        Ok(registration)
    }

    pub fn deregister(&self, agent_id: &str) -> Option<AgentRegistration> {
        self.agents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(agent_id)
    }

    pub fn heartbeat(&self, agent_id: &str) -> Result<i64> {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| RoutingError::NoSuchAgent(agent_id.to_string()))?;
        agent.last_heartbeat = now_ms().max(agent.last_heartbeat);
        Ok(agent.last_heartbeat)
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRegistration> {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
            .cloned()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(agent_id)
    }

    /// All registrations, sorted by id.
    pub fn list(&self) -> Vec<AgentRegistration> {
        let mut agents: Vec<AgentRegistration> = self
            .agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    pub fn with_capability(&self, capability: &str) -> Vec<AgentRegistration> {
        self.list()
            .into_iter()
            .filter(|a| a.has_capability(capability))
            .collect()
    }

    /// Agents whose last heartbeat is older than `timeout_ms` at `now`.
    pub fn stale(&self, now: i64, timeout_ms: u64) -> Vec<AgentId> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        let mut stale: Vec<AgentId> = agents
            .values()
            .filter(|a| now.saturating_sub(a.last_heartbeat) > timeout_ms as i64)
            .map(|a| a.agent_id.clone())
            .collect();
        stale.sort();
        stale
    }

    /// Remove every stale agent under one write lock, so a heartbeat cannot
    /// land between the check and the removal.
    pub fn remove_stale(&self, now: i64, timeout_ms: u64) -> Vec<AgentRegistration> {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<AgentId> = agents
            .values()
            .filter(|a| now.saturating_sub(a.last_heartbeat) > timeout_ms as i64)
            .map(|a| a.agent_id.clone())
            .collect();
        let mut removed: Vec<AgentRegistration> =
            stale.iter().filter_map(|id| agents.remove(id)).collect();
        removed.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        removed
    }

    pub fn len(&self) -> usize {
        self.agents.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
