//! Router: agent registry, unicast/broadcast delivery and liveness.
//!
//! Deliveries to the same recipient from the same sender go through a fair
//! per-lane lock, so they land in the order they were routed. Each delivery
//! runs under a deadline derived from the message expiry, is retried with
//! backoff on transient failures, and is gated by the recipient's breaker.

pub mod registry;
pub mod transport;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::Settings;
use crate::error::{Error, Result, RoutingError};
use crate::ledger::Ledger;
use crate::protocol::{self, now_ms, AgentId, Message};
use crate::reliability::{BreakerConfig, BreakerState, CircuitBreakers, RetryPolicy};

pub use registry::{AgentRegistration, AgentRegistry, Endpoint};
pub use transport::{
    task_payload, Delivered, EndpointTransport, HttpTransport, LocalTransport, Transport,
};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    Failed { kind: String, reason: String },
}

/// Per-recipient result of a route or broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub recipient: AgentId,
    pub outcome: DeliveryOutcome,
    pub attempts: u32,
    /// Task spawned by the delivery, if the recipient runs one per message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub at: i64,
}

impl DeliveryReceipt {
    fn delivered(message: &Message, recipient: &str, attempts: u32, delivered: Delivered) -> Self {
        Self {
            message_id: message.id.clone(),
            recipient: recipient.to_string(),
            outcome: DeliveryOutcome::Delivered,
            attempts,
            task_id: delivered.task_id,
            at: now_ms(),
        }
    }

    fn failed(message: &Message, recipient: &str, attempts: u32, err: &Error) -> Self {
        Self {
            message_id: message.id.clone(),
            recipient: recipient.to_string(),
            outcome: DeliveryOutcome::Failed {
                kind: err.kind().to_string(),
                reason: err.to_string(),
            },
            attempts,
            task_id: None,
            at: now_ms(),
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.outcome == DeliveryOutcome::Delivered
    }
}

/// Registry changes published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RouterEvent {
    AgentRegistered { agent_id: AgentId },
    /// The agent left or was presumed dead. Pending deliveries to it fail.
    AgentUnavailable { agent_id: AgentId, reason: String },
}

struct Delivery {
    receipt: DeliveryReceipt,
    error: Option<Error>,
}

pub struct Router {
    registry: AgentRegistry,
    transport: Arc<dyn Transport>,
    breakers: CircuitBreakers,
    retry: RetryPolicy,
    lanes: Mutex<HashMap<(AgentId, AgentId), Arc<AsyncMutex<()>>>>,
    events: broadcast::Sender<RouterEvent>,
    ledger: Option<Arc<Ledger>>,
    max_message_bytes: usize,
    default_deadline: Duration,
    heartbeat_interval: Duration,
    liveness_timeout: Duration,
}

impl Router {
    pub fn new(
        settings: &Settings,
        transport: Arc<dyn Transport>,
        ledger: Option<Arc<Ledger>>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            registry: AgentRegistry::new(),
            transport,
            breakers: CircuitBreakers::new(BreakerConfig::from(&settings.breaker)),
            retry: RetryPolicy::from(&settings.retry),
            lanes: Mutex::new(HashMap::new()),
            events,
            ledger,
            max_message_bytes: settings.messages.max_message_bytes,
            default_deadline: settings.messages.delivery_deadline(),
            heartbeat_interval: settings.router.heartbeat_interval(),
            liveness_timeout: settings.router.liveness_timeout(),
        })
    }

    pub fn register<I, S>(
        &self,
        agent_id: &str,
        capabilities: I,
        endpoint: Endpoint,
    ) -> Result<AgentRegistration>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let capabilities: BTreeSet<String> = capabilities.into_iter().map(Into::into).collect();
        let registration = self.registry.register(agent_id, capabilities, endpoint)?;
        tracing::info!(
            agent_id,
            capabilities = ?registration.capabilities,
            endpoint = ?registration.endpoint,
            "Agent registered"
        );
        let _ = self.events.send(RouterEvent::AgentRegistered {
            agent_id: agent_id.to_string(),
        });
        Ok(registration)
    }

    /// Remove an agent. Unknown ids are fine.
    pub fn deregister(&self, agent_id: &str) -> Result<()> {
        if self.registry.deregister(agent_id).is_some() {
            tracing::info!(agent_id, "Agent deregistered");
            self.forget(agent_id, "deregistered");
        } else {
            tracing::debug!(agent_id, "Deregister of unknown agent ignored");
        }
        Ok(())
    }

    pub fn heartbeat(&self, agent_id: &str) -> Result<()> {
        let at = self.registry.heartbeat(agent_id)?;
        tracing::trace!(agent_id, at, "Heartbeat");
        Ok(())
    }

    pub fn agent(&self, agent_id: &str) -> Option<AgentRegistration> {
        self.registry.get(agent_id)
    }

    pub fn agents(&self) -> Vec<AgentRegistration> {
        self.registry.list()
    }

    pub fn agents_with_capability(&self, capability: &str) -> Vec<AgentRegistration> {
        self.registry.with_capability(capability)
    }

    pub fn breaker_state(&self, agent_id: &str) -> BreakerState {
        self.breakers.state(agent_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.events.subscribe()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Deliver to every listed recipient.
    ///
    /// Unresolved recipients fail the whole call before anything is sent.
    /// When every delivery fails the first failure is returned as the error;
    /// otherwise per-recipient receipts report partial failure.
    pub async fn route(self: &Arc<Self>, message: &Message) -> Result<Vec<DeliveryReceipt>> {
        protocol::validate(message, self.max_message_bytes)?;
        if message.broadcast {
            return self.broadcast(message, |_| true).await;
        }
        self.reject_expired(message)?;

        let mut targets = Vec::with_capacity(message.recipients.len());
        for recipient in &message.recipients {
            match self.registry.get(recipient) {
                Some(agent) => targets.push(agent),
                None => {
                    tracing::warn!(
                        message_id = %message.id,
                        recipient = %recipient,
                        "Route failed: no such agent"
                    );
                    return Err(RoutingError::NoSuchAgent(recipient.clone()).into());
                }
            }
        }

        let deliveries = self.deliver_all(message, targets).await;
        if deliveries.iter().all(|d| d.error.is_some()) {
            if let Some(err) = deliveries.into_iter().find_map(|d| d.error) {
                return Err(err);
            }
            return Ok(Vec::new());
        }
        Ok(deliveries.into_iter().map(|d| d.receipt).collect())
    }

    /// Deliver to every agent accepted by `predicate`.
    ///
    /// With listed recipients, those are the candidates and unresolved ones get
    /// a failed receipt. Without, every registered agent except the sender is a
    /// candidate. Agents the predicate rejects get no receipt at all.
    pub async fn broadcast<P>(
        self: &Arc<Self>,
        message: &Message,
        predicate: P,
    ) -> Result<Vec<DeliveryReceipt>>
    where
        P: Fn(&AgentRegistration) -> bool,
    {
        protocol::validate(message, self.max_message_bytes)?;
        self.reject_expired(message)?;

        let mut receipts = Vec::new();
        let targets: Vec<AgentRegistration> = if message.recipients.is_empty() {
            self.registry
                .list()
                .into_iter()
                .filter(|a| a.agent_id != message.sender && predicate(a))
                .collect()
        } else {
            let mut targets = Vec::new();
            for recipient in &message.recipients {
                match self.registry.get(recipient) {
                    Some(agent) if predicate(&agent) => targets.push(agent),
                    Some(_) => {}
                    None => {
                        tracing::debug!(
                            message_id = %message.id,
                            recipient = %recipient,
                            "Broadcast skipping unknown recipient"
                        );
                        let err = Error::from(RoutingError::NoSuchAgent(recipient.clone()));
                        receipts.push(DeliveryReceipt::failed(message, recipient, 0, &err));
                    }
                }
            }
            targets
        };

        tracing::debug!(
            message_id = %message.id,
            targets = targets.len(),
            "Broadcasting"
        );
        receipts.extend(
            self.deliver_all(message, targets)
                .await
                .into_iter()
                .map(|d| d.receipt),
        );
        Ok(receipts)
    }

    /// Deregister every agent that missed its heartbeats.
    pub fn sweep_dead_agents(&self) -> Vec<AgentId> {
        let dead = self
            .registry
            .remove_stale(now_ms(), self.liveness_timeout.as_millis() as u64);

        dead.into_iter()
            .map(|agent| {
                tracing::warn!(
                    agent_id = %agent.agent_id,
                    last_heartbeat = agent.last_heartbeat,
                    "Agent missed heartbeats, presumed dead"
                );
                self.forget(&agent.agent_id, "missed heartbeats");
                self.checkpoint(
                    &agent.agent_id,
                    "agent_dead",
                    json!({ "registration": agent }),
                    json!({ "liveness_timeout_ms": self.liveness_timeout.as_millis() as u64 }),
                );
                agent.agent_id
            })
            .collect()
    }

    /// Periodic liveness sweep until `shutdown` flips to true.
    pub fn spawn_heartbeat_monitor(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(router.heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                interval_ms = router.heartbeat_interval.as_millis() as u64,
                "Heartbeat monitor started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let dead = router.sweep_dead_agents();
                        if !dead.is_empty() {
                            tracing::info!(count = dead.len(), "Swept dead agents");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Heartbeat monitor stopped");
        })
    }

    fn reject_expired(&self, message: &Message) -> Result<()> {
        if message.is_expired() {
            tracing::warn!(message_id = %message.id, "Message expired before delivery");
            self.checkpoint(
                &message.id,
                "expired",
                json!({ "expires_at": message.expires_at }),
                json!({ "sender": message.sender }),
            );
            return Err(RoutingError::Expired(message.id.clone()).into());
        }
        Ok(())
    }

    fn forget(&self, agent_id: &str, reason: &str) {
        self.breakers.reset(agent_id);
        self.transport.forget(agent_id);
        self.lanes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(sender, recipient), _| sender != agent_id && recipient != agent_id);
        let _ = self.events.send(RouterEvent::AgentUnavailable {
            agent_id: agent_id.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Drop lanes nobody is delivering through. Returns how many went.
    pub fn prune_idle_lanes(&self) -> usize {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        let before = lanes.len();
        // Deliveries hold a clone while queued or running.
        lanes.retain(|_, lane| Arc::strong_count(lane) > 1);
        before - lanes.len()
    }

    fn lane(&self, sender: &str, recipient: &str) -> Arc<AsyncMutex<()>> {
        self.lanes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry((sender.to_string(), recipient.to_string()))
            .or_default()
            .clone()
    }

    fn checkpoint(
        &self,
        subject_id: &str,
        recovery_point: &str,
        state: serde_json::Value,
        context: serde_json::Value,
    ) {
        let Some(ledger) = &self.ledger else {
            return;
        };
        if let Err(e) =
            ledger.create_checkpoint(subject_id, state, context, recovery_point, json!({}))
        {
            tracing::error!(subject_id, recovery_point, "Checkpoint write failed: {}", e);
        }
    }

    async fn deliver_all(
        self: &Arc<Self>,
        message: &Message,
        targets: Vec<AgentRegistration>,
    ) -> Vec<Delivery> {
        let message = Arc::new(message.clone());
        let mut set = JoinSet::new();
        for (i, agent) in targets.into_iter().enumerate() {
            let router = self.clone();
            let message = message.clone();
            set.spawn(async move { (i, router.deliver_one(agent, message).await) });
        }

        let mut deliveries = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(delivery) => deliveries.push(delivery),
                Err(e) => tracing::error!(message_id = %message.id, "Delivery task failed: {}", e),
            }
        }
        deliveries.sort_by_key(|(i, _)| *i);
        deliveries.into_iter().map(|(_, d)| d).collect()
    }

    async fn deliver_one(self: Arc<Self>, agent: AgentRegistration, message: Arc<Message>) -> Delivery {
        let recipient = agent.agent_id.clone();
        let budget = message
            .remaining_ttl()
            .map_or(self.default_deadline, |ttl| ttl.min(self.default_deadline));
        let deadline = Instant::now() + budget;
        let attempts = AtomicU32::new(0);
        let mut events = self.events.subscribe();

        let unavailable = async {
            loop {
                match events.recv().await {
                    Ok(RouterEvent::AgentUnavailable { agent_id, reason }) if agent_id == recipient => {
                        return reason
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
                }
            }
        };

        let result = tokio::select! {
            timed = tokio::time::timeout_at(deadline, self.deliver_in_lane(&agent, &message, &attempts)) => {
                timed.unwrap_or_else(|_| {
                    // An attempt cut off here drops its permit, which charges the breaker.
                    // Time spent queued in the lane does not.
                    Err(Error::Timeout(format!(
                        "delivery of {} to {} exceeded {:?}",
                        message.id, recipient, budget
                    )))
                })
            }
            reason = unavailable => {
                Err(RoutingError::AgentUnavailable(format!("{} ({})", recipient, reason)).into())
            }
        };

        let attempts = attempts.load(Ordering::Relaxed);
        match result {
            Ok(delivered) => {
                tracing::debug!(
                    message_id = %message.id,
                    recipient = %recipient,
                    attempts,
                    task_id = ?delivered.task_id,
                    "Delivered"
                );
                Delivery {
                    receipt: DeliveryReceipt::delivered(&message, &recipient, attempts, delivered),
                    error: None,
                }
            }
            Err(err) => {
                tracing::warn!(
                    message_id = %message.id,
                    recipient = %recipient,
                    attempts,
                    kind = err.kind(),
                    "Delivery failed: {}",
                    err
                );
                self.checkpoint(
                    &message.id,
                    "delivery_failed",
                    json!({ "recipient": recipient, "kind": err.kind(), "reason": err.to_string() }),
                    json!({ "sender": message.sender, "attempts": attempts }),
                );
                Delivery {
                    receipt: DeliveryReceipt::failed(&message, &recipient, attempts, &err),
                    error: Some(err),
                }
            }
        }
    }

    async fn deliver_in_lane(
        &self,
        agent: &AgentRegistration,
        message: &Message,
        attempts: &AtomicU32,
    ) -> Result<Delivered> {
        let lane = self.lane(&message.sender, &agent.agent_id);
        let _turn = lane.lock().await;

        if message.is_expired() {
            return Err(RoutingError::Expired(message.id.clone()).into());
        }

        let router = self;
        self.retry
            .run(
                None,
                move |attempt| {
                    attempts.store(attempt, Ordering::Relaxed);
                    router.attempt(agent, message)
                },
                move |attempt, err, retry_in| {
                    router.record_attempt_failure(message, agent, attempt, err, retry_in)
                },
            )
            .await
            .result
    }

    async fn attempt(&self, agent: &AgentRegistration, message: &Message) -> Result<Delivered> {
        let permit = self.breakers.try_acquire(&agent.agent_id)?;
        match self.transport.deliver(agent, message).await {
            Ok(delivered) => {
                permit.succeed();
                Ok(delivered)
            }
            Err(e) if e.is_retryable() => {
                permit.fail();
                Err(e)
            }
            Err(e) => {
                // The agent answered, so it is reachable.
                permit.succeed();
                Err(e)
            }
        }
    }

    fn record_attempt_failure(
        &self,
        message: &Message,
        agent: &AgentRegistration,
        attempt: u32,
        err: &Error,
        retry_in: Option<Duration>,
    ) {
        tracing::debug!(
            message_id = %message.id,
            recipient = %agent.agent_id,
            attempt,
            kind = err.kind(),
            retry_in_ms = retry_in.map(|d| d.as_millis() as u64),
            "Delivery attempt failed: {}",
            err
        );
        self.checkpoint(
            &message.id,
            "delivery_attempt_failed",
            json!({ "recipient": agent.agent_id, "kind": err.kind(), "reason": err.to_string() }),
            json!({ "attempt": attempt, "retry_in_ms": retry_in.map(|d| d.as_millis() as u64) }),
        );
    }
}
