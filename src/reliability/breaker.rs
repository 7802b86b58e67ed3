//! Per-agent circuit breakers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::BreakerSettings;
use crate::error::{Error, Result, RoutingError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    /// Consecutive failures older than this no longer count.
    pub window: Duration,
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::from(&BreakerSettings::default())
    }
}

impl From<&BreakerSettings> for BreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            window: Duration::from_millis(settings.window_ms),
            reset_timeout: Duration::from_millis(settings.reset_timeout_ms),
        }
    }
}

#[derive(Debug)]
struct Breaker {
    state: BreakerState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            trial_in_flight: false,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
        self.failures.clear();
    }
}

/// Failure isolation keyed by destination agent.
#[derive(Debug)]
pub struct CircuitBreakers {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl CircuitBreakers {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Breaker>> {
        self.breakers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask permission to attempt delivery to `agent_id`.
    ///
    /// Open breakers fail fast until `reset_timeout` has passed; then exactly
    /// one trial is let through (half-open). The returned permit must be
    /// resolved with [`BreakerPermit::succeed`] or [`BreakerPermit::fail`];
    /// dropping it unresolved counts as a failure.
    pub fn try_acquire(&self, agent_id: &str) -> Result<BreakerPermit<'_>> {
        let now = Instant::now();
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(agent_id.to_string())
            .or_insert_with(Breaker::new);

        let admitted = match breaker.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let ready = breaker
                    .opened_at
                    .map_or(true, |at| now.duration_since(at) >= self.config.reset_timeout);
                if ready {
                    breaker.state = BreakerState::HalfOpen;
                    breaker.trial_in_flight = true;
                    tracing::info!(agent_id, "Circuit half-open, allowing trial delivery");
                    Ok(())
                } else {
                    Err(Error::Routing(RoutingError::AgentUnavailable(format!(
                        "{} (circuit open)",
                        agent_id
                    ))))
                }
            }
            BreakerState::HalfOpen => {
                if breaker.trial_in_flight {
                    Err(Error::Routing(RoutingError::AgentUnavailable(format!(
                        "{} (circuit half-open, trial in flight)",
                        agent_id
                    ))))
                } else {
                    breaker.trial_in_flight = true;
                    Ok(())
                }
            }
        };
        admitted.map(|()| BreakerPermit {
            breakers: self,
            agent_id: agent_id.to_string(),
            resolved: false,
        })
    }

    pub fn record_success(&self, agent_id: &str) {
        let mut breakers = self.lock();
        if let Some(breaker) = breakers.get_mut(agent_id) {
            if breaker.state != BreakerState::Closed {
                tracing::info!(agent_id, "Circuit closed after successful delivery");
            }
            *breaker = Breaker::new();
        }
    }

    pub fn record_failure(&self, agent_id: &str) {
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(agent_id.to_string())
            .or_insert_with(Breaker::new);
        self.fail(agent_id, breaker, Instant::now());
    }

    /// Failure of an attempt nobody resolved. Agents reset in the meantime
    /// stay reset.
    fn record_abandoned(&self, agent_id: &str) {
        let mut breakers = self.lock();
        if let Some(breaker) = breakers.get_mut(agent_id) {
            tracing::debug!(agent_id, state = %breaker.state, "Delivery attempt abandoned");
            self.fail(agent_id, breaker, Instant::now());
        }
    }

    fn fail(&self, agent_id: &str, breaker: &mut Breaker, now: Instant) {
        match breaker.state {
            BreakerState::HalfOpen => {
                breaker.open(now);
                tracing::warn!(agent_id, "Trial delivery failed, circuit re-opened");
            }
            BreakerState::Open => {}
            BreakerState::Closed => {
                breaker.failures.push_back(now);
                while let Some(first) = breaker.failures.front() {
                    if now.duration_since(*first) > self.config.window {
                        breaker.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if breaker.failures.len() as u32 >= self.config.failure_threshold {
                    breaker.open(now);
                    tracing::warn!(
                        agent_id,
                        threshold = self.config.failure_threshold,
                        "Circuit opened"
                    );
                }
            }
        }
    }

    pub fn state(&self, agent_id: &str) -> BreakerState {
        self.lock()
            .get(agent_id)
            .map_or(BreakerState::Closed, |b| b.state)
    }

    /// Drop all state for an agent (e.g. on deregistration).
    pub fn reset(&self, agent_id: &str) {
        self.lock().remove(agent_id);
    }
}

/// An admitted delivery attempt against one agent's breaker.
#[derive(Debug)]
#[must_use = "an unresolved permit counts as a failure when dropped"]
pub struct BreakerPermit<'a> {
    breakers: &'a CircuitBreakers,
    agent_id: String,
    resolved: bool,
}

impl BreakerPermit<'_> {
    pub fn succeed(mut self) {
        self.resolved = true;
        self.breakers.record_success(&self.agent_id);
    }

    pub fn fail(mut self) {
        self.resolved = true;
        self.breakers.record_failure(&self.agent_id);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.breakers.record_abandoned(&self.agent_id);
        }
    }
}
