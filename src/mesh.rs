//! The assembled core: router, task manager, artifact store and ledger.
//!
//! `Mesh` is what the HTTP API and embedding applications talk to. It owns the
//! background jobs (liveness sweep, mailbox GC, checkpoint retention) and
//! shuts them down together with in-flight tasks.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::artifact::{ArtifactContent, ArtifactFilter, ArtifactRef, ArtifactStore, Requester};
use crate::config::Settings;
use crate::error::{Result, RoutingError};
use crate::ledger::{Checkpoint, CheckpointRef, Ledger};
use crate::protocol::{MailboxStore, Message};
use crate::reliability::RetryPolicy;
use crate::router::{
    AgentRegistration, DeliveryReceipt, Endpoint, EndpointTransport, HttpTransport,
    LocalTransport, Router,
};
use crate::task::{HandlerRegistry, TaskHandler, TaskManager, TaskSnapshot, TaskSpec, TaskState};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

/// Result of `send`: per-recipient receipts plus any tasks the deliveries
/// spawned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReport {
    pub message_id: String,
    pub receipts: Vec<DeliveryReceipt>,
    pub tasks: Vec<String>,
}

impl SendReport {
    fn new(message: &Message, receipts: Vec<DeliveryReceipt>) -> Self {
        let tasks = receipts.iter().filter_map(|r| r.task_id.clone()).collect();
        Self {
            message_id: message.id.clone(),
            receipts,
            tasks,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub expired_messages: usize,
    /// Messages left in mailboxes of agents that are gone.
    pub orphaned_messages: usize,
    pub checkpoints_removed: usize,
    pub tasks_evicted: usize,
    pub lanes_pruned: usize,
}

pub struct Mesh {
    settings: Settings,
    router: Arc<Router>,
    tasks: Arc<TaskManager>,
    artifacts: Arc<ArtifactStore>,
    ledger: Arc<Ledger>,
    mailboxes: Arc<MailboxStore>,
    shutdown_tx: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Mesh {
    /// Durable mesh under the configured data directory: `ledger.db` and
    /// `artifacts/`.
    pub fn open(settings: Settings) -> Result<Arc<Self>> {
        let data_dir = settings.storage.resolve_data_dir()?;
        Self::open_at(settings, &data_dir)
    }

    pub fn open_at(settings: Settings, data_dir: &Path) -> Result<Arc<Self>> {
        std::fs::create_dir_all(data_dir)?;
        let ledger = Ledger::open(data_dir.join("ledger.db"))?;
        let artifacts = ArtifactStore::open(data_dir.join("artifacts"))?;
        tracing::info!(data_dir = %data_dir.display(), "Opened mesh storage");
        Ok(Self::assemble(settings, ledger, artifacts))
    }

    /// Everything in memory. Meant for tests and embedding.
    pub fn in_memory(settings: Settings) -> Result<Arc<Self>> {
        let ledger = Ledger::open_in_memory()?;
        Ok(Self::assemble(settings, ledger, ArtifactStore::in_memory()))
    }

    fn assemble(settings: Settings, ledger: Ledger, artifacts: ArtifactStore) -> Arc<Self> {
        let ledger = Arc::new(ledger);
        let artifacts = Arc::new(artifacts);
        let mailboxes = Arc::new(MailboxStore::new());
        let handlers = Arc::new(HandlerRegistry::new());

        let tasks = TaskManager::new(
            &settings.tasks,
            RetryPolicy::from(&settings.retry),
            handlers,
            artifacts.clone(),
            Some(ledger.clone()),
        );
        let transport = EndpointTransport::new(
            LocalTransport::new(mailboxes.clone(), Some(tasks.clone())),
            HttpTransport::new(),
        );
        let router = Router::new(&settings, Arc::new(transport), Some(ledger.clone()));
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            settings,
            router,
            tasks,
            artifacts,
            ledger,
            mailboxes,
            shutdown_tx,
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    pub fn artifacts(&self) -> &Arc<ArtifactStore> {
        &self.artifacts
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn mailboxes(&self) -> &Arc<MailboxStore> {
        &self.mailboxes
    }

    // Agents

    pub fn register_handler(&self, task_type: impl Into<String>, handler: impl TaskHandler + 'static) {
        self.tasks.handlers().register(task_type, handler);
    }

    pub fn register_agent<I, S>(
        &self,
        agent_id: &str,
        capabilities: I,
        endpoint: Endpoint,
    ) -> Result<AgentRegistration>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registration = self.router.register(agent_id, capabilities, endpoint)?;
        if registration.endpoint == Endpoint::mailbox() {
            self.mailboxes.open(agent_id);
        }
        Ok(registration)
    }

    /// Also drops the agent's mailbox.
    pub fn deregister_agent(&self, agent_id: &str) -> Result<()> {
        self.router.deregister(agent_id)
    }

    pub fn heartbeat(&self, agent_id: &str) -> Result<()> {
        self.router.heartbeat(agent_id)
    }

    pub fn agents(&self) -> Vec<AgentRegistration> {
        self.router.agents()
    }

    // Messages

    pub async fn send(&self, message: &Message) -> Result<SendReport> {
        let receipts = self.router.route(message).await?;
        Ok(SendReport::new(message, receipts))
    }

    /// Broadcast, optionally only to agents holding `capability`.
    pub async fn broadcast(&self, message: &Message, capability: Option<&str>) -> Result<SendReport> {
        let receipts = self
            .router
            .broadcast(message, |agent| capability.map_or(true, |c| agent.has_capability(c)))
            .await?;
        Ok(SendReport::new(message, receipts))
    }

    /// Next message waiting in a local agent's mailbox.
    pub async fn receive(&self, agent_id: &str, timeout: Duration) -> Result<Option<Message>> {
        if self.router.agent(agent_id).is_none() {
            return Err(RoutingError::NoSuchAgent(agent_id.to_string()).into());
        }
        Ok(self.mailboxes.recv(agent_id, timeout).await)
    }

    // Tasks

    pub fn submit(&self, spec: TaskSpec) -> Result<String> {
        self.tasks.create_task(spec)
    }

    pub fn status(&self, task_id: &str) -> Result<TaskSnapshot> {
        self.tasks.get_status(task_id)
    }

    pub fn cancel(&self, task_id: &str) -> Result<()> {
        self.tasks.cancel(task_id)
    }

    pub async fn await_completion(
        &self,
        task_id: &str,
        timeout: Option<Duration>,
    ) -> Result<TaskSnapshot> {
        self.tasks.await_completion(task_id, timeout).await
    }

    pub fn list_tasks(&self, state: Option<TaskState>) -> Vec<TaskSnapshot> {
        self.tasks.list_tasks(state)
    }

    // Artifacts

    /// Latest version unless `version` is given.
    pub async fn get_artifact(
        &self,
        artifact_id: &str,
        requester: &Requester,
        version: Option<u32>,
    ) -> Result<ArtifactContent> {
        match version {
            Some(v) => self.artifacts.get_version(artifact_id, v, requester).await,
            None => self.artifacts.get(artifact_id, requester).await,
        }
    }

    pub fn list_artifacts(&self, filter: &ArtifactFilter) -> Vec<ArtifactRef> {
        self.artifacts.list(filter)
    }

    // Checkpoints

    pub fn list_checkpoints(&self, subject_id: Option<&str>) -> Result<Vec<CheckpointRef>> {
        self.ledger.list_checkpoints(subject_id)
    }

    pub fn restore_checkpoint(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        self.ledger.restore_checkpoint(checkpoint_id)
    }

    pub fn cleanup_checkpoints(&self, max_age: Duration) -> Result<usize> {
        self.ledger.cleanup_older_than(max_age)
    }

    // Background jobs

    /// Garbage-collect expired mailbox messages, state left behind by departed
    /// agents and finished tasks, and apply checkpoint retention.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let expired_messages = self
            .mailboxes
            .purge_all_expired(self.settings.messages.retention_ms);
        let orphaned_messages = self
            .mailboxes
            .retain_agents(|agent_id| self.router.agent(agent_id).is_some());
        let tasks_evicted = self.tasks.evict_finished(self.settings.tasks.retention());
        let lanes_pruned = self.router.prune_idle_lanes();

        let storage = &self.settings.storage;
        let mut checkpoints_removed = 0;
        if let Some(secs) = storage.checkpoint_max_age_secs {
            match self.ledger.cleanup_older_than(Duration::from_secs(secs)) {
                Ok(n) => checkpoints_removed += n,
                Err(e) => tracing::error!("Checkpoint age cleanup failed: {}", e),
            }
        }
        if let Some(keep) = storage.checkpoint_max_per_subject {
            match self.ledger.prune(keep) {
                Ok(n) => checkpoints_removed += n,
                Err(e) => tracing::error!("Checkpoint prune failed: {}", e),
            }
        }

        let report = MaintenanceReport {
            expired_messages,
            orphaned_messages,
            checkpoints_removed,
            tasks_evicted,
            lanes_pruned,
        };
        if report != MaintenanceReport::default() {
            tracing::info!(
                expired_messages,
                orphaned_messages,
                checkpoints_removed,
                tasks_evicted,
                lanes_pruned,
                "Maintenance pass"
            );
        }
        report
    }

    /// Start the liveness sweep and the maintenance loop.
    pub fn start_background(self: &Arc<Self>) {
        let monitor = self.router.spawn_heartbeat_monitor(self.shutdown_tx.subscribe());

        let mesh = Arc::downgrade(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let maintenance = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(mesh) = mesh.upgrade() else { break };
                        mesh.run_maintenance();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Maintenance loop stopped");
        });

        let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
        background.push(monitor);
        background.push(maintenance);
    }

    /// Stop background jobs and cancel in-flight tasks.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down mesh");
        let _ = self.shutdown_tx.send(true);
        let cancelled = self.tasks.shutdown().await;

        let handles: Vec<JoinHandle<()>> = {
            let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
            background.drain(..).collect()
        };
        for handle in handles {
            if tokio::time::timeout(SHUTDOWN_WAIT, handle).await.is_err() {
                tracing::warn!("Background job did not stop in time");
            }
        }
        tracing::info!(cancelled, "Mesh stopped");
    }
}
