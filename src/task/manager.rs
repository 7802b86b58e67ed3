//! Task manager: state table, worker pool and the per-task run loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::artifact::{ArtifactRef, ArtifactStore};
use crate::config::TaskSettings;
use crate::error::{Error, Result};
use crate::ledger::Ledger;
use crate::protocol::{generate_id, now_ms, AgentId, Priority};
use crate::reliability::RetryPolicy;

use super::cancel::CancellationToken;
use super::handler::{HandlerRegistry, TaskContext, TaskHandler};
use super::state::{TaskError, TaskInput, TaskSnapshot, TaskSpec, TaskState};

/// Authoritative task record. Only mutated under its slot's lock.
#[derive(Debug)]
struct TaskRecord {
    id: String,
    task_type: String,
    description: String,
    agent_id: Option<AgentId>,
    state: TaskState,
    priority: Priority,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    timeout: Duration,
    attempts: u32,
    result: Option<Value>,
    artifacts: Vec<ArtifactRef>,
    error: Option<TaskError>,
    cancel_requested: bool,
}

impl TaskRecord {
    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            task_type: self.task_type.clone(),
            description: self.description.clone(),
            agent_id: self.agent_id.clone(),
            state: self.state,
            priority: self.priority,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            timeout_ms: self.timeout.as_millis() as u64,
            attempts: self.attempts,
            result: self.result.clone(),
            artifacts: self.artifacts.clone(),
            error: self.error.clone(),
        }
    }
}

struct TaskSlot {
    record: Mutex<TaskRecord>,
    cancel: CancellationToken,
    updates: watch::Sender<TaskSnapshot>,
    handler: Arc<dyn TaskHandler>,
    input: TaskInput,
}

impl TaskSlot {
    fn lock(&self) -> MutexGuard<'_, TaskRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// How the run loop left the handler.
enum Exit {
    Finished(Result<(Value, Vec<ArtifactRef>)>, u32),
    TimedOut,
    CancelRequested,
}

/// Aborts the spawned handler when the attempt future is dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct TaskManager {
    tasks: RwLock<HashMap<String, Arc<TaskSlot>>>,
    handlers: Arc<HandlerRegistry>,
    workers: Arc<Semaphore>,
    retry: RetryPolicy,
    default_timeout: Duration,
    cancel_grace: Duration,
    artifacts: Arc<ArtifactStore>,
    ledger: Option<Arc<Ledger>>,
    shutting_down: AtomicBool,
}

impl TaskManager {
    pub fn new(
        settings: &TaskSettings,
        retry: RetryPolicy,
        handlers: Arc<HandlerRegistry>,
        artifacts: Arc<ArtifactStore>,
        ledger: Option<Arc<Ledger>>,
    ) -> Arc<Self> {
        tracing::debug!(
            workers = settings.worker_pool_size,
            default_timeout_ms = settings.default_timeout_ms,
            "Task manager ready"
        );
        Arc::new(Self {
            tasks: RwLock::new(HashMap::new()),
            handlers,
            workers: Arc::new(Semaphore::new(settings.worker_pool_size.max(1))),
            retry,
            default_timeout: settings.default_timeout(),
            cancel_grace: settings.cancel_grace(),
            artifacts,
            ledger,
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    fn slot(&self, task_id: &str) -> Result<Arc<TaskSlot>> {
        self.tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))
    }

    /// Register a task and hand it to the worker pool. Returns immediately.
    pub fn create_task(self: &Arc<Self>, spec: TaskSpec) -> Result<String> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::validation("task manager is shutting down"));
        }
        if spec.task_type.is_empty() {
            return Err(Error::validation("task_type is empty"));
        }
        let handler = self.handlers.get(&spec.task_type).ok_or_else(|| {
            Error::validation(format!("no handler registered for task type '{}'", spec.task_type))
        })?;
        let timeout = spec.timeout.unwrap_or(self.default_timeout);
        if timeout.is_zero() {
            return Err(Error::validation("task timeout must be non-zero"));
        }

        let record = TaskRecord {
            id: generate_id(),
            task_type: spec.task_type,
            description: spec.description,
            agent_id: spec.agent_id,
            state: TaskState::Created,
            priority: spec.priority,
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
            timeout,
            attempts: 0,
            result: None,
            artifacts: Vec::new(),
            error: None,
            cancel_requested: false,
        };
        let id = record.id.clone();
        let snapshot = record.snapshot();
        let (updates, _) = watch::channel(snapshot.clone());

        let slot = Arc::new(TaskSlot {
            record: Mutex::new(record),
            cancel: CancellationToken::new(),
            updates,
            handler,
            input: TaskInput {
                payload: spec.input,
                message: spec.message,
            },
        });

        {
            // Hold the record lock so the first transition cannot overtake the
            // creation checkpoint.
            let _rec = slot.lock();
            self.tasks
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(id.clone(), slot.clone());
            self.write_checkpoint(&snapshot, None);
        }

        tracing::info!(
            task_id = %id,
            task_type = %snapshot.task_type,
            timeout_ms = snapshot.timeout_ms,
            "Task created"
        );

        tokio::spawn(self.clone().run(slot));
        Ok(id)
    }

    pub fn get_status(&self, task_id: &str) -> Result<TaskSnapshot> {
        Ok(self.slot(task_id)?.lock().snapshot())
    }

    /// Request cancellation.
    ///
    /// A CREATED task is cancelled on the spot. A RUNNING task gets the
    /// cooperative signal and settles as CANCELLED once the handler returns.
    /// A handler still running when the grace period ends is aborted and the
    /// task settles as TIMEOUT.
    pub fn cancel(&self, task_id: &str) -> Result<()> {
        let slot = self.slot(task_id)?;
        {
            let mut rec = slot.lock();
            match rec.state {
                state if state.is_terminal() => {
                    return Err(Error::AlreadyTerminal {
                        task_id: task_id.to_string(),
                        state: state.to_string(),
                    });
                }
                TaskState::Created => {
                    rec.cancel_requested = true;
                    rec.error = Some(cancelled_error(0));
                    self.commit(&slot, &mut rec, TaskState::Cancelled);
                }
                _ => {
                    if rec.cancel_requested {
                        tracing::debug!(task_id, "Cancellation already requested");
                    } else {
                        rec.cancel_requested = true;
                        tracing::info!(task_id, "Cancellation requested for running task");
                    }
                }
            }
        }
        slot.cancel.cancel();
        Ok(())
    }

    /// Wait until the task is terminal, or until `timeout` elapses.
    pub async fn await_completion(
        &self,
        task_id: &str,
        timeout: Option<Duration>,
    ) -> Result<TaskSnapshot> {
        let mut updates = self.slot(task_id)?.updates.subscribe();
        let wait = async move {
            loop {
                {
                    let current = updates.borrow_and_update();
                    if current.is_terminal() {
                        return current.clone();
                    }
                }
                if updates.changed().await.is_err() {
                    return updates.borrow().clone();
                }
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| Error::Timeout(format!("task {} not finished after {:?}", task_id, limit))),
            None => Ok(wait.await),
        }
    }

    /// Receiver for every published snapshot of one task.
    pub fn subscribe(&self, task_id: &str) -> Result<watch::Receiver<TaskSnapshot>> {
        Ok(self.slot(task_id)?.updates.subscribe())
    }

    /// All tasks, oldest first, optionally restricted to one state.
    pub fn list_tasks(&self, state: Option<TaskState>) -> Vec<TaskSnapshot> {
        let slots: Vec<Arc<TaskSlot>> = self
            .tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<TaskSnapshot> = slots
            .iter()
            .map(|s| s.lock().snapshot())
            .filter(|s| state.map_or(true, |wanted| s.state == wanted))
            .collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        snapshots
    }

    /// Drop terminal tasks that finished more than `retain` ago. Their
    /// checkpoints stay in the ledger.
    pub fn evict_finished(&self, retain: Duration) -> usize {
        let cutoff = now_ms() - retain.as_millis() as i64;
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        let before = tasks.len();
        tasks.retain(|_, slot| {
            let rec = slot.lock();
            !(rec.state.is_terminal() && rec.completed_at.map_or(false, |at| at <= cutoff))
        });
        let evicted = before - tasks.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = tasks.len(), "Evicted finished tasks");
        }
        evicted
    }

    /// Stop accepting tasks, cancel everything in flight and wait for it to
    /// settle. Returns how many tasks were cancelled.
    pub async fn shutdown(&self) -> usize {
        self.shutting_down.store(true, Ordering::Release);
        let pending: Vec<String> = self
            .list_tasks(None)
            .into_iter()
            .filter(|s| !s.is_terminal())
            .map(|s| s.id)
            .collect();

        let mut cancelled = 0;
        for id in &pending {
            if self.cancel(id).is_ok() {
                cancelled += 1;
            }
        }

        let settle = self.cancel_grace + Duration::from_millis(250);
        for id in &pending {
            if let Err(e) = self.await_completion(id, Some(settle)).await {
                tracing::warn!(task_id = %id, "Task did not settle during shutdown: {}", e);
            }
        }

        tracing::info!(cancelled, "Task manager shut down");
        cancelled
    }

    /// Apply one state transition. Caller holds the record lock.
    ///
    /// Returns false, and changes nothing, when the edge is not allowed.
    fn commit(&self, slot: &TaskSlot, rec: &mut TaskRecord, next: TaskState) -> bool {
        let from = rec.state;
        if !from.can_transition_to(next) {
            tracing::info!(
                task_id = %rec.id,
                from = %from,
                to = %next,
                "Transition lost the race, ignored"
            );
            return false;
        }

        rec.state = next;
        if next.is_terminal() {
            rec.completed_at = Some(now_ms());
        }
        let snapshot = rec.snapshot();
        self.write_checkpoint(&snapshot, Some(from));
        slot.updates.send_replace(snapshot);

        match next {
            TaskState::Failed | TaskState::Timeout => tracing::warn!(
                task_id = %rec.id,
                from = %from,
                to = %next,
                error = ?rec.error.as_ref().map(|e| &e.message),
                "Task transition"
            ),
            _ => tracing::info!(task_id = %rec.id, from = %from, to = %next, "Task transition"),
        }
        true
    }

    fn write_checkpoint(&self, snapshot: &TaskSnapshot, from: Option<TaskState>) {
        let Some(ledger) = &self.ledger else {
            return;
        };
        let state = match serde_json::to_value(snapshot) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(task_id = %snapshot.id, "Could not encode task snapshot: {}", e);
                return;
            }
        };
        let context = json!({ "from": from, "to": snapshot.state });
        let metadata = json!({
            "attempts": snapshot.attempts,
            "error_kind": snapshot.error.as_ref().map(|e| e.kind.clone()),
        });
        let recovery_point = snapshot.state.as_str().to_ascii_lowercase();
        if let Err(e) =
            ledger.create_checkpoint(&snapshot.id, state, context, &recovery_point, metadata)
        {
            tracing::error!(
                task_id = %snapshot.id,
                recovery_point = %recovery_point,
                "Checkpoint write failed: {}",
                e
            );
        }
    }

    fn record_attempt_failure(&self, task_id: &str, attempt: u32, err: &Error, retry_in: Option<Duration>) {
        match retry_in {
            Some(delay) => tracing::warn!(
                task_id,
                attempt,
                kind = err.kind(),
                retry_in_ms = delay.as_millis() as u64,
                "Handler attempt failed, retrying: {}",
                err
            ),
            None => tracing::warn!(
                task_id,
                attempt,
                kind = err.kind(),
                "Handler attempt failed, giving up: {}",
                err
            ),
        }

        if let Some(ledger) = &self.ledger {
            let result = ledger.create_checkpoint(
                task_id,
                json!({ "error": err.to_string() }),
                json!({ "kind": err.kind(), "retryable": err.is_retryable() }),
                "attempt_failed",
                json!({
                    "attempt": attempt,
                    "retry_in_ms": retry_in.map(|d| d.as_millis() as u64),
                }),
            );
            if let Err(e) = result {
                tracing::error!(task_id, attempt, "Attempt checkpoint failed: {}", e);
            }
        }
    }

    async fn run(self: Arc<Self>, slot: Arc<TaskSlot>) {
        let _permit = tokio::select! {
            permit = self.workers.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::error!("Worker pool closed");
                    return;
                }
            },
            _ = slot.cancel.cancelled() => return,
        };

        let (task_id, timeout) = {
            let mut rec = slot.lock();
            rec.started_at = Some(now_ms());
            if !self.commit(&slot, &mut rec, TaskState::Running) {
                return;
            }
            (rec.id.clone(), rec.timeout)
        };
        let deadline = Instant::now() + timeout;

        let exec = self.execute(&slot, &task_id);
        tokio::pin!(exec);

        let exit = tokio::select! {
            biased;
            (result, attempts) = &mut exec => Exit::Finished(result, attempts),
            _ = tokio::time::sleep_until(deadline) => Exit::TimedOut,
            _ = slot.cancel.cancelled() => Exit::CancelRequested,
        };

        match exit {
            Exit::Finished(result, attempts) => self.settle(&slot, result, attempts),
            Exit::TimedOut => {
                slot.cancel.cancel();
                let mut rec = slot.lock();
                if rec.cancel_requested {
                    rec.error = Some(cancelled_error(rec.attempts));
                    self.commit(&slot, &mut rec, TaskState::Cancelled);
                } else {
                    let err = Error::Timeout(format!("task {} exceeded {:?}", task_id, timeout));
                    rec.error = Some(TaskError::from_error(&err, rec.attempts));
                    self.commit(&slot, &mut rec, TaskState::Timeout);
                }
            }
            Exit::CancelRequested => {
                let grace_end = (Instant::now() + self.cancel_grace).min(deadline);
                let acknowledged = match tokio::time::timeout_at(grace_end, &mut exec).await {
                    Ok((result, _)) => {
                        tracing::debug!(
                            task_id = %task_id,
                            ok = result.is_ok(),
                            "Handler returned after cancellation"
                        );
                        true
                    }
                    Err(_) => {
                        tracing::warn!(
                            task_id = %task_id,
                            "Handler ignored cancellation, force-terminating it"
                        );
                        false
                    }
                };
                // Dropping `exec` on return aborts the spawned handler.
                let mut rec = slot.lock();
                if acknowledged {
                    rec.error = Some(cancelled_error(rec.attempts));
                    self.commit(&slot, &mut rec, TaskState::Cancelled);
                } else {
                    let err = Error::Timeout(format!(
                        "task {} ignored cancellation for {:?}",
                        task_id, self.cancel_grace
                    ));
                    rec.error = Some(TaskError::from_error(&err, rec.attempts));
                    self.commit(&slot, &mut rec, TaskState::Timeout);
                }
            }
        }
    }

    /// All handler attempts plus artifact storage for one task.
    async fn execute(
        &self,
        slot: &TaskSlot,
        task_id: &str,
    ) -> (Result<(Value, Vec<ArtifactRef>)>, u32) {
        let (agent_id, task_type) = {
            let rec = slot.lock();
            (rec.agent_id.clone(), rec.task_type.clone())
        };

        let outcome = self
            .retry
            .run(
                Some(&slot.cancel),
                |attempt| {
                    slot.lock().attempts = attempt;
                    let ctx = TaskContext::new(
                        task_id.to_string(),
                        agent_id.clone(),
                        attempt,
                        slot.cancel.clone(),
                        self.ledger.clone(),
                    );
                    let handler = slot.handler.clone();
                    let input = slot.input.clone();
                    async move {
                        let mut call = AbortOnDrop(tokio::spawn(async move {
                            handler.handle(input, ctx).await
                        }));
                        match (&mut call.0).await {
                            Ok(result) => result.map_err(Error::from),
                            Err(e) if e.is_panic() => Err(Error::TaskExecution {
                                message: "handler panicked".to_string(),
                                retryable: false,
                            }),
                            Err(_) => Err(Error::TaskExecution {
                                message: "handler aborted".to_string(),
                                retryable: false,
                            }),
                        }
                    }
                },
                |attempt, err, retry_in| self.record_attempt_failure(task_id, attempt, err, retry_in),
            )
            .await;

        let output = match outcome.result {
            Ok(output) => output,
            Err(e) => return (Err(e), outcome.attempts),
        };

        let owner = agent_id.unwrap_or(task_type);
        let mut refs = Vec::with_capacity(output.artifacts.len());
        for mut draft in output.artifacts {
            draft.task_id = task_id.to_string();
            if draft.agent_id.is_empty() {
                draft.agent_id = owner.clone();
            }
            match self.artifacts.store(draft).await {
                Ok(r) => refs.push(r),
                Err(e) => return (Err(e), outcome.attempts),
            }
        }
        (Ok((output.result, refs)), outcome.attempts)
    }

    /// Record the handler's outcome unless something else already settled
    /// the task.
    fn settle(&self, slot: &TaskSlot, result: Result<(Value, Vec<ArtifactRef>)>, attempts: u32) {
        let mut rec = slot.lock();
        rec.attempts = attempts;

        if rec.state.is_terminal() {
            tracing::info!(
                task_id = %rec.id,
                state = %rec.state,
                ok = result.is_ok(),
                "Late handler result ignored"
            );
            return;
        }
        if rec.cancel_requested {
            tracing::info!(
                task_id = %rec.id,
                ok = result.is_ok(),
                "Handler finished after cancellation request, recorded as cancelled"
            );
            rec.error = Some(cancelled_error(attempts));
            self.commit(slot, &mut rec, TaskState::Cancelled);
            return;
        }

        match result {
            Ok((value, artifacts)) => {
                rec.result = Some(value);
                rec.artifacts = artifacts;
                self.commit(slot, &mut rec, TaskState::Completed);
            }
            Err(e) => {
                rec.error = Some(TaskError::from_error(&e, attempts));
                self.commit(slot, &mut rec, TaskState::Failed);
            }
        }
    }
}

fn cancelled_error(attempts: u32) -> TaskError {
    TaskError {
        kind: "cancelled".to_string(),
        message: "cancelled by request".to_string(),
        retryable: false,
        attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactDraft, Requester};
    use crate::task::handler::{handler_fn, HandlerError, TaskOutput};
    use std::sync::atomic::AtomicU32;

    fn settings(workers: usize) -> TaskSettings {
        TaskSettings {
            worker_pool_size: workers,
            default_timeout_ms: 5_000,
            cancel_grace_ms: 100,
            ..TaskSettings::default()
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_ratio: 0.0,
        }
    }

    fn manager(handlers: HandlerRegistry) -> (Arc<TaskManager>, Arc<Ledger>, Arc<ArtifactStore>) {
        crate::logging::init_test();
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let artifacts = Arc::new(ArtifactStore::in_memory());
        let tm = TaskManager::new(
            &settings(4),
            fast_retry(),
            Arc::new(handlers),
            artifacts.clone(),
            Some(ledger.clone()),
        );
        (tm, ledger, artifacts)
    }

    fn recovery_points(ledger: &Ledger, task_id: &str) -> Vec<String> {
        ledger
            .list_checkpoints(Some(task_id))
            .unwrap()
            .into_iter()
            .map(|c| c.recovery_point)
            .collect()
    }

    #[tokio::test]
    async fn test_completes_with_artifacts() {
        let handlers = HandlerRegistry::new();
        handlers.register(
            "summarize",
            handler_fn(|input: TaskInput, _ctx| async move {
                Ok(TaskOutput::new(json!({"ok": true}))
                    .with_artifact(ArtifactDraft::output("summary", input.payload.to_string())))
            }),
        );
        let (tm, ledger, artifacts) = manager(handlers);

        let id = tm
            .create_task(TaskSpec::new("summarize", json!({"region": "north"})))
            .unwrap();
        let done = tm.await_completion(&id, Some(Duration::from_secs(2))).await.unwrap();

        assert_eq!(done.state, TaskState::Completed);
        assert_eq!(done.attempts, 1);
        assert!(done.started_at.is_some() && done.completed_at.is_some());
        assert_eq!(done.artifacts.len(), 1);
        assert_eq!(done.artifacts[0].task_id, id);
        assert_eq!(done.artifacts[0].agent_id, "summarize");

        let stored = artifacts
            .get(&done.artifacts[0].id, &Requester::default())
            .await
            .unwrap();
        assert_eq!(stored.content, br#"{"region":"north"}"#);
        assert_eq!(recovery_points(&ledger, &id), vec!["created", "running", "completed"]);
    }

    #[tokio::test]
    async fn test_unknown_task_type_rejected() {
        let (tm, _, _) = manager(HandlerRegistry::new());
        let err = tm.create_task(TaskSpec::new("nope", Value::Null)).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn test_timeout_abandons_handler() {
        let handlers = HandlerRegistry::new();
        handlers.register(
            "slow",
            handler_fn(|_input, _ctx| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(TaskOutput::default())
            }),
        );
        let (tm, ledger, _) = manager(handlers);

        let started = std::time::Instant::now();
        let id = tm
            .create_task(TaskSpec::new("slow", Value::Null).with_timeout(Duration::from_millis(100)))
            .unwrap();
        let done = tm.await_completion(&id, Some(Duration::from_secs(2))).await.unwrap();

        assert_eq!(done.state, TaskState::Timeout);
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(done.error.as_ref().unwrap().kind, "timeout");
        assert!(ledger.count(Some(id.as_str())).unwrap() >= 2);
    }

    #[tokio::test]
    async fn test_retryable_failures_are_retried_and_checkpointed() {
        let calls = Arc::new(AtomicU32::new(0));
        let handlers = HandlerRegistry::new();
        let counter = calls.clone();
        handlers.register(
            "flaky",
            handler_fn(move |_input, ctx: TaskContext| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if ctx.attempt < 3 {
                        Err(HandlerError::retryable("upstream busy"))
                    } else {
                        Ok(TaskOutput::new(json!(ctx.attempt)))
                    }
                }
            }),
        );
        let (tm, ledger, _) = manager(handlers);

        let id = tm.create_task(TaskSpec::new("flaky", Value::Null)).unwrap();
        let done = tm.await_completion(&id, Some(Duration::from_secs(2))).await.unwrap();

        assert_eq!(done.state, TaskState::Completed);
        assert_eq!(done.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let points = recovery_points(&ledger, &id);
        assert_eq!(points.iter().filter(|p| *p == "attempt_failed").count(), 2);
    }

    #[tokio::test]
    async fn test_terminal_failure_not_retried() {
        let handlers = HandlerRegistry::new();
        handlers.register(
            "broken",
            handler_fn(|_input, _ctx| async { Err(HandlerError::terminal("bad region code")) }),
        );
        let (tm, _, _) = manager(handlers);

        let id = tm.create_task(TaskSpec::new("broken", Value::Null)).unwrap();
        let done = tm.await_completion(&id, Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(done.state, TaskState::Failed);
        let error = done.error.unwrap();
        assert_eq!((error.kind.as_str(), error.attempts), ("task_execution", 1));
        assert!(error.message.contains("bad region code"));
        assert!(done.result.is_none());
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_task() {
        let handlers = HandlerRegistry::new();
        handlers.register(
            "panics",
            handler_fn(|_input, _ctx| async {
                if true {
                    panic!("boom");
                }
                Ok(TaskOutput::default())
            }),
        );
        let (tm, _, _) = manager(handlers);
        let id = tm.create_task(TaskSpec::new("panics", Value::Null)).unwrap();
        let done = tm.await_completion(&id, Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(done.state, TaskState::Failed);
    }

    #[tokio::test]
    async fn test_cooperative_cancel() {
        let handlers = HandlerRegistry::new();
        handlers.register(
            "watcher",
            handler_fn(|_input, ctx: TaskContext| async move {
                ctx.cancelled().await;
                Err(HandlerError::terminal("stopped"))
            }),
        );
        let (tm, _, _) = manager(handlers);

        let id = tm.create_task(TaskSpec::new("watcher", Value::Null)).unwrap();
        let mut updates = tm.subscribe(&id).unwrap();
        while updates.borrow_and_update().state != TaskState::Running {
            updates.changed().await.unwrap();
        }

        tm.cancel(&id).unwrap();
        let done = tm.await_completion(&id, Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(done.state, TaskState::Cancelled);
        assert!(matches!(tm.cancel(&id), Err(Error::AlreadyTerminal { .. })));
    }

    #[tokio::test]
    async fn test_uncooperative_handler_terminated_after_grace() {
        let handlers = HandlerRegistry::new();
        handlers.register(
            "stubborn",
            handler_fn(|_input, _ctx| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(TaskOutput::default())
            }),
        );
        let (tm, _, _) = manager(handlers);

        let id = tm.create_task(TaskSpec::new("stubborn", Value::Null)).unwrap();
        let mut updates = tm.subscribe(&id).unwrap();
        while updates.borrow_and_update().state != TaskState::Running {
            updates.changed().await.unwrap();
        }
        let asked = std::time::Instant::now();
        tm.cancel(&id).unwrap();
        let done = tm.await_completion(&id, Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(done.state, TaskState::Timeout);
        assert_eq!(done.error.unwrap().kind, "timeout");
        assert!(asked.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_cancel_while_queued() {
        let handlers = HandlerRegistry::new();
        handlers.register(
            "hold",
            handler_fn(|_input, ctx: TaskContext| async move {
                ctx.cancelled().await;
                Ok(TaskOutput::default())
            }),
        );
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let tm = TaskManager::new(
            &settings(1),
            fast_retry(),
            Arc::new(handlers),
            Arc::new(ArtifactStore::in_memory()),
            Some(ledger.clone()),
        );

        let first = tm.create_task(TaskSpec::new("hold", Value::Null)).unwrap();
        let queued = tm.create_task(TaskSpec::new("hold", Value::Null)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tm.get_status(&queued).unwrap().state, TaskState::Created);

        tm.cancel(&queued).unwrap();
        let snap = tm.get_status(&queued).unwrap();
        assert_eq!(snap.state, TaskState::Cancelled);
        assert!(snap.started_at.is_none());
        assert_eq!(recovery_points(&ledger, &queued), vec!["created", "cancelled"]);

        tm.cancel(&first).unwrap();
        tm.await_completion(&first, Some(Duration::from_secs(2))).await.unwrap();
    }

    #[tokio::test]
    async fn test_await_completion_times_out() {
        let handlers = HandlerRegistry::new();
        handlers.register(
            "hold",
            handler_fn(|_input, ctx: TaskContext| async move {
                ctx.cancelled().await;
                Ok(TaskOutput::default())
            }),
        );
        let (tm, _, _) = manager(handlers);
        let id = tm.create_task(TaskSpec::new("hold", Value::Null)).unwrap();
        let err = tm
            .await_completion(&id, Some(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(matches!(tm.get_status("missing"), Err(Error::NotFound(_))));

        assert_eq!(tm.shutdown().await, 1);
        assert_eq!(tm.get_status(&id).unwrap().state, TaskState::Cancelled);
        assert!(tm.create_task(TaskSpec::new("hold", Value::Null)).is_err());
    }

    #[tokio::test]
    async fn test_list_tasks_by_state() {
        let handlers = HandlerRegistry::new();
        handlers.register("noop", handler_fn(|_input, _ctx| async { Ok(TaskOutput::default()) }));
        let (tm, _, _) = manager(handlers);

        let a = tm.create_task(TaskSpec::new("noop", Value::Null)).unwrap();
        let b = tm.create_task(TaskSpec::new("noop", Value::Null)).unwrap();
        tm.await_completion(&a, Some(Duration::from_secs(2))).await.unwrap();
        tm.await_completion(&b, Some(Duration::from_secs(2))).await.unwrap();

        assert_eq!(tm.list_tasks(None).len(), 2);
        assert_eq!(tm.list_tasks(Some(TaskState::Completed)).len(), 2);
        assert!(tm.list_tasks(Some(TaskState::Running)).is_empty());
    }

    #[tokio::test]
    async fn test_evict_finished_keeps_live_tasks() {
        let handlers = HandlerRegistry::new();
        handlers.register("noop", handler_fn(|_input, _ctx| async { Ok(TaskOutput::default()) }));
        handlers.register(
            "slow",
            handler_fn(|_input, _ctx| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(TaskOutput::default())
            }),
        );
        let (tm, ledger, _) = manager(handlers);

        let done = tm.create_task(TaskSpec::new("noop", Value::Null)).unwrap();
        tm.await_completion(&done, Some(Duration::from_secs(2))).await.unwrap();
        let live = tm.create_task(TaskSpec::new("slow", Value::Null)).unwrap();

        assert_eq!(tm.evict_finished(Duration::from_secs(60)), 0);
        assert_eq!(tm.evict_finished(Duration::ZERO), 1);
        assert!(matches!(tm.get_status(&done), Err(Error::NotFound(_))));
        assert!(!tm.get_status(&live).unwrap().is_terminal());
        assert!(!recovery_points(&ledger, &done).is_empty());
        tm.cancel(&live).unwrap();
    }
}
