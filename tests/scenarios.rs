//! End-to-end behaviour of an assembled mesh.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use agentmesh::artifact::{ArtifactDraft, Requester};
use agentmesh::protocol::Message;
use agentmesh::reliability::BreakerState;
use agentmesh::task::{handler_fn, HandlerError, TaskContext};
use agentmesh::{
    Endpoint, Error, Mesh, MessageBuilder, RoutingError, Settings, TaskOutput, TaskSpec,
    TaskState,
};
use axum::{http::StatusCode, routing::post, Json, Router};
use serde_json::{json, Value};

fn mesh() -> Arc<Mesh> {
    Mesh::in_memory(Settings::default()).unwrap()
}

/// Task states recorded in the ledger for `task_id`, oldest first.
fn recorded_states(mesh: &Mesh, task_id: &str) -> Vec<TaskState> {
    mesh.list_checkpoints(Some(task_id))
        .unwrap()
        .iter()
        .filter_map(|cp| cp.recovery_point.parse::<TaskState>().ok())
        .collect()
}

fn assert_valid_path(states: &[TaskState]) {
    assert_eq!(states.first(), Some(&TaskState::Created), "{:?}", states);
    for pair in states.windows(2) {
        assert!(
            pair[0].can_transition_to(pair[1]),
            "illegal transition {} -> {} in {:?}",
            pair[0],
            pair[1],
            states
        );
    }
    let terminal = states.iter().filter(|s| s.is_terminal()).count();
    assert_eq!(terminal, 1, "expected one terminal state in {:?}", states);
}

/// Spawn a throwaway HTTP agent and return its inbox URL.
async fn spawn_agent(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}/inbox", addr)
}

#[tokio::test]
async fn test_slow_handler_times_out() {
    let mesh = mesh();
    mesh.register_handler(
        "slow",
        handler_fn(|_input, _ctx| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(TaskOutput::default())
        }),
    );

    let started = Instant::now();
    let id = mesh
        .submit(TaskSpec::new("slow", Value::Null).with_timeout(Duration::from_millis(100)))
        .unwrap();
    let done = mesh.await_completion(&id, Some(Duration::from_secs(2))).await.unwrap();

    assert_eq!(done.state, TaskState::Timeout);
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(done.error.as_ref().unwrap().kind, "timeout");
    assert!(done.result.is_none());

    let checkpoints = mesh.list_checkpoints(Some(id.as_str())).unwrap();
    assert!(checkpoints.len() >= 2);
    let points: Vec<&str> = checkpoints.iter().map(|c| c.recovery_point.as_str()).collect();
    assert_eq!(points.first(), Some(&"created"));
    assert_eq!(points.last(), Some(&"timeout"));
}

#[tokio::test]
async fn test_route_to_unknown_agent() {
    let mesh = mesh();
    let message = MessageBuilder::from("planner").to("agent_x").text("hello").build().unwrap();
    let err = mesh.send(&message).await.unwrap_err();
    assert!(
        matches!(&err, Error::Routing(RoutingError::NoSuchAgent(id)) if id == "agent_x"),
        "{:?}",
        err
    );
}

#[tokio::test]
async fn test_broadcast_by_capability() {
    let mesh = mesh();
    for (id, caps) in [
        ("risk-1", vec!["risk_analysis"]),
        ("risk-2", vec!["risk_analysis", "weather"]),
        ("risk-3", vec!["risk_analysis"]),
        ("weather", vec!["weather"]),
        ("idle", vec![]),
    ] {
        mesh.register_agent(id, caps, Endpoint::mailbox()).unwrap();
    }

    let message = MessageBuilder::from("planner")
        .broadcast()
        .data(json!({"region": "north"}))
        .build()
        .unwrap();
    let report = mesh.broadcast(&message, Some("risk_analysis")).await.unwrap();

    let recipients: BTreeSet<&str> = report.receipts.iter().map(|r| r.recipient.as_str()).collect();
    assert_eq!(recipients, BTreeSet::from(["risk-1", "risk-2", "risk-3"]));
    assert!(report.receipts.iter().all(|r| r.is_delivered()));

    for id in ["risk-1", "risk-2", "risk-3"] {
        assert_eq!(mesh.receive(id, Duration::ZERO).await.unwrap(), Some(message.clone()));
    }
    for id in ["weather", "idle"] {
        assert!(mesh.receive(id, Duration::ZERO).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_artifact_versions_are_immutable() {
    let mesh = mesh();
    let store = mesh.artifacts();

    let v1 = store
        .store(ArtifactDraft::new("task-1", "risk", "report", b"draft".to_vec()))
        .await
        .unwrap();
    let v2 = store
        .store(ArtifactDraft::new("task-1", "risk", "report", b"final".to_vec()))
        .await
        .unwrap();
    assert_eq!(v1.id, v2.id);
    assert_eq!((v1.version, v2.version), (1, 2));

    let anyone = Requester::new("auditor", Vec::<String>::new());
    let latest = mesh.get_artifact(&v1.id, &anyone, None).await.unwrap();
    assert_eq!(latest.artifact.version, 2);
    assert_eq!(latest.content, b"final");

    let original = mesh.get_artifact(&v1.id, &anyone, Some(1)).await.unwrap();
    assert_eq!(original.content, b"draft");
    assert_eq!(original.artifact.version, 1);
}

#[tokio::test]
async fn test_artifact_permission_denied_without_capability() {
    let mesh = mesh();
    let stored = mesh
        .artifacts()
        .store(
            ArtifactDraft::new("task-9", "risk", "exposure", b"secret".to_vec())
                .with_permission("finance"),
        )
        .await
        .unwrap();

    let outsider = Requester::new("intern", ["weather"]);
    let err = mesh.get_artifact(&stored.id, &outsider, None).await.unwrap_err();
    assert!(matches!(err, Error::Permission(_)), "{:?}", err);

    let insider = Requester::new("cfo", ["finance"]);
    let found = mesh.get_artifact(&stored.id, &insider, None).await.unwrap();
    assert_eq!(found.content, b"secret");
}

#[tokio::test]
async fn test_handler_artifacts_reach_the_store() {
    let mesh = mesh();
    mesh.register_handler(
        "summarize",
        handler_fn(|input, _ctx| async move {
            let text = input.payload.as_str().unwrap_or_default().to_uppercase();
            Ok(TaskOutput::new(json!({"chars": text.len()}))
                .with_artifact(ArtifactDraft::output("summary", text.into_bytes())))
        }),
    );
    mesh.register_agent("summarizer", ["summaries"], Endpoint::task("summarize"))
        .unwrap();

    let message = MessageBuilder::from("planner").to("summarizer").text("quiet seas").build().unwrap();
    let report = mesh.send(&message).await.unwrap();
    let task_id = report.tasks[0].clone();

    let done = mesh.await_completion(&task_id, Some(Duration::from_secs(2))).await.unwrap();
    assert_eq!(done.state, TaskState::Completed);
    assert_eq!(done.agent_id.as_deref(), Some("summarizer"));
    assert_eq!(done.artifacts.len(), 1);

    let artifact = &done.artifacts[0];
    assert_eq!(artifact.task_id, task_id);
    assert_eq!(artifact.agent_id, "summarizer");
    let found = mesh
        .get_artifact(&artifact.id, &Requester::new("planner", Vec::<String>::new()), None)
        .await
        .unwrap();
    assert_eq!(found.content, b"QUIET SEAS");
}

#[tokio::test]
async fn test_open_breaker_fails_fast() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let url = spawn_agent(Router::new().route(
        "/inbox",
        post(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                StatusCode::SERVICE_UNAVAILABLE
            }
        }),
    ))
    .await;

    let mut settings = Settings::default();
    settings.retry.max_attempts = 1;
    settings.breaker.failure_threshold = 3;
    settings.breaker.reset_timeout_ms = 60_000;
    let mesh = Mesh::in_memory(settings).unwrap();
    mesh.register_agent("flaky", ["risk_analysis"], Endpoint::http(url)).unwrap();

    for _ in 0..3 {
        let message = MessageBuilder::from("planner").to("flaky").text("ping").build().unwrap();
        let err = mesh.send(&message).await.unwrap_err();
        assert!(err.is_retryable());
    }
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(mesh.router().breaker_state("flaky"), BreakerState::Open);

    let started = Instant::now();
    let message = MessageBuilder::from("planner").to("flaky").text("ping").build().unwrap();
    let err = mesh.send(&message).await.unwrap_err();
    assert_eq!(err.kind(), "agent_unavailable");
    assert_eq!(hits.load(Ordering::SeqCst), 3, "open breaker must not reach the agent");
    assert!(started.elapsed() < Duration::from_millis(200));
}

#[tokio::test]
async fn test_http_agent_receives_wire_message() {
    let received = Arc::new(std::sync::Mutex::new(Vec::<Message>::new()));
    let sink = received.clone();
    let url = spawn_agent(Router::new().route(
        "/inbox",
        post(move |Json(message): Json<Message>| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(message);
                Json(json!({"tasks": ["remote-task-1"]}))
            }
        }),
    ))
    .await;

    let mesh = mesh();
    mesh.register_agent("remote", ["weather"], Endpoint::http(url)).unwrap();
    let message = MessageBuilder::from("planner")
        .to("remote")
        .correlation_id("chain-7")
        .data(json!({"region": "south"}))
        .build()
        .unwrap();

    let report = mesh.send(&message).await.unwrap();
    assert_eq!(report.tasks, vec!["remote-task-1".to_string()]);
    assert_eq!(report.receipts[0].attempts, 1);
    assert_eq!(received.lock().unwrap().as_slice(), &[message]);
}

#[tokio::test]
async fn test_cancel_and_completion_race_records_one_terminal_state() {
    let mesh = mesh();
    mesh.register_handler(
        "quick",
        handler_fn(|input, ctx: TaskContext| async move {
            let delay = input.payload.as_u64().unwrap_or(0);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {
                    Ok(TaskOutput::new(json!({"slept": delay})))
                }
                _ = ctx.cancelled() => Err(HandlerError::terminal("cancelled")),
            }
        }),
    );

    let mut ids = Vec::new();
    for i in 0..30u64 {
        let id = mesh.submit(TaskSpec::new("quick", json!(i % 4))).unwrap();
        let racer = mesh.clone();
        let target = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(i % 3)).await;
            // Losing the race to completion is fine.
            let _ = racer.cancel(&target);
        });
        ids.push(id);
    }

    for id in &ids {
        let done = mesh.await_completion(id, Some(Duration::from_secs(5))).await.unwrap();
        assert!(
            matches!(done.state, TaskState::Completed | TaskState::Cancelled),
            "{:?}",
            done.state
        );
        if done.state == TaskState::Cancelled {
            assert!(done.result.is_none());
        }

        let states = recorded_states(&mesh, id);
        assert_valid_path(&states);
        assert_eq!(states.last(), Some(&done.state));
        // A late transition attempt must not have changed anything.
        assert_eq!(mesh.status(id).unwrap().state, done.state);
    }
}

#[tokio::test]
async fn test_retries_are_checkpointed_then_fail() {
    let mut settings = Settings::default();
    settings.retry.base_delay_ms = 5;
    settings.retry.max_delay_ms = 10;
    let mesh = Mesh::in_memory(settings).unwrap();
    mesh.register_handler(
        "flaky",
        handler_fn(|_input, _ctx| async { Err(HandlerError::retryable("upstream busy")) }),
    );

    let id = mesh.submit(TaskSpec::new("flaky", Value::Null)).unwrap();
    let done = mesh.await_completion(&id, Some(Duration::from_secs(2))).await.unwrap();
    assert_eq!(done.state, TaskState::Failed);
    let error = done.error.unwrap();
    assert_eq!(error.attempts, 3);
    assert!(error.retryable);
    assert_eq!(error.kind, "task_execution");

    let points: Vec<String> = mesh
        .list_checkpoints(Some(id.as_str()))
        .unwrap()
        .into_iter()
        .map(|c| c.recovery_point)
        .collect();
    assert_eq!(
        points,
        vec!["created", "running", "attempt_failed", "attempt_failed", "failed"]
    );
    assert_valid_path(&recorded_states(&mesh, &id));
}

#[tokio::test]
async fn test_restore_checkpoint_snapshot() {
    let mesh = mesh();
    mesh.register_handler(
        "echo",
        handler_fn(|input, _ctx| async move { Ok(TaskOutput::new(input.payload)) }),
    );
    let id = mesh.submit(TaskSpec::new("echo", json!({"x": 1}))).unwrap();
    mesh.await_completion(&id, Some(Duration::from_secs(2))).await.unwrap();

    let refs = mesh.list_checkpoints(Some(id.as_str())).unwrap();
    let sequences: Vec<u64> = refs.iter().map(|c| c.sequence).collect();
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));

    let last = mesh.restore_checkpoint(&refs.last().unwrap().id).unwrap();
    assert_eq!(last.state_snapshot["state"], "COMPLETED");
    assert_eq!(last.state_snapshot["result"], json!({"x": 1}));
    assert_eq!(last.context["from"], "RUNNING");

    let err = mesh.restore_checkpoint("missing").unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}
