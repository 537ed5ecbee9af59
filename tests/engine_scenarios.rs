use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use trellis_core::config::{AppConfig, CheckpointBackend};
use trellis_core::error::{StructuralError, TrellisError};
use trellis_core::traits::CheckpointStore;
use trellis_core::types::{Edge, Node, Variables};
use trellis_core::{EngineEvent, ExecutionStatus};
use trellis_engine::{WorkflowEngine, MAX_ITERATIONS_MESSAGE};
use trellis_test_utils::{
    BlockingAgent, CountingCheckpointStore, MockTool, ScriptedAgent, SlowTool,
};

fn engine_with(store: Arc<CountingCheckpointStore>, config: AppConfig) -> WorkflowEngine {
    WorkflowEngine::builder(config)
        .checkpoint_store(store)
        .build()
}

fn vars(value: serde_json::Value) -> Variables {
    value.as_object().cloned().unwrap_or_default()
}

fn single_agent_graph(
    engine: &WorkflowEngine,
    agent_id: &str,
    max_iterations: u64,
) -> String {
    engine
        .create_graph(
            "single agent",
            "",
            vec![
                Node::start("s"),
                Node::agent("a", agent_id, "Summarize the report")
                    .with_config("max_iterations", json!(max_iterations)),
                Node::end("e"),
            ],
            vec![Edge::new("s", "a"), Edge::new("a", "e")],
        )
        .unwrap()
        .id
}

#[tokio::test]
async fn test_graph_round_trip() {
    let engine = WorkflowEngine::new();
    let created = engine
        .create_graph(
            "review",
            "tool then end",
            vec![
                Node::start("s"),
                Node::tool("t", "echo", json!({"doc": "draft"})).with_name("Echo draft"),
                Node::end("e"),
            ],
            vec![Edge::new("s", "t"), Edge::new("t", "e").with_label("done")],
        )
        .unwrap();

    let fetched = engine.get_graph(&created.id).unwrap();
    assert_eq!(fetched, created);
    assert_eq!(fetched.node("t").unwrap().name, "Echo draft");
    assert_eq!(fetched.edges[1].label.as_deref(), Some("done"));
}

#[tokio::test]
async fn test_graph_without_start_is_rejected() {
    let engine = WorkflowEngine::new();
    let err = engine
        .create_graph(
            "headless",
            "",
            vec![Node::tool("t", "echo", json!({})), Node::end("e")],
            vec![Edge::new("t", "e")],
        )
        .unwrap_err();
    assert!(matches!(
        err,
        TrellisError::Structural(StructuralError::MissingStart)
    ));
    assert!(engine.list_graphs().is_empty());
}

#[tokio::test]
async fn test_linear_agent_run_checkpoints_after_each_step() {
    let store = Arc::new(CountingCheckpointStore::new());
    let engine = engine_with(store.clone(), AppConfig::default());
    engine
        .register_capability(ScriptedAgent::never_finishing("writer"))
        .await;
    let graph_id = single_agent_graph(&engine, "writer", 1);

    let record = engine.execute_graph(&graph_id, Variables::new()).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert!(record.state.result("a").is_some());
    assert_eq!(record.state.iterations, 1);
    // START is not checkpointed: one save after the agent, one after END.
    assert_eq!(store.save_count(&record.id), 2);

    let history = store.history(&record.id);
    assert_eq!(history[0].pending, vec!["e".to_string()]);
    assert!(history[1].pending.is_empty());

    let times = store.save_times(&record.id);
    assert!(times[0] <= times[1]);
}

#[tokio::test]
async fn test_agent_stops_at_iteration_ceiling() {
    let engine = WorkflowEngine::new();
    let agent = ScriptedAgent::never_finishing("looper");
    let invocations = agent.invocations();
    engine.register_capability(agent).await;
    let graph_id = single_agent_graph(&engine, "looper", 3);

    let record = engine.execute_graph(&graph_id, Variables::new()).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    let result = record.state.result("a").unwrap();
    assert_eq!(result["iterations"], json!(3));
    assert_eq!(result["max_iterations_reached"], json!(true));
    assert_eq!(result["result"], json!(MAX_ITERATIONS_MESSAGE));
    // Three plan/execute rounds with a reflect between them.
    assert_eq!(invocations.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn test_run_agent_uses_builtin_topology() {
    let engine = WorkflowEngine::new();
    engine
        .register_capability(ScriptedAgent::finishing_with("solver", json!(42)))
        .await;

    let record = engine
        .run_agent("solver", "What is six times seven?", Variables::new())
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.state.result("agent").unwrap()["result"], json!(42));
    assert_eq!(record.state.iterations, 1);
}

#[tokio::test]
async fn test_parallel_branches_both_recorded() {
    let engine = WorkflowEngine::new();
    engine
        .register_capability(MockTool::returning("alpha", json!("A")))
        .await;
    engine
        .register_capability(MockTool::returning("beta", json!("B")))
        .await;
    let graph = engine
        .create_graph(
            "fan-out",
            "",
            vec![
                Node::start("s"),
                Node::parallel("p"),
                Node::tool("t1", "alpha", json!({})),
                Node::tool("t2", "beta", json!({})),
                Node::end("e"),
            ],
            vec![
                Edge::new("s", "p"),
                Edge::new("p", "t1"),
                Edge::new("p", "t2"),
                Edge::new("t1", "e"),
                Edge::new("t2", "e"),
            ],
        )
        .unwrap();

    let record = engine.execute_graph(&graph.id, Variables::new()).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.state.result("t1"), Some(&json!("A")));
    assert_eq!(record.state.result("t2"), Some(&json!("B")));
    assert_eq!(record.summary.get("e"), Some(&json!({"t1": "A", "t2": "B"})));
    // s, p, {t1, t2}, e
    assert_eq!(record.state.steps, 4);
}

#[tokio::test]
async fn test_cancel_mid_agent_writes_no_further_checkpoint() {
    let store = Arc::new(CountingCheckpointStore::new());
    let engine = engine_with(store.clone(), AppConfig::default());
    let agent = BlockingAgent::new("blocker");
    let entered = agent.entered();
    engine.register_capability(agent).await;
    let graph = engine
        .create_graph(
            "cancellable",
            "",
            vec![
                Node::start("s"),
                Node::tool("t", "echo", json!({"n": 1})),
                Node::agent("a", "blocker", "Wait forever"),
                Node::end("e"),
            ],
            vec![Edge::new("s", "t"), Edge::new("t", "a"), Edge::new("a", "e")],
        )
        .unwrap();

    let handle = engine
        .start_execution(&graph.id, Variables::new(), None)
        .unwrap();
    let execution_id = handle.execution_id().to_string();
    entered.notified().await;
    assert_eq!(store.save_count(&execution_id), 1);

    assert!(engine.cancel_execution(&execution_id));
    let record = handle.wait().await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Cancelled);
    assert!(record.completed_at.is_some());
    assert_eq!(store.save_count(&execution_id), 1);
    assert_eq!(
        store.load(&execution_id).unwrap().pending,
        vec!["a".to_string()]
    );
    assert_eq!(
        engine.get_execution(&execution_id).unwrap().status,
        ExecutionStatus::Cancelled
    );
    assert!(!engine.cancel_execution(&execution_id));
}

#[tokio::test]
async fn test_sqlite_checkpoints_are_isolated_per_execution() {
    let dir = trellis_test_utils::temp_dir();
    let mut config = AppConfig::default();
    config.checkpoint.backend = CheckpointBackend::Sqlite;
    config.checkpoint.path = dir.path().join("checkpoints.db").display().to_string();
    let engine = WorkflowEngine::from_config(config).unwrap();
    let graph = engine
        .create_graph(
            "echo",
            "",
            vec![
                Node::start("s"),
                Node::tool("t", "echo", json!({})).with_config("input_from", json!("topic")),
                Node::end("e"),
            ],
            vec![Edge::new("s", "t"), Edge::new("t", "e")],
        )
        .unwrap();

    let first = engine
        .execute_graph(&graph.id, vars(json!({"topic": "rust"})))
        .await
        .unwrap();
    let second = engine
        .execute_graph(&graph.id, vars(json!({"topic": "tokio"})))
        .await
        .unwrap();
    assert_ne!(first.id, second.id);

    let checkpoints = engine.checkpoints();
    let a = checkpoints.load(&first.id).unwrap();
    let b = checkpoints.load(&second.id).unwrap();
    assert_eq!(a.result("t"), Some(&json!("rust")));
    assert_eq!(b.result("t"), Some(&json!("tokio")));
    assert_eq!(a.execution_id, first.id);
    assert_eq!(b.graph_id, graph.id);

    let mut ids = checkpoints.list().unwrap();
    ids.sort();
    let mut expected = vec![first.id.clone(), second.id.clone()];
    expected.sort();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn test_condition_selects_branch() {
    let engine = WorkflowEngine::new();
    let graph = engine
        .create_graph(
            "triage",
            "",
            vec![
                Node::start("s"),
                Node::condition("c", "score > 5"),
                Node::tool("high", "echo", json!("high")),
                Node::tool("low", "echo", json!("low")),
                Node::end("e"),
            ],
            vec![
                Edge::new("s", "c"),
                Edge::new("c", "high").with_label("true"),
                Edge::new("c", "low").with_label("else"),
                Edge::new("high", "e"),
                Edge::new("low", "e"),
            ],
        )
        .unwrap();

    let record = engine
        .execute_graph(&graph.id, vars(json!({"score": 9})))
        .await
        .unwrap();
    assert_eq!(record.state.result("c"), Some(&json!(true)));
    assert!(record.state.result("high").is_some());
    assert!(record.state.result("low").is_none());

    let record = engine
        .execute_graph(&graph.id, vars(json!({"score": 2})))
        .await
        .unwrap();
    assert_eq!(record.state.result("c"), Some(&json!(false)));
    assert!(record.state.result("high").is_none());
    assert!(record.state.result("low").is_some());
}

#[tokio::test]
async fn test_conditional_edges_fall_back_to_end() {
    let engine = WorkflowEngine::new();
    let graph = engine
        .create_graph(
            "gated",
            "",
            vec![
                Node::start("s"),
                Node::tool("t", "echo", json!({})),
                Node::tool("never", "echo", json!({})),
                Node::end("e"),
            ],
            vec![
                Edge::new("s", "t"),
                Edge::conditional("t", "never", "ready == true"),
            ],
        )
        .unwrap();

    let record = engine
        .execute_graph(&graph.id, vars(json!({"ready": false})))
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert!(record.state.result("never").is_none());
    assert!(record.state.result("e").is_some());
}

#[tokio::test]
async fn test_wait_pauses_and_resume_continues() {
    let engine = WorkflowEngine::new();
    let graph = engine
        .create_graph(
            "approval",
            "",
            vec![
                Node::start("s"),
                Node::new("w", trellis_core::NodeKind::Wait),
                Node::tool("t", "echo", json!({"approved": true})),
                Node::end("e"),
            ],
            vec![Edge::new("s", "w"), Edge::new("w", "t"), Edge::new("t", "e")],
        )
        .unwrap();

    let paused = engine.execute_graph(&graph.id, Variables::new()).await.unwrap();
    assert_eq!(paused.status, ExecutionStatus::Paused);
    assert!(paused.completed_at.is_none());
    assert_eq!(paused.state.pending, vec!["t".to_string()]);
    assert!(paused.state.result("t").is_none());

    let resumed = engine.resume_execution(&paused.id).await.unwrap();
    assert_eq!(resumed.id, paused.id);
    assert_eq!(resumed.status, ExecutionStatus::Completed);
    assert_eq!(resumed.state.result("t"), Some(&json!({"approved": true})));

    // Terminal runs are returned unchanged.
    let again = engine.resume_execution(&paused.id).await.unwrap();
    assert_eq!(again, resumed);
}

#[tokio::test]
async fn test_cycle_stops_at_step_ceiling() {
    let mut config = AppConfig::default();
    config.engine.max_steps = 5;
    let store = Arc::new(CountingCheckpointStore::new());
    let engine = engine_with(store, config);
    let graph = engine
        .create_graph(
            "spin",
            "",
            vec![
                Node::start("s"),
                Node::tool("t", "echo", json!({})),
                Node::end("e"),
            ],
            vec![Edge::new("s", "t"), Edge::new("t", "t")],
        )
        .unwrap();

    let record = engine.execute_graph(&graph.id, Variables::new()).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.ceiling.as_deref(), Some("maximum steps reached"));
    assert!(record.state.result("e").is_some());
    assert_eq!(record.state.steps, 6);
}

#[tokio::test(start_paused = true)]
async fn test_time_ceiling_routes_to_end() {
    let mut config = AppConfig::default();
    config.engine.max_duration_secs = 2;
    let engine = WorkflowEngine::builder(config).build();
    engine
        .register_capability(SlowTool::new("slow", Duration::from_secs(10)))
        .await;
    let graph = engine
        .create_graph(
            "slow",
            "",
            vec![
                Node::start("s"),
                Node::tool("t", "slow", json!({})),
                Node::end("e"),
            ],
            vec![Edge::new("s", "t"), Edge::new("t", "e")],
        )
        .unwrap();

    let record = engine.execute_graph(&graph.id, Variables::new()).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.ceiling.as_deref(), Some("maximum execution time reached"));
    assert!(record.state.result("t").is_none());
    assert!(record.state.result("e").is_some());
}

#[tokio::test]
async fn test_checkpoint_failure_fails_run() {
    let store = Arc::new(CountingCheckpointStore::failing());
    let engine = engine_with(store, AppConfig::default());
    let graph = engine
        .create_graph(
            "doomed",
            "",
            vec![
                Node::start("s"),
                Node::tool("t", "echo", json!({})),
                Node::end("e"),
            ],
            vec![Edge::new("s", "t"), Edge::new("t", "e")],
        )
        .unwrap();

    let record = engine.execute_graph(&graph.id, Variables::new()).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Failed);
    let error = record.error.unwrap();
    assert!(error.starts_with("Checkpoint write failed"), "{}", error);
    assert!(error.contains("disk full"));
    assert!(record.state.result("e").is_none());
}

#[tokio::test]
async fn test_capability_errors_are_recorded_not_fatal() {
    let engine = WorkflowEngine::new();
    engine
        .register_capability(
            MockTool::returning("fetch", json!("page")).with_permissions(vec!["network".into()]),
        )
        .await;
    engine
        .register_capability(MockTool::failing("flaky", "upstream 503"))
        .await;
    let graph = engine
        .create_graph(
            "fetcher",
            "",
            vec![
                Node::start("s"),
                Node::tool("f", "fetch", json!({})),
                Node::tool("x", "flaky", json!({})),
                Node::end("e"),
            ],
            vec![Edge::new("s", "f"), Edge::new("f", "x"), Edge::new("x", "e")],
        )
        .unwrap();

    let denied = engine
        .start_execution(&graph.id, Variables::new(), Some(vec![]))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(denied.status, ExecutionStatus::Completed);
    assert_eq!(denied.state.errors.len(), 2);
    assert!(denied.state.errors[0].contains("Permission denied"));
    assert!(denied.state.errors[1].contains("upstream 503"));
    assert_eq!(
        denied.state.result("f").unwrap()["error"],
        json!(denied.state.errors[0])
    );

    let granted = engine
        .start_execution(&graph.id, Variables::new(), Some(vec!["network".into()]))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(granted.state.result("f"), Some(&json!("page")));
    assert_eq!(granted.state.errors.len(), 1);
}

#[tokio::test]
async fn test_list_executions_in_start_order() {
    let engine = WorkflowEngine::new();
    let graph = engine
        .create_graph(
            "noop",
            "",
            vec![Node::start("s"), Node::end("e")],
            vec![Edge::new("s", "e")],
        )
        .unwrap();
    let other = engine
        .create_graph(
            "other",
            "",
            vec![Node::start("s"), Node::end("e")],
            vec![Edge::new("s", "e")],
        )
        .unwrap();

    let mut ids = Vec::new();
    for _ in 0..3 {
        let record = engine.execute_graph(&graph.id, Variables::new()).await.unwrap();
        ids.push(record.id);
        std::thread::sleep(Duration::from_millis(2));
    }
    engine.execute_graph(&other.id, Variables::new()).await.unwrap();

    let listed: Vec<String> = engine
        .list_executions(Some(&graph.id))
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(listed, ids);
    assert_eq!(engine.list_executions(None).len(), 4);
}

#[tokio::test]
async fn test_events_bracket_the_run() {
    let engine = WorkflowEngine::new();
    let mut rx = engine.subscribe();
    let graph = engine
        .create_graph(
            "echo",
            "",
            vec![
                Node::start("s"),
                Node::tool("t", "echo", json!({})),
                Node::end("e"),
            ],
            vec![Edge::new("s", "t"), Edge::new("t", "e")],
        )
        .unwrap();

    let record = engine.execute_graph(&graph.id, Variables::new()).await.unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(
        events.first(),
        Some(EngineEvent::RunStarted { execution_id, .. }) if *execution_id == record.id
    ));
    assert!(matches!(
        events.last(),
        Some(EngineEvent::RunFinished { status: ExecutionStatus::Completed, .. })
    ));
    let started = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::NodeStarted { .. }))
        .count();
    let saved = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::CheckpointSaved { .. }))
        .count();
    assert_eq!(started, 3);
    assert_eq!(saved, 2);
}
