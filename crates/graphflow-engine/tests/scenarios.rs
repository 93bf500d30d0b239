use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use graphflow_core::config::EngineConfig;
use graphflow_core::error::FlowError;
use graphflow_core::execution::{
    ExecutionRequest, ExecutionResult, ExecutionStatus, SourceKind, WorkflowKind,
};
use graphflow_core::graph::GraphDefinition;
use graphflow_core::security::CallerIdentity;
use graphflow_core::traits::ExecutionStore;
use graphflow_core::types::ExecutionId;
use graphflow_core::validation::ValidationLayer;
use graphflow_engine::GraphEngine;
use graphflow_nodes::ToolRegistry;
use graphflow_test_utils::{
    echo_graph, parallel_tool_graph, RecordingStore, ScriptedModel, SlowTool, StoreOp,
};

fn graph(value: serde_json::Value) -> GraphDefinition {
    GraphDefinition::from_json(&value.to_string()).unwrap()
}

async fn run(
    engine: &GraphEngine,
    graph: &GraphDefinition,
    request: ExecutionRequest,
) -> ExecutionResult {
    engine
        .execute(
            request,
            graph,
            &CallerIdentity::anonymous(),
            CancellationToken::new(),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn echo_through_start_model_end() {
    let engine = GraphEngine::offline(EngineConfig::default());
    let result = run(
        &engine,
        &echo_graph("Echo: {input}"),
        ExecutionRequest::default().with_input("text", "Hello"),
    )
    .await;

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert!(result.output.contains("Echo: Hello"), "{}", result.output);
    assert!(result.usage.tokens_used > 0);
    assert!(result.errors.is_empty());
    assert!(result.metadata.debug.is_none());
}

#[tokio::test]
async fn parallel_tools_join_before_next_node() {
    let mut tools = ToolRegistry::new();
    tools.register(SlowTool::new("slow", Duration::from_millis(30), json!("slow-done")));
    tools.register(SlowTool::new("fast", Duration::from_millis(1), json!("fast-done")));

    let mut graph = parallel_tool_graph(&["slow", "fast"]);
    if let Some(end) = graph.nodes.iter_mut().find(|n| n.id == "end") {
        end.config = serde_json::from_value(json!({
            "kind": "end",
            "outputs": ["tools.slow", "tools.fast"]
        }))
        .unwrap();
    }

    let engine = GraphEngine::offline(EngineConfig::default()).with_tools(tools);
    let result = run(&engine, &graph, ExecutionRequest::default().with_debug(true)).await;

    assert_eq!(result.status, ExecutionStatus::Completed, "{:?}", result.errors);
    assert_eq!(result.payload["tools.slow"], json!("slow-done"));
    assert_eq!(result.payload["tools.fast"], json!("fast-done"));
    let debug = result.metadata.debug.unwrap();
    assert_eq!(debug["history"], json!(["start", "tools", "end"]));
}

#[tokio::test]
async fn conditional_without_match_finishes_as_completed() {
    let graph = graph(json!({
        "name": "branch",
        "nodes": [
            {"id": "start", "config": {"kind": "start"}},
            {"id": "check", "config": {
                "kind": "conditional",
                "condition": "inputs.flag == true",
                "terminal_on_no_match": true
            }},
            {"id": "end", "config": {"kind": "end", "output": "flagged"}}
        ],
        "edges": [
            {"source": "start", "target": "check"},
            {"source": "check", "target": "end", "condition": "result"}
        ]
    }));
    let engine = GraphEngine::offline(EngineConfig::default());

    let result = run(
        &engine,
        &graph,
        ExecutionRequest::default().with_input("flag", false).with_debug(true),
    )
    .await;
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert!(result.errors.is_empty());
    let debug = result.metadata.debug.unwrap();
    assert_eq!(debug["history"], json!(["start", "check"]));
    assert_eq!(debug["conditions"]["check"], json!(false));

    let taken = run(&engine, &graph, ExecutionRequest::default().with_input("flag", true)).await;
    assert_eq!(taken.output, "flagged");
}

#[tokio::test]
async fn conditional_without_default_or_terminal_is_rejected() {
    let graph = graph(json!({
        "name": "dangling",
        "nodes": [
            {"id": "start", "config": {"kind": "start"}},
            {"id": "check", "config": {"kind": "conditional", "condition": "inputs.flag"}},
            {"id": "end", "config": {"kind": "end"}}
        ],
        "edges": [
            {"source": "start", "target": "check"},
            {"source": "check", "target": "end", "condition": "result"}
        ]
    }));
    let engine = GraphEngine::offline(EngineConfig::default());
    let report = engine.validate(&graph, &CallerIdentity::anonymous()).await;
    assert!(report.has_error_code("dangling_conditional"));

    let err = engine
        .execute(
            ExecutionRequest::default(),
            &graph,
            &CallerIdentity::anonymous(),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Validation(ref msgs) if msgs[0].contains("dangling_conditional")));
}

#[tokio::test]
async fn loop_stops_at_bound_when_break_never_fires() {
    let graph = graph(json!({
        "name": "counter",
        "nodes": [
            {"id": "start", "config": {"kind": "start"}},
            {"id": "loop", "config": {
                "kind": "loop",
                "body": "inc",
                "max_iterations": 5,
                "break_condition": "count > 100"
            }},
            {"id": "inc", "config": {"kind": "variable", "operation": "increment", "key": "count"}},
            {"id": "end", "config": {"kind": "end", "output": "{count}"}}
        ],
        "edges": [
            {"source": "start", "target": "loop"},
            {"source": "loop", "target": "inc"},
            {"source": "inc", "target": "loop"},
            {"source": "loop", "target": "end"}
        ]
    }));
    let engine = GraphEngine::offline(EngineConfig::default());
    let result = run(&engine, &graph, ExecutionRequest::default().with_debug(true)).await;

    assert_eq!(result.status, ExecutionStatus::Completed, "{:?}", result.errors);
    assert_eq!(result.output, "5");
    let debug = result.metadata.debug.unwrap();
    assert_eq!(debug["loops"]["loop"]["exit"], json!("bound"));
    let inc_visits = debug["history"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|h| *h == "inc")
        .count();
    assert_eq!(inc_visits, 5);
}

#[tokio::test]
async fn unowned_cycle_fails_structure_and_skips_other_layers() {
    let graph = graph(json!({
        "name": "cyclic",
        "nodes": [
            {"id": "start", "config": {"kind": "start"}},
            {"id": "a", "config": {"kind": "variable", "operation": "set", "key": "x", "value": 1}},
            {"id": "b", "config": {"kind": "variable", "operation": "set", "key": "y", "value": 2}}
        ],
        "edges": [
            {"source": "start", "target": "a"},
            {"source": "a", "target": "b"},
            {"source": "b", "target": "a"}
        ]
    }));
    let engine = GraphEngine::offline(EngineConfig::default());
    let report = engine.validate(&graph, &CallerIdentity::anonymous()).await;
    assert!(report.has_error_code("cycle"));
    assert_eq!(report.layers_run(), vec![ValidationLayer::Structure]);

    let valid = engine
        .validate(&echo_graph("{input}"), &CallerIdentity::anonymous())
        .await;
    assert!(valid.is_valid());
    assert_eq!(valid.layers_run(), ValidationLayer::ALL.to_vec());
}

#[tokio::test]
async fn tracker_starts_once_and_finishes_once() {
    let store = Arc::new(RecordingStore::new());
    let engine = GraphEngine::new(
        EngineConfig::default(),
        Arc::new(ScriptedModel::new(vec!["fine"])),
        store.clone(),
    );
    let result = run(&engine, &echo_graph("{input}"), ExecutionRequest::default()).await;
    assert_eq!(result.status, ExecutionStatus::Completed);

    let ops = store.ops();
    assert_eq!(store.creates(), 1);
    assert_eq!(ops[0], StoreOp::Create(result.execution_id.0.clone()));
    let record = store.record(&result.execution_id).unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert!(record.finished_at.is_some());
    assert_eq!(record.history, vec!["start", "model", "end"]);

    let snapshot = engine.metrics().snapshot();
    assert_eq!(snapshot.started, 1);
    assert_eq!(snapshot.completed + snapshot.failed + snapshot.cancelled, 1);
}

#[tokio::test]
async fn failed_run_is_recorded_once_with_history() {
    let store = Arc::new(RecordingStore::new());
    let engine = GraphEngine::new(
        EngineConfig::default(),
        Arc::new(ScriptedModel::failing("quota exceeded")),
        store.clone(),
    );
    let result = run(&engine, &echo_graph("{input}"), ExecutionRequest::default()).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result.errors[0].contains("quota exceeded"));
    let debug = result.metadata.debug.unwrap();
    assert_eq!(debug["history"], json!(["start", "model"]));

    assert_eq!(store.creates(), 1);
    let record = store.record(&result.execution_id).unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.error.unwrap().contains("quota exceeded"));
    assert_eq!(engine.metrics().snapshot().failed, 1);
}

#[tokio::test]
async fn template_id_names_the_source_when_no_definition_id() {
    let mut graph = echo_graph("{input}");
    graph.template_id = Some("t1".into());
    let engine = GraphEngine::offline(EngineConfig::default());
    let result = run(&engine, &graph, ExecutionRequest::default()).await;

    assert_eq!(result.metadata.source_id.as_deref(), Some("t1"));
    assert_eq!(result.metadata.source_kind, Some(SourceKind::Template));
    let record = engine.store().get(&result.execution_id).await.unwrap().unwrap();
    assert_eq!(record.source_id.as_deref(), Some("t1"));
}

#[tokio::test]
async fn request_target_names_the_source_when_graph_has_no_ids() {
    let engine = GraphEngine::offline(EngineConfig::default());
    let request = ExecutionRequest::new(WorkflowKind::Template).with_target("t1");
    let result = run(&engine, &echo_graph("{input}"), request).await;

    assert_eq!(result.metadata.source_id.as_deref(), Some("t1"));
    assert_eq!(result.metadata.source_kind, Some(SourceKind::Template));
    let record = engine.store().get(&result.execution_id).await.unwrap().unwrap();
    assert_eq!(record.source_id.as_deref(), Some("t1"));
    assert_eq!(record.workflow_kind, WorkflowKind::Template);
}

#[tokio::test]
async fn cancelled_run_log_ends_with_terminal_line() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::default();
    config.log.enabled = true;
    config.log.level = 1;
    config.log.log_dir = Some(dir.path().to_string_lossy().into_owned());
    let engine = GraphEngine::offline(config);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = engine
        .execute(
            ExecutionRequest::default(),
            &echo_graph("{input}"),
            &CallerIdentity::anonymous(),
            cancel,
        )
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Cancelled);

    let run_dir = dir.path().join(&result.execution_id.0);
    let file = std::fs::read_dir(&run_dir).unwrap().next().unwrap().unwrap();
    let content = std::fs::read_to_string(file.path()).unwrap();
    let lines: Vec<serde_json::Value> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.first().unwrap()["event_type"], "started");
    let last = lines.last().unwrap();
    assert_eq!(last["event_type"], "failed");
    assert_eq!(last["detail"]["status"], "cancelled");
}

#[tokio::test]
async fn cancelled_token_yields_cancelled_result() {
    let engine = GraphEngine::offline(EngineConfig::default());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = engine
        .execute(
            ExecutionRequest::default(),
            &echo_graph("{input}"),
            &CallerIdentity::anonymous(),
            cancel,
        )
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert_eq!(engine.metrics().snapshot().cancelled, 1);
    assert!(engine
        .store()
        .get(&ExecutionId::from_string("missing"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn rate_limit_rejects_after_quota() {
    let mut config = EngineConfig::default();
    config.limits.max_executions_per_minute = 2;
    let engine = GraphEngine::offline(config);
    let caller = CallerIdentity::new("busy");
    let graph = echo_graph("{input}");

    for _ in 0..2 {
        engine
            .execute(ExecutionRequest::default(), &graph, &caller, CancellationToken::new())
            .await
            .unwrap();
    }
    let err = engine
        .execute(ExecutionRequest::default(), &graph, &caller, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Validation(_)));

    // Other callers are counted separately
    engine
        .execute(
            ExecutionRequest::default(),
            &graph,
            &CallerIdentity::new("idle"),
            CancellationToken::new(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn session_and_global_scopes_round_trip() {
    let graph = graph(json!({
        "name": "scopes",
        "nodes": [
            {"id": "start", "config": {"kind": "start"}},
            {"id": "visits", "config": {
                "kind": "variable", "operation": "increment", "key": "visits", "scope": "session"
            }},
            {"id": "scratch", "config": {
                "kind": "variable", "operation": "set", "key": "tmp", "value": "x", "scope": "temporary"
            }},
            {"id": "end", "config": {"kind": "end"}}
        ],
        "edges": [
            {"source": "start", "target": "visits"},
            {"source": "visits", "target": "scratch"},
            {"source": "scratch", "target": "end"}
        ]
    }));
    let engine = GraphEngine::offline(EngineConfig::default());
    let mut request = ExecutionRequest::default().with_debug(true);
    request.session.insert("visits".into(), json!(3));

    let result = run(&engine, &graph, request).await;
    assert_eq!(result.status, ExecutionStatus::Completed, "{:?}", result.errors);
    assert_eq!(result.metadata.session["visits"], json!(4));
    assert!(result.metadata.session.get("tmp").is_none());
    assert!(result.metadata.global.is_empty());
}
