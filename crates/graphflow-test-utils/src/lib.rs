//! Mocks and fixtures shared by graphflow tests.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Value};

use graphflow_core::error::{FlowError, Result};
use graphflow_core::execution::ExecutionRecord;
use graphflow_core::graph::{
    EdgeDef, EndConfig, GraphDefinition, ModelNodeConfig, NodeConfig, NodeDef, StartConfig,
    ToolCallConfig, ToolNodeConfig,
};
use graphflow_core::traits::{
    ExecutionStore, ModelClient, ModelRequest, ModelResponse, RetrievalQuery, RetrievedDocument,
    Retriever, Tool,
};
use graphflow_core::types::{ExecutionId, ToolContext, ToolResult, Usage};

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Model that replies with scripted texts in order, then repeats the last one.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    usage: Usage,
    failure: Option<String>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<&str>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(String::from).collect()),
            last: Mutex::new(String::new()),
            usage: Usage::new(10, 5),
            failure: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A model whose every call fails with a retryable request error.
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::new(vec![])
        }
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = Usage::new(input_tokens, output_tokens);
        self
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl ModelClient for ScriptedModel {
    fn invoke(&self, request: ModelRequest) -> BoxFuture<'_, Result<ModelResponse>> {
        self.requests.lock().unwrap().push(request);
        let outcome = match &self.failure {
            Some(message) => Err(FlowError::ModelRequest(message.clone())),
            None => {
                let mut last = self.last.lock().unwrap();
                if let Some(next) = self.replies.lock().unwrap().pop_front() {
                    *last = next;
                }
                Ok(ModelResponse {
                    text: last.clone(),
                    usage: self.usage,
                    cost_usd: None,
                })
            }
        };
        Box::pin(async move { outcome })
    }
}

/// Model that fails a fixed number of times before echoing a reply.
pub struct FlakyModel {
    failures_left: AtomicUsize,
    reply: String,
    calls: Arc<AtomicUsize>,
}

impl FlakyModel {
    pub fn new(failures: usize, reply: &str) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            reply: reply.to_string(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl ModelClient for FlakyModel {
    fn invoke(&self, _request: ModelRequest) -> BoxFuture<'_, Result<ModelResponse>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let reply = self.reply.clone();
        Box::pin(async move {
            if failing {
                Err(FlowError::ModelRequest("503 service unavailable".into()))
            } else {
                Ok(ModelResponse {
                    text: reply,
                    usage: Usage::new(4, 2),
                    cost_usd: None,
                })
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// Tool that sleeps, then returns a fixed value.
pub struct SlowTool {
    name: String,
    delay: Duration,
    output: Value,
}

impl SlowTool {
    pub fn new(name: &str, delay: Duration, output: Value) -> Self {
        Self {
            name: name.to_string(),
            delay,
            output,
        }
    }
}

impl Tool for SlowTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Sleeps, then returns a fixed value."
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    fn execute(&self, _input: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(ToolResult::success(self.output.clone()))
        })
    }

    fn timeout_secs(&self) -> u64 {
        600
    }
}

/// Tool that counts its invocations and echoes its input.
pub struct CountingTool {
    name: String,
    calls: Arc<AtomicUsize>,
}

impl CountingTool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl Tool for CountingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Counts invocations."
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    fn execute(&self, input: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Box::pin(async move { Ok(ToolResult::success(json!({"call": n, "input": input}))) })
    }
}

/// Tool that fails, optionally only after a number of successful calls.
pub struct FailingTool {
    name: String,
    message: String,
    successes: usize,
    calls: AtomicUsize,
}

impl FailingTool {
    pub fn new(name: &str, message: &str) -> Self {
        Self::after(name, message, 0)
    }

    /// Succeeds for the first `successes` calls, then fails on every call.
    pub fn after(name: &str, message: &str, successes: usize) -> Self {
        Self {
            name: name.to_string(),
            message: message.to_string(),
            successes,
            calls: AtomicUsize::new(0),
        }
    }
}

impl Tool for FailingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Fails on demand."
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    fn execute(&self, _input: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.successes {
            return Box::pin(async move { Ok(ToolResult::success(json!("ok"))) });
        }
        let err = FlowError::ToolExecution {
            tool: self.name.clone(),
            message: self.message.clone(),
        };
        Box::pin(async move { Err(err) })
    }
}

// ---------------------------------------------------------------------------
// Retrieval
// ---------------------------------------------------------------------------

/// Retriever returning a fixed document set with fixed scores, unsorted.
pub struct StaticRetriever {
    documents: Vec<RetrievedDocument>,
}

impl StaticRetriever {
    pub fn new(docs: Vec<(&str, f32)>) -> Self {
        Self {
            documents: docs
                .into_iter()
                .map(|(id, score)| RetrievedDocument {
                    id: id.to_string(),
                    content: format!("content of {}", id),
                    score,
                    metadata: Value::Null,
                })
                .collect(),
        }
    }
}

impl Retriever for StaticRetriever {
    fn retrieve(&self, query: RetrievalQuery) -> BoxFuture<'_, Result<Vec<RetrievedDocument>>> {
        let mut docs = self.documents.clone();
        docs.truncate(query.top_k);
        Box::pin(async move { Ok(docs) })
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Operation observed by a `RecordingStore`.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Create(String),
    Update(String),
}

/// In-memory store that records every write, for lifecycle assertions.
#[derive(Default)]
pub struct RecordingStore {
    records: Mutex<HashMap<String, ExecutionRecord>>,
    ops: Mutex<Vec<StoreOp>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<StoreOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn creates(&self) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, StoreOp::Create(_)))
            .count()
    }

    pub fn record(&self, id: &ExecutionId) -> Option<ExecutionRecord> {
        self.records.lock().unwrap().get(&id.0).cloned()
    }
}

impl ExecutionStore for RecordingStore {
    fn create(&self, record: &ExecutionRecord) -> BoxFuture<'_, Result<()>> {
        let record = record.clone();
        Box::pin(async move {
            let id = record.execution_id.0.clone();
            self.ops.lock().unwrap().push(StoreOp::Create(id.clone()));
            self.records.lock().unwrap().insert(id, record);
            Ok(())
        })
    }

    fn update(&self, record: &ExecutionRecord) -> BoxFuture<'_, Result<()>> {
        let record = record.clone();
        Box::pin(async move {
            let id = record.execution_id.0.clone();
            self.ops.lock().unwrap().push(StoreOp::Update(id.clone()));
            let mut records = self.records.lock().unwrap();
            if !records.contains_key(&id) {
                return Err(FlowError::RecordNotFound(id));
            }
            records.insert(id, record);
            Ok(())
        })
    }

    fn get(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<ExecutionRecord>>> {
        let id = id.clone();
        Box::pin(async move { Ok(self.record(&id)) })
    }

    fn list_recent(&self, limit: usize) -> BoxFuture<'_, Result<Vec<ExecutionRecord>>> {
        Box::pin(async move {
            let mut all: Vec<ExecutionRecord> =
                self.records.lock().unwrap().values().cloned().collect();
            all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            all.truncate(limit);
            Ok(all)
        })
    }

    fn count_started_since(
        &self,
        caller_id: &str,
        since: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<usize>> {
        let caller_id = caller_id.to_string();
        Box::pin(async move {
            Ok(self
                .records
                .lock()
                .unwrap()
                .values()
                .filter(|r| r.caller_id.as_deref() == Some(caller_id.as_str()))
                .filter(|r| r.started_at >= since)
                .count())
        })
    }
}

// ---------------------------------------------------------------------------
// Graphs
// ---------------------------------------------------------------------------

/// `start -> model(prompt) -> end`, with the end node echoing the model output.
pub fn echo_graph(prompt: &str) -> GraphDefinition {
    GraphDefinition::new("echo")
        .with_node(NodeDef::new("start", NodeConfig::Start(StartConfig::default())))
        .with_node(NodeDef::new(
            "model",
            NodeConfig::Model(ModelNodeConfig::new(prompt)),
        ))
        .with_node(NodeDef::new(
            "end",
            NodeConfig::End(EndConfig {
                output: Some("{model_output}".into()),
                outputs: vec![],
            }),
        ))
        .with_edge(EdgeDef::new("start", "model"))
        .with_edge(EdgeDef::new("model", "end"))
}

/// `start -> tools(parallel calls) -> end`.
pub fn parallel_tool_graph(tools: &[&str]) -> GraphDefinition {
    let calls = tools
        .iter()
        .map(|t| ToolCallConfig::new(*t, json!({})))
        .collect();
    GraphDefinition::new("fan-out")
        .with_node(NodeDef::new("start", NodeConfig::Start(StartConfig::default())))
        .with_node(NodeDef::new(
            "tools",
            NodeConfig::Tool(ToolNodeConfig {
                calls,
                parallel: true,
            }),
        ))
        .with_node(NodeDef::new("end", NodeConfig::End(EndConfig::default())))
        .with_edge(EdgeDef::new("start", "tools"))
        .with_edge(EdgeDef::new("tools", "end"))
}

/// Write a config file into a fresh temp dir. Keep the dir alive for the test.
pub fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, contents).unwrap();
    (dir, path)
}
