use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::execution::ExecutionRecord;
use crate::graph::RetrievalMode;
use crate::types::*;

/// A single model invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: String,
    #[serde(default)]
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// A model's reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    pub usage: Usage,
    /// Cost reported by the transport, if it reports one.
    #[serde(default)]
    pub cost_usd: Option<f64>,
}

/// Model transport.
pub trait ModelClient: Send + Sync + 'static {
    /// Send one request and wait for the complete reply.
    fn invoke(&self, request: ModelRequest) -> BoxFuture<'_, Result<ModelResponse>>;
}

/// An invokable external function.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in tool node configs).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> Value;

    /// Execute the tool with given input and context.
    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }

    /// Security tier for this tool (default: T1).
    fn tier(&self) -> crate::security::SecurityTier {
        crate::security::SecurityTier::T1
    }
}

/// A retrieval query issued by a retrieval node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalQuery {
    pub index: String,
    pub query: String,
    pub mode: RetrievalMode,
    pub top_k: usize,
    #[serde(default)]
    pub threshold: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub id: String,
    pub content: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: Value,
}

/// Retrieval transport over an external index.
pub trait Retriever: Send + Sync + 'static {
    fn retrieve(&self, query: RetrievalQuery) -> BoxFuture<'_, Result<Vec<RetrievedDocument>>>;

    /// Reorder candidates for a query. Defaults to score order.
    fn rerank(
        &self,
        _query: &str,
        mut documents: Vec<RetrievedDocument>,
    ) -> BoxFuture<'_, Result<Vec<RetrievedDocument>>> {
        documents.sort_by(|a, b| b.score.total_cmp(&a.score));
        Box::pin(async move { Ok(documents) })
    }
}

/// Durable store for execution records.
pub trait ExecutionStore: Send + Sync + 'static {
    /// Insert a new record.
    fn create(&self, record: &ExecutionRecord) -> BoxFuture<'_, Result<()>>;

    /// Overwrite an existing record.
    fn update(&self, record: &ExecutionRecord) -> BoxFuture<'_, Result<()>>;

    fn get(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<ExecutionRecord>>>;

    /// Most recent records first.
    fn list_recent(&self, limit: usize) -> BoxFuture<'_, Result<Vec<ExecutionRecord>>>;

    /// Executions a caller started since `since`; feeds rate limiting.
    fn count_started_since(
        &self,
        caller_id: &str,
        since: chrono::DateTime<chrono::Utc>,
    ) -> BoxFuture<'_, Result<usize>>;
}
