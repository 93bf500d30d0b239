//! Requests, durable records and results exchanged with callers and stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{FlowError, Result};
use crate::types::{CorrelationId, ExecutionId, Usage};

/// Lifecycle state of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown execution status: {}", other)),
        }
    }
}

/// What kind of workflow the caller asked to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    #[default]
    Definition,
    Template,
    Custom,
    Chat,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Definition => "definition",
            Self::Template => "template",
            Self::Custom => "custom",
            Self::Chat => "chat",
        }
    }
}

/// A caller's request to run a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionRequest {
    #[serde(default)]
    pub workflow_kind: WorkflowKind,
    /// Identifier of the definition or template to run.
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub input: Map<String, Value>,
    /// Surface history, log and variables in the result metadata.
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Session-scoped variables the caller persists between executions.
    #[serde(default)]
    pub session: Map<String, Value>,
    /// Global-scoped variables the caller persists between executions.
    #[serde(default)]
    pub global: Map<String, Value>,
}

impl ExecutionRequest {
    pub fn new(workflow_kind: WorkflowKind) -> Self {
        Self {
            workflow_kind,
            ..Default::default()
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.input.insert(key.into(), value.into());
        self
    }

    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

/// One entry of the structured execution log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogEntry {
    pub fn new(level: LogLevel, node_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            node_id: node_id.map(str::to_string),
            level,
            message: message.into(),
        }
    }
}

/// Durable execution record, owned by the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub correlation_id: CorrelationId,
    pub workflow_kind: WorkflowKind,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub caller_id: Option<String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub input: Value,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub execution_time_ms: u64,
    #[serde(default)]
    pub history: Vec<String>,
    #[serde(default)]
    pub log: Vec<LogEntry>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionRecord {
    pub fn new(
        execution_id: ExecutionId,
        correlation_id: CorrelationId,
        workflow_kind: WorkflowKind,
        source_id: Option<String>,
        input: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            correlation_id,
            workflow_kind,
            source_id,
            caller_id: None,
            status: ExecutionStatus::Pending,
            started_at: now,
            updated_at: now,
            finished_at: None,
            input,
            output: None,
            usage: Usage::default(),
            execution_time_ms: 0,
            history: Vec::new(),
            log: Vec::new(),
            error: None,
        }
    }
}

/// Which identifier `source_id` came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Definition,
    Template,
}

/// Aggregated usage reported to the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResultUsage {
    pub tokens_used: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub execution_time_ms: u64,
}

impl ResultUsage {
    pub fn from_usage(usage: &Usage, execution_time_ms: u64) -> Self {
        Self {
            tokens_used: usage.total_tokens(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost_usd: usage.cost_usd,
            execution_time_ms,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResultMetadata {
    pub workflow_kind: WorkflowKind,
    /// Definition id, or the template id when no definition id exists.
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub source_kind: Option<SourceKind>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Session-scoped variables to persist.
    #[serde(default)]
    pub session: Map<String, Value>,
    /// Global-scoped variables to persist.
    #[serde(default)]
    pub global: Map<String, Value>,
    /// History, log and variables; present for debug requests and failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<Value>,
}

/// Standardized outcome returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub output: String,
    #[serde(default)]
    pub payload: Value,
    pub usage: ResultUsage,
    /// Error messages, first error first. Empty on success.
    #[serde(default)]
    pub errors: Vec<String>,
    pub metadata: ResultMetadata,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed && self.errors.is_empty()
    }

    /// Convert a failed or cancelled result into an error.
    pub fn into_result(self) -> Result<ExecutionResult> {
        match self.status {
            ExecutionStatus::Cancelled => Err(FlowError::Cancelled),
            ExecutionStatus::Failed => {
                let message = self
                    .errors
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "execution failed".to_string());
                Err(FlowError::Execution {
                    node: self
                        .metadata
                        .debug
                        .as_ref()
                        .and_then(|d| d.get("failed_node"))
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                    message,
                })
            }
            _ => Ok(self),
        }
    }
}
