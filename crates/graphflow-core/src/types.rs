use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique identifier of one execution instance.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation identifier linking an execution to the caller's request.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single content block in a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_name: String,
        content: serde_json::Value,
        is_error: bool,
    },
}

/// Bookkeeping attached to a message by the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageMetadata {
    /// Protected messages survive history trimming.
    #[serde(default)]
    pub protected: bool,
    /// Node that produced the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

/// A chat message in the execution's message history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl ChatMessage {
    fn text_message(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentBlock::Text { text: text.into() }],
            timestamp: Some(Utc::now()),
            metadata: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::text_message(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text_message(Role::User, text)
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::text_message(Role::Assistant, text)
    }

    pub fn tool_result(
        tool_name: impl Into<String>,
        content: serde_json::Value,
        is_error: bool,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: vec![ContentBlock::ToolResult {
                tool_name: tool_name.into(),
                content,
                is_error,
            }],
            timestamp: Some(Utc::now()),
            metadata: None,
        }
    }

    /// Tag the message with the node that produced it.
    pub fn from_node(mut self, node_id: &str) -> Self {
        let meta = self.metadata.get_or_insert_with(MessageMetadata::default);
        meta.node_id = Some(node_id.to_string());
        self
    }

    /// Mark the message as protected from trimming.
    pub fn protected(mut self) -> Self {
        self.metadata
            .get_or_insert_with(MessageMetadata::default)
            .protected = true;
        self
    }

    pub fn is_protected(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.protected)
    }

    /// Extract all text content from this message.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Token and cost counters. Only ever grows during an execution.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cost_usd: 0.0,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Accumulate another usage record. Negative costs are ignored.
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        if other.cost_usd.is_finite() && other.cost_usd > 0.0 {
            self.cost_usd += other.cost_usd;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.cost_usd == 0.0
    }
}

/// Result of a tool execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub content: serde_json::Value,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<serde_json::Value>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<serde_json::Value>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Tool definition as advertised by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Context passed to tools during execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub execution_id: ExecutionId,
    pub correlation_id: CorrelationId,
    pub node_id: String,
    pub cancel: CancellationToken,
}

/// Lifecycle event emitted by the tracker.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionEvent {
    pub execution_id: ExecutionId,
    pub correlation_id: CorrelationId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
    pub data: serde_json::Value,
}

impl ExecutionEvent {
    pub fn new(
        execution_id: &ExecutionId,
        correlation_id: &CorrelationId,
        kind: EventKind,
        data: serde_json::Value,
    ) -> Self {
        Self {
            execution_id: execution_id.clone(),
            correlation_id: correlation_id.clone(),
            timestamp: Utc::now(),
            kind,
            data,
        }
    }

    /// Whether this event closes the execution's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::Completed | EventKind::Failed { .. })
    }
}

/// What happened.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    /// Execution started.
    Started,
    /// A node is about to run.
    NodeStarted { node_id: String },
    /// A node finished and its update was merged.
    NodeCompleted { node_id: String, elapsed_ms: u64 },
    /// A node raised an error.
    NodeFailed { node_id: String, error: String },
    /// An error handler scheduled another attempt.
    NodeRetrying {
        node_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// Execution completed.
    Completed,
    /// Execution failed or was cancelled.
    Failed { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_accumulates() {
        let mut usage = Usage::default();
        usage.add(&Usage {
            input_tokens: 10,
            output_tokens: 5,
            cost_usd: 0.25,
        });
        usage.add(&Usage {
            input_tokens: 1,
            output_tokens: 1,
            cost_usd: -3.0,
        });
        assert_eq!(usage.total_tokens(), 17);
        assert!((usage.cost_usd - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_message_protection_and_node_tag() {
        let msg = ChatMessage::assistant_text("hi").from_node("m1").protected();
        assert!(msg.is_protected());
        assert_eq!(
            msg.metadata.as_ref().and_then(|m| m.node_id.as_deref()),
            Some("m1")
        );
        assert_eq!(msg.text(), "hi");
    }

    #[test]
    fn test_event_serializes_kind_inline() {
        let event = ExecutionEvent::new(
            &ExecutionId::from_string("e1"),
            &CorrelationId::from_string("c1"),
            EventKind::NodeCompleted {
                node_id: "n1".into(),
                elapsed_ms: 3,
            },
            serde_json::json!({}),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "node_completed");
        assert_eq!(json["node_id"], "n1");
        assert_eq!(json["execution_id"], "e1");
        assert!(!event.is_terminal());
    }
}
