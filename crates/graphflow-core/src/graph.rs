//! Declarative workflow graph: nodes, edges and the typed per-kind configs.
//!
//! A `GraphDefinition` is loaded once per execution and never mutated. Each
//! node carries a `NodeConfig`, a closed enum with one variant per node kind;
//! executors are looked up by `NodeKind` and match on the variant they own.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Immutable description of a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDefinition {
    #[serde(default)]
    pub name: String,
    /// Identifier of the stored definition this graph was loaded from.
    #[serde(default)]
    pub definition_id: Option<String>,
    /// Identifier of the template this graph was instantiated from.
    #[serde(default)]
    pub template_id: Option<String>,
    /// Designated entry node. Falls back to the single `start` node.
    #[serde(default)]
    pub entry: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub edges: Vec<EdgeDef>,
}

impl GraphDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parse a graph from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load a graph from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn with_entry(mut self, id: impl Into<String>) -> Self {
        self.entry = Some(id.into());
        self
    }

    pub fn with_node(mut self, node: NodeDef) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: EdgeDef) -> Self {
        self.edges.push(edge);
        self
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Index of nodes by id. Later duplicates win; structure validation rejects them.
    pub fn node_index(&self) -> HashMap<&str, &NodeDef> {
        self.nodes.iter().map(|n| (n.id.as_str(), n)).collect()
    }

    /// Outgoing edges of a node, in declared order.
    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a EdgeDef> + 'a {
        self.edges.iter().filter(move |e| e.source == id)
    }

    /// Resolve the entry node id: the explicit `entry`, else the only `start` node.
    pub fn entry_node_id(&self) -> Option<&str> {
        if let Some(entry) = self.entry.as_deref() {
            return Some(entry);
        }
        let mut starts = self.nodes.iter().filter(|n| n.kind() == NodeKind::Start);
        match (starts.next(), starts.next()) {
            (Some(only), None) => Some(only.id.as_str()),
            _ => None,
        }
    }

    /// The error handler protecting a node, if any.
    pub fn handler_for(&self, node_id: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| match &n.config {
            NodeConfig::ErrorHandler(cfg) => cfg.protects.iter().any(|p| p == node_id),
            _ => false,
        })
    }
}

/// A unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Per-node timeout. `None` means the node may run indefinitely.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    pub config: NodeConfig,
}

impl NodeDef {
    pub fn new(id: impl Into<String>, config: NodeConfig) -> Self {
        Self {
            id: id.into(),
            name: None,
            timeout_ms: None,
            config,
        }
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn kind(&self) -> NodeKind {
        self.config.kind()
    }

    /// Display name, defaulting to the id.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// The variable key this node writes its primary output to.
    pub fn output_key(&self) -> String {
        let explicit = match &self.config {
            NodeConfig::Model(c) => c.output_key.as_deref(),
            NodeConfig::Retrieval(c) => c.output_key.as_deref(),
            NodeConfig::Variable(c) => c.output_key.as_deref(),
            _ => None,
        };
        explicit
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}_output", self.id))
    }
}

/// A directed transition between nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeDef {
    #[serde(alias = "from")]
    pub source: String,
    #[serde(alias = "to")]
    pub target: String,
    /// Guard expression; only meaningful on edges leaving a conditional node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl EdgeDef {
    /// Create an unconditional edge.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition: None,
        }
    }

    /// Create a conditional edge.
    pub fn when(
        source: impl Into<String>,
        target: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition: Some(condition.into()),
        }
    }
}

/// Closed set of node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    End,
    Model,
    Tool,
    Memory,
    Retrieval,
    Conditional,
    Loop,
    Variable,
    #[serde(alias = "errorHandler")]
    ErrorHandler,
    Delay,
}

impl NodeKind {
    pub const ALL: [NodeKind; 11] = [
        NodeKind::Start,
        NodeKind::End,
        NodeKind::Model,
        NodeKind::Tool,
        NodeKind::Memory,
        NodeKind::Retrieval,
        NodeKind::Conditional,
        NodeKind::Loop,
        NodeKind::Variable,
        NodeKind::ErrorHandler,
        NodeKind::Delay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::End => "end",
            NodeKind::Model => "model",
            NodeKind::Tool => "tool",
            NodeKind::Memory => "memory",
            NodeKind::Retrieval => "retrieval",
            NodeKind::Conditional => "conditional",
            NodeKind::Loop => "loop",
            NodeKind::Variable => "variable",
            NodeKind::ErrorHandler => "error_handler",
            NodeKind::Delay => "delay",
        }
    }

    /// Kinds that route control flow rather than doing work.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            NodeKind::Start
                | NodeKind::End
                | NodeKind::Conditional
                | NodeKind::Loop
                | NodeKind::ErrorHandler
        )
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "errorHandler" => Ok(NodeKind::ErrorHandler),
            other => NodeKind::ALL
                .iter()
                .copied()
                .find(|k| k.as_str() == other)
                .ok_or_else(|| format!("unknown node kind: {}", other)),
        }
    }
}

/// Typed configuration, one variant per node kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeConfig {
    Start(StartConfig),
    End(EndConfig),
    Model(ModelNodeConfig),
    Tool(ToolNodeConfig),
    Memory(MemoryConfig),
    Retrieval(RetrievalConfig),
    Conditional(ConditionalConfig),
    Loop(LoopConfig),
    Variable(VariableConfig),
    #[serde(alias = "errorHandler")]
    ErrorHandler(ErrorHandlerConfig),
    Delay(DelayConfig),
}

impl NodeConfig {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeConfig::Start(_) => NodeKind::Start,
            NodeConfig::End(_) => NodeKind::End,
            NodeConfig::Model(_) => NodeKind::Model,
            NodeConfig::Tool(_) => NodeKind::Tool,
            NodeConfig::Memory(_) => NodeKind::Memory,
            NodeConfig::Retrieval(_) => NodeKind::Retrieval,
            NodeConfig::Conditional(_) => NodeKind::Conditional,
            NodeConfig::Loop(_) => NodeKind::Loop,
            NodeConfig::Variable(_) => NodeKind::Variable,
            NodeConfig::ErrorHandler(_) => NodeKind::ErrorHandler,
            NodeConfig::Delay(_) => NodeKind::Delay,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartConfig {
    /// Input keys that must be present in the request.
    #[serde(default)]
    pub required: Vec<String>,
    /// Values used for input keys the request does not supply.
    #[serde(default)]
    pub defaults: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndConfig {
    /// Template rendered into the result's output text.
    #[serde(default)]
    pub output: Option<String>,
    /// Variable keys collected into the result payload.
    #[serde(default)]
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelNodeConfig {
    /// User prompt template.
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Model identifier passed to the transport.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub output_key: Option<String>,
    /// Send the accumulated message history along with the prompt.
    #[serde(default = "default_true")]
    pub include_history: bool,
}

impl ModelNodeConfig {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            model: None,
            temperature: None,
            max_tokens: None,
            output_key: None,
            include_history: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolNodeConfig {
    /// Tool invocations, in declared order.
    pub calls: Vec<ToolCallConfig>,
    /// Fan the calls out concurrently and join before continuing.
    #[serde(default)]
    pub parallel: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallConfig {
    pub tool: String,
    /// Tool input; string leaves are rendered as templates.
    #[serde(default)]
    pub input: Value,
    /// Context key this call writes to. Defaults to `{node_id}.{tool}`.
    #[serde(default)]
    pub output_key: Option<String>,
}

impl ToolCallConfig {
    pub fn new(tool: impl Into<String>, input: Value) -> Self {
        Self {
            tool: tool.into(),
            input,
            output_key: None,
        }
    }

    pub fn resolved_output_key(&self, node_id: &str) -> String {
        self.output_key
            .clone()
            .unwrap_or_else(|| format!("{}.{}", node_id, self.tool))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStrategy {
    #[default]
    Trim,
    Summarize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub strategy: MemoryStrategy,
    /// Window size in messages.
    #[serde(default)]
    pub max_messages: Option<usize>,
    /// Window size in estimated tokens.
    #[serde(default)]
    pub max_tokens: Option<usize>,
    /// Most recent messages that are never trimmed or summarized.
    #[serde(default = "default_keep_last")]
    pub keep_last: usize,
    /// Model used for summarization.
    #[serde(default)]
    pub model: Option<String>,
}

fn default_keep_last() -> usize {
    4
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    #[default]
    Similarity,
    Keyword,
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub index: String,
    /// Query template.
    pub query: String,
    #[serde(default)]
    pub mode: RetrievalMode,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Minimum score a document must reach.
    #[serde(default)]
    pub threshold: Option<f32>,
    #[serde(default)]
    pub rerank: bool,
    #[serde(default)]
    pub output_key: Option<String>,
}

fn default_top_k() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalConfig {
    /// Boolean expression recorded as this node's result.
    pub condition: String,
    /// Finish the execution (successfully) when no edge matches and no default exists.
    #[serde(default)]
    pub terminal_on_no_match: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// First node of the loop body.
    pub body: String,
    /// Mandatory iteration bound.
    pub max_iterations: u32,
    /// Exit early once this evaluates true.
    #[serde(default)]
    pub break_condition: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableOp {
    Set,
    Get,
    Append,
    Increment,
    Decrement,
    Merge,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableScope {
    #[default]
    Workflow,
    Session,
    Global,
    Temporary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableConfig {
    pub operation: VariableOp,
    pub key: String,
    /// Operand. String values are rendered as templates.
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub scope: VariableScope,
    /// Destination for `get`.
    #[serde(default)]
    pub output_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Fixed,
    Linear,
    Exponential,
    Jittered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff: BackoffStrategy::default(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

/// What an error handler does once retries are exhausted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ExhaustedAction {
    /// Skip the failed node and continue with its successor.
    Resume,
    /// Transfer control to the handler node and follow its outgoing edge.
    Fallback,
    /// Write `value` to the failed node's output key and continue.
    Default { value: Value },
    /// Fail the execution.
    #[default]
    Terminate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHandlerConfig {
    /// Node ids forming the protected region.
    pub protects: Vec<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub on_exhausted: ExhaustedAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DelayMode {
    Fixed {
        ms: u64,
    },
    Random {
        min_ms: u64,
        max_ms: u64,
    },
    /// `base_ms * factor^(visits - 1)`, capped at `max_ms`.
    Exponential {
        base_ms: u64,
        #[serde(default = "default_factor")]
        factor: f64,
        max_ms: u64,
    },
    /// Spacing that keeps this path under the given request rate.
    RateLimit {
        requests_per_second: f64,
    },
}

fn default_factor() -> f64 {
    2.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayConfig {
    #[serde(flatten)]
    pub mode: DelayMode,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> GraphDefinition {
        GraphDefinition::from_json(
            &json!({
                "name": "echo",
                "nodes": [
                    {"id": "start", "config": {"kind": "start"}},
                    {"id": "m", "config": {"kind": "model", "prompt": "Echo: {input}"}},
                    {"id": "end", "config": {"kind": "end", "output": "{m_output}"}}
                ],
                "edges": [
                    {"source": "start", "target": "m"},
                    {"from": "m", "to": "end"}
                ]
            })
            .to_string(),
        )
        .unwrap()
    }

    #[test]
    fn test_parse_and_lookup() {
        let graph = sample();
        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.node("m").unwrap().kind(), NodeKind::Model);
        assert_eq!(graph.outgoing("m").next().unwrap().target, "end");
        assert_eq!(graph.node("m").unwrap().output_key(), "m_output");
    }

    #[test]
    fn test_entry_falls_back_to_single_start() {
        let graph = sample();
        assert_eq!(graph.entry_node_id(), Some("start"));
        let graph = graph.with_entry("m");
        assert_eq!(graph.entry_node_id(), Some("m"));
    }

    #[test]
    fn test_error_handler_alias_and_lookup() {
        let graph = GraphDefinition::from_json(
            &json!({
                "nodes": [
                    {"id": "t", "config": {"kind": "tool", "calls": [{"tool": "echo"}]}},
                    {"id": "h", "config": {
                        "kind": "errorHandler",
                        "protects": ["t"],
                        "retry": {"max_retries": 2, "backoff": "exponential"},
                        "on_exhausted": {"action": "default", "value": "n/a"}
                    }}
                ]
            })
            .to_string(),
        )
        .unwrap();
        let handler = graph.handler_for("t").unwrap();
        assert_eq!(handler.id, "h");
        match &handler.config {
            NodeConfig::ErrorHandler(cfg) => {
                assert_eq!(cfg.retry.max_retries, 2);
                assert_eq!(cfg.retry.backoff, BackoffStrategy::Exponential);
                assert_eq!(cfg.on_exhausted, ExhaustedAction::Default { value: json!("n/a") });
            }
            other => panic!("unexpected config: {:?}", other),
        }
    }

    #[test]
    fn test_delay_modes_parse() {
        let cfg: NodeConfig = serde_json::from_value(json!({
            "kind": "delay", "mode": "exponential", "base_ms": 10, "max_ms": 100
        }))
        .unwrap();
        match cfg {
            NodeConfig::Delay(d) => assert_eq!(
                d.mode,
                DelayMode::Exponential { base_ms: 10, factor: 2.0, max_ms: 100 }
            ),
            other => panic!("unexpected config: {:?}", other),
        }
    }

    #[test]
    fn test_node_kind_from_str() {
        assert_eq!("errorHandler".parse::<NodeKind>().unwrap(), NodeKind::ErrorHandler);
        assert_eq!("loop".parse::<NodeKind>().unwrap(), NodeKind::Loop);
        assert!("bogus".parse::<NodeKind>().is_err());
    }
}
