//! Per-execution state and the partial updates node executors return.
//!
//! Executors never mutate an `ExecutionContext` directly. They read it and
//! return a `ContextUpdate`; the interpreter merges the update, so every
//! mutation happens at one point in the traversal.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::execution::{LogEntry, LogLevel};
use crate::graph::VariableScope;
use crate::types::{ChatMessage, CorrelationId, ExecutionId, Usage};

/// Input keys tried, in order, when choosing the primary text input.
pub const PRIMARY_INPUT_KEYS: [&str; 4] = ["input", "text", "query", "message"];

/// How a loop left its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopExit {
    /// `max_iterations` was reached.
    Bound,
    /// The break condition evaluated true.
    Condition,
}

/// Iteration state of one loop node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopState {
    /// Whether the loop is currently iterating.
    pub active: bool,
    /// Body iterations started in the current (or last) activation.
    pub iteration: u32,
    #[serde(default)]
    pub exit: Option<LoopExit>,
}

impl LoopState {
    /// Iterations completed by the current activation; zero when re-entered fresh.
    pub fn completed(&self) -> u32 {
        if self.active {
            self.iteration
        } else {
            0
        }
    }
}

/// What a loop node decided on this visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopDecision {
    /// Run the body; `iteration` is the 1-based iteration about to start.
    Continue { iteration: u32 },
    Exit(LoopExit),
}

/// Partial context update returned by a node executor.
#[derive(Debug, Clone, Default)]
pub struct ContextUpdate {
    /// Messages appended to the history.
    pub append_messages: Vec<ChatMessage>,
    /// Replacement history (memory management).
    pub replace_messages: Option<Vec<ChatMessage>>,
    /// Workflow variable writes, applied in order.
    pub variables: Vec<(String, Value)>,
    /// Writes into the session, global or temporary scopes.
    pub scoped: Vec<(VariableScope, String, Value)>,
    /// Boolean recorded for a conditional node.
    pub condition: Option<bool>,
    pub loop_decision: Option<LoopDecision>,
    pub usage: Usage,
    /// Becomes `last_output` in the expression scope.
    pub output: Option<Value>,
    /// Rendered final output (end node).
    pub final_output: Option<String>,
    /// Values collected into the result payload (end node).
    pub payload: Map<String, Value>,
    /// Informational log lines attributed to the node.
    pub notes: Vec<String>,
}

impl ContextUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.push((key.into(), value));
        self
    }

    pub fn with_output(mut self, value: Value) -> Self {
        self.output = Some(value);
        self
    }

    pub fn with_message(mut self, message: ChatMessage) -> Self {
        self.append_messages.push(message);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }
}

/// Single mutable state container for one execution instance.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub correlation_id: CorrelationId,
    /// Request input, as supplied.
    pub inputs: Map<String, Value>,
    pub messages: Vec<ChatMessage>,
    /// Workflow-scoped variables. Last write wins.
    pub variables: Map<String, Value>,
    pub scoped: BTreeMap<VariableScope, Map<String, Value>>,
    pub loops: HashMap<String, LoopState>,
    /// Last error message per node.
    pub errors: HashMap<String, String>,
    pub conditions: HashMap<String, bool>,
    /// Visited node ids, append-only.
    pub history: Vec<String>,
    /// Visit count per node.
    pub visits: HashMap<String, u32>,
    /// Attempts spent on each node's latest handled failure, retries included.
    pub attempts: HashMap<String, u32>,
    pub usage: Usage,
    pub last_output: Option<Value>,
    pub final_output: Option<String>,
    pub payload: Map<String, Value>,
    pub log: Vec<LogEntry>,
}

impl ExecutionContext {
    pub fn new(
        execution_id: ExecutionId,
        correlation_id: CorrelationId,
        inputs: Map<String, Value>,
    ) -> Self {
        Self {
            execution_id,
            correlation_id,
            inputs,
            messages: Vec::new(),
            variables: Map::new(),
            scoped: BTreeMap::new(),
            loops: HashMap::new(),
            errors: HashMap::new(),
            conditions: HashMap::new(),
            history: Vec::new(),
            visits: HashMap::new(),
            attempts: HashMap::new(),
            usage: Usage::default(),
            last_output: None,
            final_output: None,
            payload: Map::new(),
            log: Vec::new(),
        }
    }

    /// Seed the session and global scopes.
    pub fn with_scopes(mut self, session: Map<String, Value>, global: Map<String, Value>) -> Self {
        self.scoped.insert(VariableScope::Session, session);
        self.scoped.insert(VariableScope::Global, global);
        self
    }

    /// The primary text input: the first string among the well-known keys,
    /// else the whole input map as JSON.
    pub fn primary_input(&self) -> String {
        primary_input(&self.inputs)
    }

    pub fn variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    /// Read a variable from the given scope.
    pub fn scoped_variable(&self, scope: VariableScope, key: &str) -> Option<&Value> {
        match scope {
            VariableScope::Workflow => self.variables.get(key),
            other => self.scoped.get(&other).and_then(|m| m.get(key)),
        }
    }

    pub fn loop_state(&self, node_id: &str) -> LoopState {
        self.loops.get(node_id).cloned().unwrap_or_default()
    }

    pub fn visit_count(&self, node_id: &str) -> u32 {
        self.visits.get(node_id).copied().unwrap_or(0)
    }

    /// Append a node to the execution history.
    pub fn record_visit(&mut self, node_id: &str) {
        self.history.push(node_id.to_string());
        *self.visits.entry(node_id.to_string()).or_insert(0) += 1;
    }

    /// Record how many attempts a node's current failure took.
    pub fn record_attempts(&mut self, node_id: &str, attempts: u32) {
        self.attempts.insert(node_id.to_string(), attempts);
    }

    /// Attempts behind the node's latest failure; a single attempt when none were recorded.
    pub fn attempts(&self, node_id: &str) -> u32 {
        self.attempts.get(node_id).copied().unwrap_or(1)
    }

    /// Record the last error raised by a node.
    pub fn record_error(&mut self, node_id: &str, message: impl Into<String>) {
        let message = message.into();
        self.log
            .push(LogEntry::new(LogLevel::Error, Some(node_id), message.clone()));
        self.errors.insert(node_id.to_string(), message);
    }

    pub fn log_info(&mut self, node_id: Option<&str>, message: impl Into<String>) {
        self.log.push(LogEntry::new(LogLevel::Info, node_id, message));
    }

    pub fn log_warn(&mut self, node_id: Option<&str>, message: impl Into<String>) {
        self.log.push(LogEntry::new(LogLevel::Warn, node_id, message));
    }

    /// Merge a node's partial update.
    pub fn apply(&mut self, node_id: &str, update: ContextUpdate) {
        if let Some(replacement) = update.replace_messages {
            self.messages = replacement;
        }
        self.messages.extend(update.append_messages);

        for (key, value) in update.variables {
            self.variables.insert(key, value);
        }
        for (scope, key, value) in update.scoped {
            match scope {
                VariableScope::Workflow => {
                    self.variables.insert(key, value);
                }
                other => {
                    self.scoped.entry(other).or_default().insert(key, value);
                }
            }
        }

        if let Some(result) = update.condition {
            self.conditions.insert(node_id.to_string(), result);
        }

        if let Some(decision) = update.loop_decision {
            let state = self.loops.entry(node_id.to_string()).or_default();
            match decision {
                LoopDecision::Continue { iteration } => {
                    state.active = true;
                    state.iteration = iteration;
                    state.exit = None;
                }
                LoopDecision::Exit(exit) => {
                    state.active = false;
                    state.exit = Some(exit);
                }
            }
        }

        self.usage.add(&update.usage);

        if let Some(output) = update.output {
            self.last_output = Some(output);
        }
        if let Some(text) = update.final_output {
            self.final_output = Some(text);
        }
        for (key, value) in update.payload {
            self.payload.insert(key, value);
        }
        for note in update.notes {
            self.log_info(Some(node_id), note);
        }
    }

    /// Snapshot the context as the object expressions and templates resolve against.
    pub fn scope(&self) -> Value {
        let mut scope = self.variables.clone();
        scope.insert("input".into(), Value::String(self.primary_input()));
        scope.insert("inputs".into(), Value::Object(self.inputs.clone()));
        scope.insert("conditions".into(), json!(self.conditions));
        let loops: Map<String, Value> = self
            .loops
            .iter()
            .map(|(id, state)| (id.clone(), json!(state.iteration)))
            .collect();
        scope.insert("loops".into(), Value::Object(loops));
        scope.insert("errors".into(), json!(self.errors));
        scope.insert(
            "last_output".into(),
            self.last_output.clone().unwrap_or(Value::Null),
        );
        for (scope_kind, values) in &self.scoped {
            let key = match scope_kind {
                VariableScope::Session => "session",
                VariableScope::Global => "global",
                VariableScope::Temporary => "temporary",
                VariableScope::Workflow => continue,
            };
            scope.insert(key.into(), Value::Object(values.clone()));
        }
        Value::Object(scope)
    }

    /// Scope for evaluating the outgoing edges of a conditional node.
    pub fn scope_with_result(&self, result: bool) -> Value {
        let mut scope = self.scope();
        if let Value::Object(map) = &mut scope {
            map.insert("result".into(), Value::Bool(result));
        }
        scope
    }

    /// Drop temporary-scoped variables; called once the run ends.
    pub fn clear_temporary(&mut self) {
        self.scoped.remove(&VariableScope::Temporary);
    }

    pub fn scope_values(&self, scope: VariableScope) -> Map<String, Value> {
        self.scoped.get(&scope).cloned().unwrap_or_default()
    }
}

/// The primary text of an input map.
pub fn primary_input(inputs: &Map<String, Value>) -> String {
    PRIMARY_INPUT_KEYS
        .iter()
        .find_map(|k| inputs.get(*k).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| {
            if inputs.is_empty() {
                String::new()
            } else {
                Value::Object(inputs.clone()).to_string()
            }
        })
}
