use std::collections::HashMap;
use std::sync::Arc;

use graphflow_core::error::{FlowError, Result};
use graphflow_core::traits::{Retriever, Tool};
use graphflow_core::types::{ToolContext, ToolDefinition, ToolResult};

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    /// Register a shared tool.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List all registered tools, sorted by name.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Execute a tool by name, bounded by the tool's own timeout.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| FlowError::ToolNotFound(name.to_string()))?;
        execute_tool(tool, input, ctx).await
    }

    /// Create a registry with all built-in tools registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::echo::EchoTool);
        registry.register(crate::builtin::data::JsonQueryTool);
        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one tool under its timeout. Owns its arguments so it can be spawned.
pub async fn execute_tool(
    tool: Arc<dyn Tool>,
    input: serde_json::Value,
    ctx: ToolContext,
) -> Result<ToolResult> {
    let timeout = std::time::Duration::from_secs(tool.timeout_secs());

    match tokio::time::timeout(timeout, tool.execute(input, ctx)).await {
        Ok(result) => result,
        Err(_) => Err(FlowError::ToolTimeout {
            tool: tool.name().to_string(),
            timeout_secs: tool.timeout_secs(),
        }),
    }
}

/// Retrievers keyed by index name.
#[derive(Default, Clone)]
pub struct RetrieverRegistry {
    indexes: HashMap<String, Arc<dyn Retriever>>,
}

impl RetrieverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, index: impl Into<String>, retriever: Arc<dyn Retriever>) {
        self.indexes.insert(index.into(), retriever);
    }

    pub fn get(&self, index: &str) -> Option<Arc<dyn Retriever>> {
        self.indexes.get(index).cloned()
    }

    pub fn contains(&self, index: &str) -> bool {
        self.indexes.contains_key(index)
    }

    pub fn indexes(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.indexes.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}
