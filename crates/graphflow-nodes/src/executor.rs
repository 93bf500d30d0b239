use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use graphflow_core::config::EngineConfig;
use graphflow_core::context::{ContextUpdate, ExecutionContext};
use graphflow_core::error::{FlowError, Result};
use graphflow_core::graph::{NodeDef, NodeKind};
use graphflow_core::traits::ModelClient;
use graphflow_core::validation::ConfigError;

use crate::registry::{RetrieverRegistry, ToolRegistry};
use crate::transport::EchoModel;

/// Collaborators available to executors for one execution.
///
/// Everything but the cancellation token is shared read-only across
/// executions; cloning is cheap.
#[derive(Clone)]
pub struct NodeEnv {
    pub model: Arc<dyn ModelClient>,
    pub tools: Arc<ToolRegistry>,
    pub retrievers: Arc<RetrieverRegistry>,
    pub config: Arc<EngineConfig>,
    pub cancel: CancellationToken,
}

impl NodeEnv {
    pub fn new(model: Arc<dyn ModelClient>, config: Arc<EngineConfig>) -> Self {
        Self {
            model,
            tools: Arc::new(ToolRegistry::with_builtins()),
            retrievers: Arc::new(RetrieverRegistry::new()),
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Offline environment: echo model, built-in tools, no indexes.
    pub fn offline() -> Self {
        Self::new(Arc::new(EchoModel), Arc::new(EngineConfig::default()))
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Arc::new(tools);
        self
    }

    pub fn with_retrievers(mut self, retrievers: RetrieverRegistry) -> Self {
        self.retrievers = Arc::new(retrievers);
        self
    }

    /// Same collaborators, different cancellation token.
    pub fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }
}

/// Polymorphic handler for one node kind.
pub trait NodeExecutor: Send + Sync + 'static {
    fn kind(&self) -> NodeKind;

    /// Run the node against a read-only context and return the update to merge.
    fn execute<'a>(
        &'a self,
        node: &'a NodeDef,
        ctx: &'a ExecutionContext,
        env: &'a NodeEnv,
    ) -> BoxFuture<'a, Result<ContextUpdate>>;

    /// Check the node's config. An empty list means the config is valid.
    fn validate_config(&self, node: &NodeDef) -> Vec<ConfigError>;
}

/// Executors keyed by node kind.
pub struct NodeRegistry {
    executors: HashMap<NodeKind, Arc<dyn NodeExecutor>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    pub fn register(&mut self, executor: impl NodeExecutor) {
        self.executors.insert(executor.kind(), Arc::new(executor));
    }

    pub fn unregister(&mut self, kind: NodeKind) -> bool {
        self.executors.remove(&kind).is_some()
    }

    pub fn get(&self, kind: NodeKind) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(&kind).cloned()
    }

    pub fn supports(&self, kind: NodeKind) -> bool {
        self.executors.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<NodeKind> {
        let mut kinds: Vec<NodeKind> = self.executors.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Registry with one executor per node kind.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(crate::nodes::start::StartExecutor);
        registry.register(crate::nodes::end::EndExecutor);
        registry.register(crate::nodes::model::ModelExecutor);
        registry.register(crate::nodes::tool::ToolExecutor);
        registry.register(crate::nodes::memory::MemoryExecutor);
        registry.register(crate::nodes::retrieval::RetrievalExecutor);
        registry.register(crate::nodes::conditional::ConditionalExecutor);
        registry.register(crate::nodes::loop_node::LoopExecutor);
        registry.register(crate::nodes::variable::VariableExecutor);
        registry.register(crate::nodes::error_handler::ErrorHandlerExecutor);
        registry.register(crate::nodes::delay::DelayExecutor);
        registry
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Error for an executor handed a node of another kind.
pub(crate) fn wrong_kind(node: &NodeDef, expected: NodeKind) -> FlowError {
    FlowError::Configuration {
        node: node.id.clone(),
        message: format!("expected {} config, got {}", expected, node.kind()),
    }
}

/// Wait for `fut`, aborting early when the execution is cancelled.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(FlowError::Cancelled),
        result = fut => result,
    }
}
