//! The engine façade: validate, track, interpret, assemble.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use graphflow_core::config::EngineConfig;
use graphflow_core::context::ExecutionContext;
use graphflow_core::error::Result;
use graphflow_core::event::EventBus;
use graphflow_core::execution::{ExecutionRecord, ExecutionRequest, ExecutionResult, ExecutionStatus};
use graphflow_core::graph::GraphDefinition;
use graphflow_core::security::CallerIdentity;
use graphflow_core::traits::{ExecutionStore, ModelClient};
use graphflow_core::types::{CorrelationId, ExecutionId};
use graphflow_core::validation::ValidationResult;
use graphflow_nodes::{NodeEnv, NodeRegistry, RetrieverRegistry, ToolRegistry};

use crate::assembler::{assemble, resolve_source};
use crate::interpreter::Interpreter;
use crate::metrics::ExecutionMetrics;
use crate::run_log::RunLogger;
use crate::store::InMemoryExecutionStore;
use crate::tracker::Tracker;
use crate::validator::Validator;

/// Runs workflow graphs. Shares only read-only collaborators between
/// executions; each `execute` call owns its own context.
pub struct GraphEngine {
    config: Arc<EngineConfig>,
    nodes: Arc<NodeRegistry>,
    env: NodeEnv,
    tracker: Tracker,
}

impl GraphEngine {
    pub fn new(
        config: EngineConfig,
        model: Arc<dyn ModelClient>,
        store: Arc<dyn ExecutionStore>,
    ) -> Self {
        let config = Arc::new(config);
        let bus = Arc::new(EventBus::new(config.engine.event_capacity));
        Self {
            nodes: Arc::new(NodeRegistry::with_defaults()),
            env: NodeEnv::new(model, config.clone()),
            tracker: Tracker::new(store, bus, Arc::new(ExecutionMetrics::new())),
            config,
        }
    }

    /// Engine with the offline echo model and an in-memory store.
    pub fn offline(config: EngineConfig) -> Self {
        Self::new(
            config,
            Arc::new(graphflow_nodes::EchoModel),
            Arc::new(InMemoryExecutionStore::new()),
        )
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.env = self.env.with_tools(tools);
        self
    }

    pub fn with_retrievers(mut self, retrievers: RetrieverRegistry) -> Self {
        self.env = self.env.with_retrievers(retrievers);
        self
    }

    pub fn with_nodes(mut self, nodes: NodeRegistry) -> Self {
        self.nodes = Arc::new(nodes);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        self.tracker.bus()
    }

    pub fn metrics(&self) -> &Arc<ExecutionMetrics> {
        self.tracker.metrics()
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        self.tracker.store()
    }

    fn validator(&self) -> Validator {
        Validator::new(
            self.config.clone(),
            self.nodes.clone(),
            self.env.tools.clone(),
            self.env.retrievers.clone(),
        )
    }

    /// Standalone validation. Counts the caller's recent executions for the rate check.
    pub async fn validate(&self, graph: &GraphDefinition, caller: &CallerIdentity) -> ValidationResult {
        let recent = self.recent_executions(caller).await;
        self.validator().validate(graph, caller, recent)
    }

    async fn recent_executions(&self, caller: &CallerIdentity) -> usize {
        let since = Utc::now() - chrono::Duration::minutes(1);
        match self.tracker.store().count_started_since(&caller.id, since).await {
            Ok(n) => n,
            Err(e) => {
                warn!(caller = %caller.id, error = %e, "Could not count recent executions");
                0
            }
        }
    }

    /// Validate and run `graph`.
    ///
    /// Returns `Err(Validation)` when any layer reports a blocking issue; no
    /// node runs in that case. Otherwise the run's own failure or
    /// cancellation is reported in the result's status and errors.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        graph: &GraphDefinition,
        caller: &CallerIdentity,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let report = self.validate(graph, caller).await;
        for issue in report.warnings() {
            warn!(graph = %graph.name, issue = %issue, "Validation warning");
        }
        if let Err(e) = report.into_error() {
            warn!(graph = %graph.name, caller = %caller.id, error = %e, "Graph rejected");
            return Err(e);
        }

        let execution_id = ExecutionId::new();
        let correlation_id = request
            .correlation_id
            .as_deref()
            .map(CorrelationId::from_string)
            .unwrap_or_default();

        let mut ctx = ExecutionContext::new(
            execution_id.clone(),
            correlation_id.clone(),
            request.input.clone(),
        )
        .with_scopes(request.session.clone(), request.global.clone());

        let (source_id, _) = resolve_source(graph, &request);
        let mut record = ExecutionRecord::new(
            execution_id.clone(),
            correlation_id,
            request.workflow_kind,
            source_id,
            Value::Object(request.input.clone()),
        );
        record.caller_id = Some(caller.id.clone());

        // Not tied to `cancel`: a cancelled run still logs its terminal event.
        let logger = self.config.log.enabled.then(|| {
            let stop = CancellationToken::new();
            let handle = RunLogger::new(self.config.log.resolved_dir(), self.config.log.level)
                .spawn(self.tracker.bus(), execution_id.clone(), stop.clone());
            (handle, stop)
        });

        let mut run = self.tracker.start(record).await;
        let env = self.env.with_cancel(cancel);
        let outcome = Interpreter::new(graph, &self.nodes, &env, self.config.engine.max_steps)
            .run(&mut ctx, &mut run)
            .await;
        ctx.clear_temporary();

        let result = assemble(&ctx, &request, graph, &outcome, run.elapsed_ms());
        match (outcome.status, &outcome.error) {
            (ExecutionStatus::Completed, _) => run.complete(&ctx, &result).await,
            (status, error) => {
                let error = error.as_deref().unwrap_or("execution failed");
                run.fail(&ctx, status, error).await
            }
        }

        if let Some((handle, stop)) = logger {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!(execution_id = %execution_id, "RunLogger did not finish in time");
            }
            stop.cancel();
        }

        info!(
            execution_id = %execution_id,
            status = %result.status,
            tokens = result.usage.tokens_used,
            "Execution finished"
        );
        Ok(result)
    }
}
