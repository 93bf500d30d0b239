//! Graph traversal: dispatch, routing and error-handler policy.
//!
//! The interpreter is the only place an `ExecutionContext` is mutated. Each
//! step records the visit, runs the node's executor against a read-only
//! context, merges the returned update and checkpoints through the tracker.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use graphflow_core::context::{ContextUpdate, ExecutionContext};
use graphflow_core::error::{FlowError, Result};
use graphflow_core::expression::Expression;
use graphflow_core::graph::{
    ErrorHandlerConfig, ExhaustedAction, GraphDefinition, NodeConfig, NodeDef,
};
use graphflow_nodes::{NodeEnv, NodeRegistry};

use crate::assembler::Outcome;
use crate::retry::{backoff_delay, should_retry};
use crate::tracker::TrackedRun;

pub struct Interpreter<'a> {
    graph: &'a GraphDefinition,
    nodes: &'a NodeRegistry,
    env: &'a NodeEnv,
    max_steps: usize,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        graph: &'a GraphDefinition,
        nodes: &'a NodeRegistry,
        env: &'a NodeEnv,
        max_steps: usize,
    ) -> Self {
        Self {
            graph,
            nodes,
            env,
            max_steps,
        }
    }

    /// Walk the graph from its entry node until it finishes, fails or is cancelled.
    pub async fn run(&self, ctx: &mut ExecutionContext, run: &mut TrackedRun) -> Outcome {
        let Some(entry) = self.graph.entry_node_id() else {
            return Outcome::failed(None, "graph has no entry node");
        };
        let mut current = entry.to_string();
        let mut steps = 0usize;

        loop {
            if self.env.cancel.is_cancelled() {
                info!(execution_id = %ctx.execution_id, node_id = %current, "Cancellation observed");
                return Outcome::cancelled(Some(&current));
            }
            steps += 1;
            if steps > self.max_steps {
                warn!(execution_id = %ctx.execution_id, max_steps = self.max_steps, "Step limit reached");
                return Outcome::failed(
                    Some(&current),
                    format!("step limit of {} exceeded", self.max_steps),
                );
            }

            let Some(node) = self.graph.node(&current) else {
                return Outcome::failed(Some(&current), format!("node '{}' is not declared", current));
            };

            let next = match self.run_node(node, ctx, run).await {
                Ok(()) => self.route(node, ctx),
                Err(e) => self.recover(node, e, ctx, run).await,
            };

            match next {
                Ok(Some(id)) => current = id,
                Ok(None) => {
                    debug!(execution_id = %ctx.execution_id, node_id = %node.id, "Traversal finished");
                    return Outcome::completed();
                }
                Err(FlowError::Cancelled) => return Outcome::cancelled(Some(&node.id)),
                Err(e) => return Outcome::failed(Some(&node.id), describe(&node.id, &e)),
            }
        }
    }

    /// Visit, execute and merge one node.
    async fn run_node(
        &self,
        node: &NodeDef,
        ctx: &mut ExecutionContext,
        run: &mut TrackedRun,
    ) -> Result<()> {
        ctx.record_visit(&node.id);
        run.node_started(&node.id);

        let executor = self.nodes.get(node.kind()).ok_or_else(|| FlowError::Configuration {
            node: node.id.clone(),
            message: format!("no executor registered for {} nodes", node.kind()),
        })?;

        let started = Instant::now();
        let work = executor.execute(node, ctx, self.env);
        let update = tokio::select! {
            _ = self.env.cancel.cancelled() => Err(FlowError::Cancelled),
            result = with_timeout(node, work) => result,
        }?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        ctx.apply(&node.id, update);
        run.checkpoint(ctx, &node.id, elapsed_ms).await;
        Ok(())
    }

    /// Choose the successor of a node that just succeeded. `None` finishes the run.
    fn route(&self, node: &NodeDef, ctx: &mut ExecutionContext) -> Result<Option<String>> {
        match &node.config {
            NodeConfig::End(_) => Ok(None),
            NodeConfig::Conditional(cfg) => {
                let result = ctx.conditions.get(&node.id).copied().unwrap_or(false);
                let scope = ctx.scope_with_result(result);
                for edge in self.graph.outgoing(&node.id) {
                    if let Some(condition) = &edge.condition {
                        if Expression::parse(condition)?.evaluate(&scope) {
                            return Ok(Some(edge.target.clone()));
                        }
                    }
                }
                if let Some(default) = self.graph.outgoing(&node.id).find(|e| e.condition.is_none()) {
                    return Ok(Some(default.target.clone()));
                }
                if cfg.terminal_on_no_match {
                    ctx.log_info(Some(&node.id), "no branch matched; finishing");
                    return Ok(None);
                }
                Err(FlowError::Execution {
                    node: node.id.clone(),
                    message: "no outgoing edge matched".into(),
                })
            }
            NodeConfig::Loop(cfg) => {
                if ctx.loop_state(&node.id).active {
                    Ok(Some(cfg.body.clone()))
                } else {
                    Ok(self
                        .graph
                        .outgoing(&node.id)
                        .find(|e| e.target != cfg.body)
                        .map(|e| e.target.clone()))
                }
            }
            _ => Ok(self.graph.outgoing(&node.id).next().map(|e| e.target.clone())),
        }
    }

    /// Offer a node failure to its error handler, if it has one.
    async fn recover(
        &self,
        node: &NodeDef,
        err: FlowError,
        ctx: &mut ExecutionContext,
        run: &mut TrackedRun,
    ) -> Result<Option<String>> {
        self.note_failure(node, &err, ctx, run);
        if matches!(err, FlowError::Cancelled) {
            return Err(err);
        }
        let Some(handler) = self.graph.handler_for(&node.id) else {
            return Err(err);
        };
        let NodeConfig::ErrorHandler(cfg) = &handler.config else {
            return Err(err);
        };

        let mut err = err;
        let mut retries = 0u32;
        while should_retry(&err, retries, &cfg.retry) {
            retries += 1;
            let delay = backoff_delay(&cfg.retry, retries);
            run.retrying(&node.id, retries, delay.as_millis() as u64);
            info!(
                execution_id = %ctx.execution_id,
                node_id = %node.id,
                attempt = retries,
                delay_ms = delay.as_millis() as u64,
                "Retrying node"
            );
            tokio::select! {
                _ = self.env.cancel.cancelled() => return Err(FlowError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            match self.run_node(node, ctx, run).await {
                Ok(()) => return self.route(node, ctx),
                Err(e) => {
                    self.note_failure(node, &e, ctx, run);
                    if matches!(e, FlowError::Cancelled) {
                        return Err(e);
                    }
                    err = e;
                }
            }
        }

        ctx.record_attempts(&node.id, retries + 1);
        self.run_node(handler, ctx, run).await?;
        self.exhausted(node, handler, cfg, err, ctx)
    }

    fn exhausted(
        &self,
        node: &NodeDef,
        handler: &NodeDef,
        cfg: &ErrorHandlerConfig,
        err: FlowError,
        ctx: &mut ExecutionContext,
    ) -> Result<Option<String>> {
        match &cfg.on_exhausted {
            ExhaustedAction::Resume => {
                ctx.log_warn(Some(&node.id), "failure handled; resuming with the next node");
                self.route(node, ctx)
            }
            ExhaustedAction::Fallback => {
                ctx.log_warn(Some(&node.id), format!("failure handled; falling back via {}", handler.id));
                Ok(self
                    .graph
                    .outgoing(&handler.id)
                    .next()
                    .map(|e| e.target.clone()))
            }
            ExhaustedAction::Default { value } => {
                let update = ContextUpdate::new()
                    .with_variable(node.output_key(), value.clone())
                    .with_output(value.clone())
                    .with_note("failure handled; default value substituted");
                ctx.apply(&node.id, update);
                self.route(node, ctx)
            }
            ExhaustedAction::Terminate => Err(err),
        }
    }

    fn note_failure(
        &self,
        node: &NodeDef,
        err: &FlowError,
        ctx: &mut ExecutionContext,
        run: &TrackedRun,
    ) {
        let message = err.to_string();
        warn!(execution_id = %ctx.execution_id, node_id = %node.id, error = %message, "Node failed");
        ctx.record_error(&node.id, message.clone());
        run.node_failed(&node.id, &message);
    }
}

async fn with_timeout<T>(
    node: &NodeDef,
    work: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match node.timeout_ms {
        Some(ms) => tokio::time::timeout(Duration::from_millis(ms), work)
            .await
            .unwrap_or_else(|_| {
                Err(FlowError::Timeout {
                    node: node.id.clone(),
                    timeout_ms: ms,
                })
            }),
        None => work.await,
    }
}

/// The user-facing message for a failure, always naming the node.
fn describe(node_id: &str, err: &FlowError) -> String {
    match err {
        FlowError::Execution { .. } | FlowError::Timeout { .. } | FlowError::Configuration { .. } => {
            err.to_string()
        }
        other => FlowError::at_node(node_id, other).to_string(),
    }
}
