//! Bounded loop control.
//!
//! A loop node is visited once when the flow enters it and once more after
//! every body iteration (via the back-edge). Each visit decides whether to
//! run the body again. The bound is checked before the break condition, so a
//! loop with `max_iterations = n` and a condition that never holds runs the
//! body exactly `n` times and exits via the bound.

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use graphflow_core::context::{ContextUpdate, ExecutionContext, LoopDecision, LoopExit};
use graphflow_core::error::Result;
use graphflow_core::expression::Expression;
use graphflow_core::graph::{NodeConfig, NodeDef, NodeKind};
use graphflow_core::validation::ConfigError;

use crate::executor::{wrong_kind, NodeEnv, NodeExecutor};

pub struct LoopExecutor;

impl NodeExecutor for LoopExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Loop
    }

    fn execute<'a>(
        &'a self,
        node: &'a NodeDef,
        ctx: &'a ExecutionContext,
        _env: &'a NodeEnv,
    ) -> BoxFuture<'a, Result<ContextUpdate>> {
        Box::pin(async move {
            let NodeConfig::Loop(cfg) = &node.config else {
                return Err(wrong_kind(node, NodeKind::Loop));
            };
            let completed = ctx.loop_state(&node.id).completed();

            let decision = if completed >= cfg.max_iterations {
                LoopDecision::Exit(LoopExit::Bound)
            } else if break_requested(&node.id, cfg.break_condition.as_deref(), completed, ctx)? {
                LoopDecision::Exit(LoopExit::Condition)
            } else {
                LoopDecision::Continue {
                    iteration: completed + 1,
                }
            };

            debug!(node_id = %node.id, completed, max = cfg.max_iterations, ?decision, "Loop decision");

            let output = match decision {
                LoopDecision::Continue { iteration } => json!({"iteration": iteration, "exit": null}),
                LoopDecision::Exit(exit) => json!({"iteration": completed, "exit": exit}),
            };
            let mut update = ContextUpdate {
                loop_decision: Some(decision),
                output: Some(output),
                ..Default::default()
            };
            if let LoopDecision::Exit(exit) = decision {
                update.notes.push(format!(
                    "loop exited after {} iteration(s) ({})",
                    completed,
                    match exit {
                        LoopExit::Bound => "bound",
                        LoopExit::Condition => "condition",
                    }
                ));
            }
            Ok(update)
        })
    }

    fn validate_config(&self, node: &NodeDef) -> Vec<ConfigError> {
        let NodeConfig::Loop(cfg) = &node.config else {
            return vec![ConfigError::new("kind", "expected loop config")];
        };
        let mut errors = Vec::new();
        if cfg.max_iterations == 0 {
            errors.push(ConfigError::new("max_iterations", "must be at least 1"));
        }
        if cfg.body.trim().is_empty() {
            errors.push(ConfigError::new("body", "body node must be named"));
        }
        if let Some(cond) = &cfg.break_condition {
            if let Err(e) = Expression::parse(cond) {
                errors.push(ConfigError::new("break_condition", e.to_string()));
            }
        }
        errors
    }
}

/// Evaluate the break condition with `loops.<id>` set to the completed count,
/// so a fresh activation sees zero rather than the previous activation's total.
fn break_requested(
    node_id: &str,
    condition: Option<&str>,
    completed: u32,
    ctx: &ExecutionContext,
) -> Result<bool> {
    let Some(condition) = condition else {
        return Ok(false);
    };
    let expr = Expression::parse(condition)?;
    let mut scope = ctx.scope();
    if let Some(Value::Object(loops)) = scope.get_mut("loops") {
        loops.insert(node_id.to_string(), json!(completed));
    }
    Ok(expr.evaluate(&scope))
}
