use std::collections::HashSet;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use graphflow_core::context::{ContextUpdate, ExecutionContext};
use graphflow_core::error::{FlowError, Result};
use graphflow_core::graph::{NodeConfig, NodeDef, NodeKind, ToolNodeConfig};
use graphflow_core::template::{display, render_value};
use graphflow_core::types::{ChatMessage, ToolContext, ToolResult};
use graphflow_core::validation::ConfigError;

use crate::executor::{cancellable, wrong_kind, NodeEnv, NodeExecutor};
use crate::registry::execute_tool;

/// Invokes one or more tools, sequentially or as a joined fan-out.
pub struct ToolExecutor;

/// A call resolved against the registry, ready to run.
struct PreparedCall {
    tool: String,
    output_key: String,
    input: Value,
}

impl NodeExecutor for ToolExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Tool
    }

    fn execute<'a>(
        &'a self,
        node: &'a NodeDef,
        ctx: &'a ExecutionContext,
        env: &'a NodeEnv,
    ) -> BoxFuture<'a, Result<ContextUpdate>> {
        Box::pin(async move {
            let NodeConfig::Tool(cfg) = &node.config else {
                return Err(wrong_kind(node, NodeKind::Tool));
            };
            let scope = ctx.scope();
            let calls: Vec<PreparedCall> = cfg
                .calls
                .iter()
                .map(|c| PreparedCall {
                    tool: c.tool.clone(),
                    output_key: c.resolved_output_key(&node.id),
                    input: render_value(&c.input, &scope),
                })
                .collect();

            let tool_ctx = ToolContext {
                execution_id: ctx.execution_id.clone(),
                correlation_id: ctx.correlation_id.clone(),
                node_id: node.id.clone(),
                cancel: env.cancel.clone(),
            };

            let results = if cfg.parallel && calls.len() > 1 {
                if env.config.platform.parallel_tools {
                    run_parallel(&calls, env, &tool_ctx).await
                } else {
                    warn!(node_id = %node.id, "Parallel tools unsupported, running sequentially");
                    run_sequential(&calls, env, &tool_ctx).await
                }
            } else {
                run_sequential(&calls, env, &tool_ctx).await
            };

            merge(node, calls, results)
        })
    }

    fn validate_config(&self, node: &NodeDef) -> Vec<ConfigError> {
        let NodeConfig::Tool(cfg) = &node.config else {
            return vec![ConfigError::new("kind", "expected tool config")];
        };
        validate_calls(node, cfg)
    }
}

fn validate_calls(node: &NodeDef, cfg: &ToolNodeConfig) -> Vec<ConfigError> {
    let mut errors = Vec::new();
    if cfg.calls.is_empty() {
        errors.push(ConfigError::new("calls", "at least one tool call is required"));
    }
    let mut keys = HashSet::new();
    for (i, call) in cfg.calls.iter().enumerate() {
        if call.tool.trim().is_empty() {
            errors.push(ConfigError::new(
                &format!("calls[{}].tool", i),
                "tool name must not be empty",
            ));
        }
        let key = call.resolved_output_key(&node.id);
        if !keys.insert(key.clone()) {
            errors.push(ConfigError::new(
                &format!("calls[{}].output_key", i),
                format!("output key '{}' is written by more than one call", key),
            ));
        }
    }
    errors
}

async fn run_sequential(
    calls: &[PreparedCall],
    env: &NodeEnv,
    tool_ctx: &ToolContext,
) -> Vec<Result<ToolResult>> {
    let mut results = Vec::with_capacity(calls.len());
    for call in calls {
        let result = match env.tools.get(&call.tool) {
            Some(tool) => {
                cancellable(
                    &env.cancel,
                    execute_tool(tool, call.input.clone(), tool_ctx.clone()),
                )
                .await
            }
            None => Err(FlowError::ToolNotFound(call.tool.clone())),
        };
        let failed = result.is_err();
        results.push(result);
        // A failed call ends a sequential run; later calls never start.
        if failed {
            break;
        }
    }
    results
}

/// Spawn every call, then join. Results come back in declared order.
async fn run_parallel(
    calls: &[PreparedCall],
    env: &NodeEnv,
    tool_ctx: &ToolContext,
) -> Vec<Result<ToolResult>> {
    let permits = Arc::new(Semaphore::new(env.config.platform.max_parallel_tools.max(1)));
    let handles: Vec<_> = calls
        .iter()
        .map(|call| {
            let tool = env.tools.get(&call.tool);
            let name = call.tool.clone();
            let input = call.input.clone();
            let ctx = tool_ctx.clone();
            let cancel = env.cancel.clone();
            let permits = permits.clone();
            tokio::spawn(async move {
                let Some(tool) = tool else {
                    return Err(FlowError::ToolNotFound(name));
                };
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| FlowError::ToolExecution {
                        tool: name.clone(),
                        message: e.to_string(),
                    })?;
                cancellable(&cancel, execute_tool(tool, input, ctx)).await
            })
        })
        .collect();

    join_all(handles)
        .await
        .into_iter()
        .zip(calls)
        .map(|(joined, call)| {
            joined.unwrap_or_else(|e| {
                Err(FlowError::ToolExecution {
                    tool: call.tool.clone(),
                    message: format!("task failed: {}", e),
                })
            })
        })
        .collect()
}

/// Apply results in declared order. The first failure (in that order) fails the node.
fn merge(
    node: &NodeDef,
    calls: Vec<PreparedCall>,
    results: Vec<Result<ToolResult>>,
) -> Result<ContextUpdate> {
    let mut update = ContextUpdate::new();
    let mut outputs = Vec::with_capacity(calls.len());

    for (call, result) in calls.into_iter().zip(results) {
        let result = result?;
        if result.is_error {
            return Err(FlowError::ToolExecution {
                tool: call.tool,
                message: display(&result.content),
            });
        }
        debug!(node_id = %node.id, tool = %call.tool, key = %call.output_key, "Tool call merged");
        update.append_messages.push(
            ChatMessage::tool_result(call.tool.clone(), result.content.clone(), false)
                .from_node(&node.id),
        );
        outputs.push(json!({"tool": call.tool, "key": call.output_key, "value": result.content}));
        update.variables.push((call.output_key, result.content));
    }

    update.output = Some(Value::Array(outputs));
    Ok(update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::test_support::context;
    use crate::registry::ToolRegistry;
    use graphflow_core::graph::ToolCallConfig;
    use graphflow_test_utils::{CountingTool, FailingTool, SlowTool};
    use std::time::Duration;

    fn node(calls: Vec<ToolCallConfig>, parallel: bool) -> NodeDef {
        NodeDef::new("t", NodeConfig::Tool(ToolNodeConfig { calls, parallel }))
    }

    fn env_with(tools: ToolRegistry) -> NodeEnv {
        NodeEnv::offline().with_tools(tools)
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_results_merge_in_declared_order() {
        let mut tools = ToolRegistry::new();
        tools.register(SlowTool::new("slow", Duration::from_millis(200), json!("slow-done")));
        tools.register(SlowTool::new("fast", Duration::from_millis(10), json!("fast-done")));
        let n = node(
            vec![
                ToolCallConfig::new("slow", json!({})),
                ToolCallConfig::new("fast", json!({})),
            ],
            true,
        );
        let update = ToolExecutor
            .execute(&n, &context(json!({})), &env_with(tools))
            .await
            .unwrap();
        let keys: Vec<&str> = update.variables.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["t.slow", "t.fast"]);
        assert_eq!(update.variables[0].1, json!("slow-done"));
        assert_eq!(update.variables[1].1, json!("fast-done"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_calls_overlap() {
        let mut tools = ToolRegistry::new();
        tools.register(SlowTool::new("a", Duration::from_millis(100), json!(1)));
        tools.register(SlowTool::new("b", Duration::from_millis(100), json!(2)));
        let n = node(
            vec![
                ToolCallConfig::new("a", json!({})),
                ToolCallConfig::new("b", json!({})),
            ],
            true,
        );
        let started = tokio::time::Instant::now();
        ToolExecutor
            .execute(&n, &context(json!({})), &env_with(tools))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_inputs_are_rendered() {
        let mut ctx = context(json!({"text": "hi"}));
        ctx.variables.insert("doc".into(), json!({"a": [1, 2]}));
        let mut call = ToolCallConfig::new("echo", json!({"msg": "say {input}", "data": "{doc}"}));
        call.output_key = Some("echoed".into());
        let update = ToolExecutor
            .execute(&node(vec![call], false), &ctx, &NodeEnv::offline())
            .await
            .unwrap();
        assert_eq!(
            update.variables[0],
            ("echoed".to_string(), json!({"msg": "say hi", "data": {"a": [1, 2]}}))
        );
    }

    #[tokio::test]
    async fn test_sequential_failure_stops_later_calls() {
        let counter = CountingTool::new("count");
        let calls = counter.calls();
        let mut tools = ToolRegistry::new();
        tools.register(FailingTool::new("bad", "exploded"));
        tools.register(counter);
        let n = node(
            vec![
                ToolCallConfig::new("bad", json!({})),
                ToolCallConfig::new("count", json!({})),
            ],
            false,
        );
        let err = ToolExecutor
            .execute(&n, &context(json!({})), &env_with(tools))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exploded"));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_tool_fails() {
        let n = node(vec![ToolCallConfig::new("missing", json!({}))], false);
        let err = ToolExecutor
            .execute(&n, &context(json!({})), &NodeEnv::offline())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::ToolNotFound(_)));
    }

    #[test]
    fn test_validate_config_rejects_shared_output_keys() {
        let n = node(
            vec![
                ToolCallConfig::new("echo", json!({})),
                ToolCallConfig::new("echo", json!({})),
            ],
            true,
        );
        let errors = ToolExecutor.validate_config(&n);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("t.echo"));
        assert_eq!(ToolExecutor.validate_config(&node(vec![], false)).len(), 1);
    }
}
