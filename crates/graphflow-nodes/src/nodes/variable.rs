use futures::future::BoxFuture;
use serde_json::{Map, Number, Value};
use tracing::debug;

use graphflow_core::context::{ContextUpdate, ExecutionContext};
use graphflow_core::error::{FlowError, Result};
use graphflow_core::graph::{NodeConfig, NodeDef, NodeKind, VariableConfig, VariableOp};
use graphflow_core::template::render_value;
use graphflow_core::validation::ConfigError;

use crate::executor::{wrong_kind, NodeEnv, NodeExecutor};

/// Reads and writes variables in one of the four scopes.
pub struct VariableExecutor;

impl NodeExecutor for VariableExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Variable
    }

    fn execute<'a>(
        &'a self,
        node: &'a NodeDef,
        ctx: &'a ExecutionContext,
        _env: &'a NodeEnv,
    ) -> BoxFuture<'a, Result<ContextUpdate>> {
        Box::pin(async move {
            let NodeConfig::Variable(cfg) = &node.config else {
                return Err(wrong_kind(node, NodeKind::Variable));
            };
            let current = ctx.scoped_variable(cfg.scope, &cfg.key).cloned();
            let operand = cfg
                .value
                .as_ref()
                .map(|v| render_value(v, &ctx.scope()));

            if cfg.operation == VariableOp::Get {
                let value = current.unwrap_or(Value::Null);
                return Ok(ContextUpdate::new()
                    .with_variable(node.output_key(), value.clone())
                    .with_output(value));
            }

            let next = apply_op(cfg, current, operand).map_err(|message| FlowError::Execution {
                node: node.id.clone(),
                message,
            })?;
            debug!(node_id = %node.id, key = %cfg.key, scope = ?cfg.scope, op = ?cfg.operation, "Variable written");

            let mut update = ContextUpdate::new().with_output(next.clone());
            update.scoped.push((cfg.scope, cfg.key.clone(), next));
            Ok(update)
        })
    }

    fn validate_config(&self, node: &NodeDef) -> Vec<ConfigError> {
        let NodeConfig::Variable(cfg) = &node.config else {
            return vec![ConfigError::new("kind", "expected variable config")];
        };
        let mut errors = Vec::new();
        if cfg.key.trim().is_empty() {
            errors.push(ConfigError::new("key", "key must not be empty"));
        }
        match cfg.operation {
            VariableOp::Set | VariableOp::Append | VariableOp::Merge if cfg.value.is_none() => {
                errors.push(ConfigError::new(
                    "value",
                    format!("{:?} requires a value", cfg.operation).to_lowercase(),
                ));
            }
            VariableOp::Increment | VariableOp::Decrement => {
                if cfg.value.as_ref().is_some_and(|v| !v.is_number()) {
                    errors.push(ConfigError::new("value", "step must be a number"));
                }
            }
            VariableOp::Merge => {
                if cfg.value.as_ref().is_some_and(|v| !v.is_object() && !v.is_string()) {
                    errors.push(ConfigError::new("value", "merge operand must be an object"));
                }
            }
            _ => {}
        }
        errors
    }
}

/// Compute the new value of a variable. Errors are plain messages; the caller
/// attaches the node.
fn apply_op(
    cfg: &VariableConfig,
    current: Option<Value>,
    operand: Option<Value>,
) -> std::result::Result<Value, String> {
    match cfg.operation {
        VariableOp::Set => Ok(operand.unwrap_or(Value::Null)),
        VariableOp::Get => Ok(current.unwrap_or(Value::Null)),
        VariableOp::Append => {
            let item = operand.unwrap_or(Value::Null);
            match current {
                None | Some(Value::Null) => Ok(Value::Array(vec![item])),
                Some(Value::Array(mut items)) => {
                    items.push(item);
                    Ok(Value::Array(items))
                }
                Some(Value::String(mut s)) => {
                    s.push_str(&graphflow_core::template::display(&item));
                    Ok(Value::String(s))
                }
                Some(other) => Err(format!("cannot append to {}", type_name(&other))),
            }
        }
        VariableOp::Increment | VariableOp::Decrement => {
            let step = operand.unwrap_or(Value::from(1));
            let sign = if cfg.operation == VariableOp::Increment { 1 } else { -1 };
            let base = current.unwrap_or(Value::from(0));
            step_number(&base, &step, sign)
        }
        VariableOp::Merge => {
            let patch = match operand {
                Some(Value::Object(map)) => map,
                Some(other) => return Err(format!("cannot merge {}", type_name(&other))),
                None => Map::new(),
            };
            match current {
                None | Some(Value::Null) => Ok(Value::Object(patch)),
                Some(Value::Object(mut map)) => {
                    map.extend(patch);
                    Ok(Value::Object(map))
                }
                Some(other) => Err(format!("cannot merge into {}", type_name(&other))),
            }
        }
    }
}

/// Integer arithmetic when both sides are integers, float otherwise.
fn step_number(base: &Value, step: &Value, sign: i64) -> std::result::Result<Value, String> {
    let (Value::Number(b), Value::Number(s)) = (base, step) else {
        return Err(format!(
            "cannot step {} by {}",
            type_name(base),
            type_name(step)
        ));
    };
    if let (Some(b), Some(s)) = (b.as_i64(), s.as_i64()) {
        return b
            .checked_add(sign * s)
            .map(Value::from)
            .ok_or_else(|| "integer overflow".to_string());
    }
    let result = b.as_f64().unwrap_or(0.0) + sign as f64 * s.as_f64().unwrap_or(0.0);
    Number::from_f64(result)
        .map(Value::Number)
        .ok_or_else(|| "result is not a finite number".to_string())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::test_support::context;
    use graphflow_core::graph::VariableScope;
    use serde_json::json;

    fn node(operation: VariableOp, key: &str, value: Option<Value>, scope: VariableScope) -> NodeDef {
        NodeDef::new(
            "v",
            NodeConfig::Variable(VariableConfig {
                operation,
                key: key.into(),
                value,
                scope,
                output_key: Some("read".into()),
            }),
        )
    }

    async fn run(node: &NodeDef, ctx: &mut ExecutionContext) -> Result<()> {
        let update = VariableExecutor
            .execute(node, ctx, &NodeEnv::offline())
            .await?;
        ctx.apply(&node.id, update);
        Ok(())
    }

    #[tokio::test]
    async fn test_set_renders_template_and_get_reads_back() {
        let mut ctx = context(json!({"text": "hello"}));
        run(
            &node(VariableOp::Set, "greeting", Some(json!("{input}!")), VariableScope::Session),
            &mut ctx,
        )
        .await
        .unwrap();
        assert_eq!(
            ctx.scoped_variable(VariableScope::Session, "greeting"),
            Some(&json!("hello!"))
        );
        run(&node(VariableOp::Get, "greeting", None, VariableScope::Session), &mut ctx)
            .await
            .unwrap();
        assert_eq!(ctx.variable("read"), Some(&json!("hello!")));
    }

    #[tokio::test]
    async fn test_counter_operations() {
        let mut ctx = context(json!({}));
        let inc = node(VariableOp::Increment, "n", None, VariableScope::Workflow);
        run(&inc, &mut ctx).await.unwrap();
        run(&inc, &mut ctx).await.unwrap();
        run(
            &node(VariableOp::Decrement, "n", Some(json!(0.5)), VariableScope::Workflow),
            &mut ctx,
        )
        .await
        .unwrap();
        assert_eq!(ctx.variable("n"), Some(&json!(1.5)));
    }

    #[tokio::test]
    async fn test_append_and_merge() {
        let mut ctx = context(json!({}));
        let append = node(VariableOp::Append, "items", Some(json!("a")), VariableScope::Temporary);
        run(&append, &mut ctx).await.unwrap();
        run(&append, &mut ctx).await.unwrap();
        assert_eq!(
            ctx.scoped_variable(VariableScope::Temporary, "items"),
            Some(&json!(["a", "a"]))
        );

        ctx.variables.insert("cfg".into(), json!({"a": 1, "b": 1}));
        run(
            &node(VariableOp::Merge, "cfg", Some(json!({"b": 2})), VariableScope::Workflow),
            &mut ctx,
        )
        .await
        .unwrap();
        assert_eq!(ctx.variable("cfg"), Some(&json!({"a": 1, "b": 2})));
    }

    #[tokio::test]
    async fn test_type_mismatch_fails_the_node() {
        let mut ctx = context(json!({}));
        ctx.variables.insert("flag".into(), json!(true));
        let err = run(&node(VariableOp::Increment, "flag", None, VariableScope::Workflow), &mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Execution { .. }));
    }

    #[test]
    fn test_validate_config() {
        let ok = node(VariableOp::Get, "k", None, VariableScope::Global);
        assert!(VariableExecutor.validate_config(&ok).is_empty());
        let bad = node(VariableOp::Set, "", None, VariableScope::Global);
        assert_eq!(VariableExecutor.validate_config(&bad).len(), 2);
    }
}
