use futures::future::BoxFuture;
use serde_json::Value;

use graphflow_core::context::{ContextUpdate, ExecutionContext};
use graphflow_core::error::Result;
use graphflow_core::expression::resolve_path;
use graphflow_core::graph::{NodeConfig, NodeDef, NodeKind};
use graphflow_core::template::render;
use graphflow_core::validation::ConfigError;

use crate::executor::{wrong_kind, NodeEnv, NodeExecutor};

/// Renders the final output and collects payload values.
pub struct EndExecutor;

impl NodeExecutor for EndExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::End
    }

    fn execute<'a>(
        &'a self,
        node: &'a NodeDef,
        ctx: &'a ExecutionContext,
        _env: &'a NodeEnv,
    ) -> BoxFuture<'a, Result<ContextUpdate>> {
        Box::pin(async move {
            let NodeConfig::End(cfg) = &node.config else {
                return Err(wrong_kind(node, NodeKind::End));
            };
            let scope = ctx.scope();
            let mut update = ContextUpdate::new();

            if let Some(template) = &cfg.output {
                let text = render(template, &scope);
                update.output = Some(Value::String(text.clone()));
                update.final_output = Some(text);
            }

            for key in &cfg.outputs {
                match resolve_path(&scope, key) {
                    Some(value) => {
                        update.payload.insert(key.clone(), value.clone());
                    }
                    None => {
                        update.payload.insert(key.clone(), Value::Null);
                        update.notes.push(format!("output '{}' is not set", key));
                    }
                }
            }
            Ok(update)
        })
    }

    fn validate_config(&self, node: &NodeDef) -> Vec<ConfigError> {
        let NodeConfig::End(cfg) = &node.config else {
            return vec![ConfigError::new("kind", "expected end config")];
        };
        cfg.outputs
            .iter()
            .filter(|k| k.trim().is_empty())
            .map(|_| ConfigError::new("outputs", "output keys must not be empty"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::test_support::context;
    use graphflow_core::graph::EndConfig;
    use serde_json::json;

    #[tokio::test]
    async fn test_renders_output_and_collects_payload() {
        let mut ctx = context(json!({"text": "Hi"}));
        ctx.variables.insert("m_output".into(), json!("Echo: Hi"));
        ctx.variables.insert("score".into(), json!(0.7));
        let node = NodeDef::new(
            "end",
            NodeConfig::End(EndConfig {
                output: Some("Result: {m_output}".into()),
                outputs: vec!["score".into(), "absent".into()],
            }),
        );
        let update = EndExecutor
            .execute(&node, &ctx, &NodeEnv::offline())
            .await
            .unwrap();
        assert_eq!(update.final_output.as_deref(), Some("Result: Echo: Hi"));
        assert_eq!(update.payload["score"], json!(0.7));
        assert_eq!(update.payload["absent"], Value::Null);
        assert_eq!(update.notes.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_end_is_a_no_op() {
        let ctx = context(json!({}));
        let node = NodeDef::new("end", NodeConfig::End(EndConfig::default()));
        let update = EndExecutor
            .execute(&node, &ctx, &NodeEnv::offline())
            .await
            .unwrap();
        assert!(update.final_output.is_none());
        assert!(update.payload.is_empty());
    }
}
