use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use graphflow_core::context::{ContextUpdate, ExecutionContext};
use graphflow_core::error::Result;
use graphflow_core::expression::Expression;
use graphflow_core::graph::{NodeConfig, NodeDef, NodeKind};
use graphflow_core::validation::ConfigError;

use crate::executor::{wrong_kind, NodeEnv, NodeExecutor};

/// Evaluates a boolean expression. Records the result and nothing else.
pub struct ConditionalExecutor;

impl NodeExecutor for ConditionalExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Conditional
    }

    fn execute<'a>(
        &'a self,
        node: &'a NodeDef,
        ctx: &'a ExecutionContext,
        _env: &'a NodeEnv,
    ) -> BoxFuture<'a, Result<ContextUpdate>> {
        Box::pin(async move {
            let NodeConfig::Conditional(cfg) = &node.config else {
                return Err(wrong_kind(node, NodeKind::Conditional));
            };
            let expr = Expression::parse(&cfg.condition)?;
            let result = expr.evaluate(&ctx.scope());
            debug!(node_id = %node.id, condition = %cfg.condition, result, "Condition evaluated");

            Ok(ContextUpdate {
                condition: Some(result),
                output: Some(Value::Bool(result)),
                ..Default::default()
            })
        })
    }

    fn validate_config(&self, node: &NodeDef) -> Vec<ConfigError> {
        let NodeConfig::Conditional(cfg) = &node.config else {
            return vec![ConfigError::new("kind", "expected conditional config")];
        };
        match Expression::parse(&cfg.condition) {
            Ok(_) => Vec::new(),
            Err(e) => vec![ConfigError::new("condition", e.to_string())],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::test_support::context;
    use graphflow_core::graph::ConditionalConfig;
    use serde_json::json;

    fn node(condition: &str) -> NodeDef {
        NodeDef::new(
            "check",
            NodeConfig::Conditional(ConditionalConfig {
                condition: condition.into(),
                terminal_on_no_match: false,
            }),
        )
    }

    #[tokio::test]
    async fn test_records_result_only() {
        let mut ctx = context(json!({"text": "urgent: server down"}));
        ctx.variables.insert("score".into(), json!(0.4));
        let update = ConditionalExecutor
            .execute(&node("score > 0.5 || input contains 'urgent'"), &ctx, &NodeEnv::offline())
            .await
            .unwrap();
        assert_eq!(update.condition, Some(true));
        assert!(update.variables.is_empty());
        assert!(update.append_messages.is_empty());
    }

    #[tokio::test]
    async fn test_false_condition() {
        let update = ConditionalExecutor
            .execute(&node("missing == 1"), &context(json!({})), &NodeEnv::offline())
            .await
            .unwrap();
        assert_eq!(update.condition, Some(false));
        assert_eq!(update.output, Some(json!(false)));
    }

    #[test]
    fn test_validate_rejects_unparseable() {
        assert!(ConditionalExecutor.validate_config(&node("a == 1")).is_empty());
        assert_eq!(ConditionalExecutor.validate_config(&node("a == ")).len(), 1);
    }
}
