use futures::future::BoxFuture;
use serde_json::json;
use tracing::info;

use graphflow_core::context::{ContextUpdate, ExecutionContext};
use graphflow_core::error::{FlowError, Result};
use graphflow_core::graph::{ErrorHandlerConfig, NodeConfig, NodeDef, NodeKind};
use graphflow_core::validation::ConfigError;

use crate::executor::{wrong_kind, NodeEnv, NodeExecutor};

/// Variable the handler writes the caught failure to.
pub const ERROR_VARIABLE: &str = "error";

/// Runs once the interpreter has exhausted a handler's retries. It exposes
/// the caught failure to the rest of the graph; the interpreter then applies
/// the configured exhausted action.
pub struct ErrorHandlerExecutor;

impl NodeExecutor for ErrorHandlerExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::ErrorHandler
    }

    fn execute<'a>(
        &'a self,
        node: &'a NodeDef,
        ctx: &'a ExecutionContext,
        _env: &'a NodeEnv,
    ) -> BoxFuture<'a, Result<ContextUpdate>> {
        Box::pin(async move {
            let NodeConfig::ErrorHandler(cfg) = &node.config else {
                return Err(wrong_kind(node, NodeKind::ErrorHandler));
            };
            let (failed, message) = caught_failure(cfg, ctx).ok_or_else(|| FlowError::Execution {
                node: node.id.clone(),
                message: "no failure recorded for any protected node".into(),
            })?;
            let attempts = ctx.attempts(failed);
            info!(
                node_id = %node.id,
                failed_node = %failed,
                attempts,
                "Error handler engaged"
            );

            let error = json!({
                "node": failed,
                "message": message,
                "attempts": attempts,
            });
            Ok(ContextUpdate::new()
                .with_variable(ERROR_VARIABLE, error.clone())
                .with_output(error)
                .with_note(format!("caught failure of {}: {}", failed, message)))
        })
    }

    fn validate_config(&self, node: &NodeDef) -> Vec<ConfigError> {
        let NodeConfig::ErrorHandler(cfg) = &node.config else {
            return vec![ConfigError::new("kind", "expected error handler config")];
        };
        let mut errors = Vec::new();
        if cfg.protects.is_empty() {
            errors.push(ConfigError::new("protects", "at least one protected node is required"));
        }
        if cfg.protects.iter().any(|p| p == &node.id) {
            errors.push(ConfigError::new("protects", "a handler cannot protect itself"));
        }
        if cfg.retry.max_delay_ms < cfg.retry.initial_delay_ms {
            errors.push(ConfigError::new(
                "retry.max_delay_ms",
                "must be at least initial_delay_ms",
            ));
        }
        errors
    }
}

/// The most recently visited protected node that has a recorded error.
fn caught_failure<'c>(
    cfg: &ErrorHandlerConfig,
    ctx: &'c ExecutionContext,
) -> Option<(&'c str, &'c str)> {
    ctx.history.iter().rev().find_map(|id| {
        if !cfg.protects.contains(id) {
            return None;
        }
        ctx.errors
            .get(id)
            .map(|message| (id.as_str(), message.as_str()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::test_support::context;
    use graphflow_core::graph::{ExhaustedAction, RetryPolicy};

    fn node(protects: &[&str]) -> NodeDef {
        NodeDef::new(
            "handler",
            NodeConfig::ErrorHandler(ErrorHandlerConfig {
                protects: protects.iter().map(|s| s.to_string()).collect(),
                retry: RetryPolicy::default(),
                on_exhausted: ExhaustedAction::Fallback,
            }),
        )
    }

    #[tokio::test]
    async fn test_exposes_latest_protected_failure() {
        let mut ctx = context(json!({}));
        ctx.record_visit("fetch");
        ctx.record_error("fetch", "connection reset");
        ctx.record_visit("fetch");
        ctx.record_error("fetch", "503");
        ctx.record_attempts("fetch", 2);
        ctx.record_visit("other");
        ctx.record_error("other", "unrelated");

        let update = ErrorHandlerExecutor
            .execute(&node(&["fetch"]), &ctx, &NodeEnv::offline())
            .await
            .unwrap();
        let (key, error) = &update.variables[0];
        assert_eq!(key, ERROR_VARIABLE);
        assert_eq!(error["node"], "fetch");
        assert_eq!(error["message"], "503");
        assert_eq!(error["attempts"], 2);
    }

    #[tokio::test]
    async fn test_attempts_ignore_earlier_successful_visits() {
        let mut ctx = context(json!({}));
        for _ in 0..3 {
            ctx.record_visit("fetch");
        }
        ctx.record_error("fetch", "timeout");

        let update = ErrorHandlerExecutor
            .execute(&node(&["fetch"]), &ctx, &NodeEnv::offline())
            .await
            .unwrap();
        assert_eq!(update.variables[0].1["attempts"], 1);
    }

    #[tokio::test]
    async fn test_without_failure_is_an_error() {
        let err = ErrorHandlerExecutor
            .execute(&node(&["fetch"]), &context(json!({})), &NodeEnv::offline())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Execution { .. }));
    }

    #[test]
    fn test_validate_config() {
        assert!(ErrorHandlerExecutor.validate_config(&node(&["a"])).is_empty());
        let mut bad = node(&[]);
        if let NodeConfig::ErrorHandler(cfg) = &mut bad.config {
            cfg.retry.initial_delay_ms = 500;
            cfg.retry.max_delay_ms = 100;
        }
        assert_eq!(ErrorHandlerExecutor.validate_config(&bad).len(), 2);
        assert_eq!(ErrorHandlerExecutor.validate_config(&node(&["handler"])).len(), 1);
    }
}
