use futures::future::BoxFuture;
use serde_json::Value;

use graphflow_core::context::{ContextUpdate, ExecutionContext};
use graphflow_core::error::{FlowError, Result};
use graphflow_core::graph::{NodeConfig, NodeDef, NodeKind};
use graphflow_core::validation::ConfigError;

use crate::executor::{wrong_kind, NodeEnv, NodeExecutor};

/// Seeds workflow variables from the request input.
pub struct StartExecutor;

impl NodeExecutor for StartExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Start
    }

    fn execute<'a>(
        &'a self,
        node: &'a NodeDef,
        ctx: &'a ExecutionContext,
        _env: &'a NodeEnv,
    ) -> BoxFuture<'a, Result<ContextUpdate>> {
        Box::pin(async move {
            let NodeConfig::Start(cfg) = &node.config else {
                return Err(wrong_kind(node, NodeKind::Start));
            };

            let missing: Vec<&str> = cfg
                .required
                .iter()
                .filter(|k| !ctx.inputs.contains_key(*k) && !cfg.defaults.contains_key(*k))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(FlowError::Execution {
                    node: node.id.clone(),
                    message: format!("missing required input: {}", missing.join(", ")),
                });
            }

            let mut update = ContextUpdate::new();
            for (key, value) in &cfg.defaults {
                if !ctx.inputs.contains_key(key) {
                    update.variables.push((key.clone(), value.clone()));
                }
            }
            for (key, value) in &ctx.inputs {
                update.variables.push((key.clone(), value.clone()));
            }
            update.output = Some(Value::String(ctx.primary_input()));
            Ok(update)
        })
    }

    fn validate_config(&self, node: &NodeDef) -> Vec<ConfigError> {
        let NodeConfig::Start(cfg) = &node.config else {
            return vec![ConfigError::new("kind", "expected start config")];
        };
        cfg.required
            .iter()
            .filter(|k| k.trim().is_empty())
            .map(|_| ConfigError::new("required", "input keys must not be empty"))
            .collect()
    }
}
