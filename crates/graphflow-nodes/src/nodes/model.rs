use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use graphflow_core::context::{ContextUpdate, ExecutionContext};
use graphflow_core::error::Result;
use graphflow_core::graph::{NodeConfig, NodeDef, NodeKind};
use graphflow_core::template::render;
use graphflow_core::traits::ModelRequest;
use graphflow_core::types::ChatMessage;
use graphflow_core::validation::ConfigError;

use crate::executor::{cancellable, wrong_kind, NodeEnv, NodeExecutor};

/// Invokes the model with a rendered prompt and records the reply.
pub struct ModelExecutor;

impl NodeExecutor for ModelExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Model
    }

    fn execute<'a>(
        &'a self,
        node: &'a NodeDef,
        ctx: &'a ExecutionContext,
        env: &'a NodeEnv,
    ) -> BoxFuture<'a, Result<ContextUpdate>> {
        Box::pin(async move {
            let NodeConfig::Model(cfg) = &node.config else {
                return Err(wrong_kind(node, NodeKind::Model));
            };
            let scope = ctx.scope();
            let prompt = render(&cfg.prompt, &scope);
            let system = cfg.system_prompt.as_deref().map(|s| render(s, &scope));
            let model = cfg
                .model
                .clone()
                .unwrap_or_else(|| env.config.engine.default_model.clone());

            let prompt_msg = ChatMessage::user(prompt).from_node(&node.id);
            let mut messages = if cfg.include_history {
                ctx.messages.clone()
            } else {
                Vec::new()
            };
            messages.push(prompt_msg.clone());

            let request = ModelRequest {
                model: model.clone(),
                system,
                messages,
                temperature: cfg.temperature,
                max_tokens: cfg.max_tokens,
            };
            let response = cancellable(&env.cancel, env.model.invoke(request)).await?;

            let mut usage = response.usage;
            usage.cost_usd = response
                .cost_usd
                .or_else(|| env.config.pricing_for(&model).map(|p| p.cost(&usage)))
                .unwrap_or(0.0);

            debug!(
                node_id = %node.id,
                model = %model,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "Model reply received"
            );

            Ok(ContextUpdate {
                append_messages: vec![
                    prompt_msg,
                    ChatMessage::assistant_text(response.text.clone()).from_node(&node.id),
                ],
                variables: vec![(node.output_key(), Value::String(response.text.clone()))],
                usage,
                output: Some(Value::String(response.text)),
                ..Default::default()
            })
        })
    }

    fn validate_config(&self, node: &NodeDef) -> Vec<ConfigError> {
        let NodeConfig::Model(cfg) = &node.config else {
            return vec![ConfigError::new("kind", "expected model config")];
        };
        let mut errors = Vec::new();
        if cfg.prompt.trim().is_empty() {
            errors.push(ConfigError::new("prompt", "prompt must not be empty"));
        }
        if let Some(t) = cfg.temperature {
            if !(0.0..=2.0).contains(&t) {
                errors.push(ConfigError::new("temperature", "must be between 0 and 2"));
            }
        }
        if cfg.max_tokens == Some(0) {
            errors.push(ConfigError::new("max_tokens", "must be greater than 0"));
        }
        if cfg.model.as_deref().is_some_and(|m| m.trim().is_empty()) {
            errors.push(ConfigError::new("model", "model id must not be empty"));
        }
        errors
    }
}
