//! History window management: trim oldest messages or fold them into a summary.

use futures::future::BoxFuture;
use serde_json::json;
use tracing::{debug, warn};

use graphflow_core::context::{ContextUpdate, ExecutionContext};
use graphflow_core::error::{FlowError, Result};
use graphflow_core::graph::{MemoryConfig, MemoryStrategy, NodeConfig, NodeDef, NodeKind};
use graphflow_core::traits::ModelRequest;
use graphflow_core::types::{ChatMessage, Role, Usage};
use graphflow_core::validation::ConfigError;

use crate::executor::{cancellable, wrong_kind, NodeEnv, NodeExecutor};
use crate::tokens::{estimate_message_tokens, total_tokens};

pub struct MemoryExecutor;

impl NodeExecutor for MemoryExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Memory
    }

    fn execute<'a>(
        &'a self,
        node: &'a NodeDef,
        ctx: &'a ExecutionContext,
        env: &'a NodeEnv,
    ) -> BoxFuture<'a, Result<ContextUpdate>> {
        Box::pin(async move {
            let NodeConfig::Memory(cfg) = &node.config else {
                return Err(wrong_kind(node, NodeKind::Memory));
            };

            let before = ctx.messages.len();
            if !over_window(&ctx.messages, cfg) {
                return Ok(ContextUpdate::new()
                    .with_output(json!({"removed": 0, "remaining": before, "summarized": false})));
            }

            let mut messages = ctx.messages.clone();
            let mut usage = Usage::default();
            let mut summarized = false;

            if cfg.strategy == MemoryStrategy::Summarize {
                if env.config.platform.summarization {
                    match summarize(&mut messages, cfg, env).await {
                        Ok(Some(u)) => {
                            usage = u;
                            summarized = true;
                        }
                        Ok(None) => {}
                        Err(FlowError::Cancelled) => return Err(FlowError::Cancelled),
                        Err(e) => {
                            warn!(node_id = %node.id, error = %e, "Summarization failed, trimming instead");
                        }
                    }
                } else {
                    warn!(node_id = %node.id, "Summarization unsupported, trimming instead");
                }
            }
            trim_to_window(&mut messages, cfg);

            let removed = before as i64 - messages.len() as i64;
            debug!(node_id = %node.id, before, after = messages.len(), summarized, "History managed");
            let output = json!({
                "removed": removed.max(0),
                "remaining": messages.len(),
                "summarized": summarized,
            });

            Ok(ContextUpdate {
                replace_messages: Some(messages),
                usage,
                output: Some(output),
                ..Default::default()
            })
        })
    }

    fn validate_config(&self, node: &NodeDef) -> Vec<ConfigError> {
        let NodeConfig::Memory(cfg) = &node.config else {
            return vec![ConfigError::new("kind", "expected memory config")];
        };
        let mut errors = Vec::new();
        if cfg.max_messages.is_none() && cfg.max_tokens.is_none() {
            errors.push(ConfigError::new(
                "max_messages",
                "one of max_messages or max_tokens is required",
            ));
        }
        if cfg.max_messages == Some(0) {
            errors.push(ConfigError::new("max_messages", "must be greater than 0"));
        }
        if cfg.max_tokens == Some(0) {
            errors.push(ConfigError::new("max_tokens", "must be greater than 0"));
        }
        if let Some(max) = cfg.max_messages {
            if cfg.keep_last > max {
                errors.push(ConfigError::new(
                    "keep_last",
                    format!("keep_last ({}) exceeds max_messages ({})", cfg.keep_last, max),
                ));
            }
        }
        errors
    }
}

fn over_window(messages: &[ChatMessage], cfg: &MemoryConfig) -> bool {
    cfg.max_messages.is_some_and(|max| messages.len() > max)
        || cfg.max_tokens.is_some_and(|max| total_tokens(messages) > max)
}

/// Index range of messages that may be removed: after leading system
/// messages and before the protected tail.
fn removable_range(messages: &[ChatMessage], keep_last: usize) -> std::ops::Range<usize> {
    let head = messages
        .iter()
        .take_while(|m| m.role == Role::System)
        .count();
    let tail_start = messages.len().saturating_sub(keep_last).max(head);
    head..tail_start
}

/// Remove the oldest removable, unprotected messages until the window fits.
/// Returns the number of messages removed.
pub fn trim_to_window(messages: &mut Vec<ChatMessage>, cfg: &MemoryConfig) -> usize {
    let mut removed = 0;
    while over_window(messages, cfg) {
        let range = removable_range(messages, cfg.keep_last);
        match range.clone().find(|&i| !messages[i].is_protected()) {
            Some(idx) => {
                messages.remove(idx);
                removed += 1;
            }
            None => break,
        }
    }
    removed
}

/// Replace the removable, unprotected range with one protected summary message.
async fn summarize(
    messages: &mut Vec<ChatMessage>,
    cfg: &MemoryConfig,
    env: &NodeEnv,
) -> Result<Option<Usage>> {
    let range = removable_range(messages, cfg.keep_last);
    let to_summarize: Vec<&ChatMessage> = messages[range.clone()]
        .iter()
        .filter(|m| !m.is_protected())
        .collect();
    if to_summarize.is_empty() {
        return Ok(None);
    }

    let mut conversation = String::new();
    for msg in &to_summarize {
        conversation.push_str(&format!("{:?}: {}\n", msg.role, msg.text()));
    }
    let model = cfg
        .model
        .clone()
        .unwrap_or_else(|| env.config.engine.default_model.clone());
    let request = ModelRequest {
        model: model.clone(),
        system: None,
        messages: vec![ChatMessage::user(format!(
            "Summarize the following conversation concisely, preserving key facts \
             and decisions. Output only the summary.\n\n{}",
            conversation
        ))],
        temperature: Some(0.0),
        max_tokens: None,
    };
    let response = cancellable(&env.cancel, env.model.invoke(request)).await?;
    if response.text.trim().is_empty() {
        return Ok(None);
    }

    let summary = ChatMessage::user(format!("[Conversation Summary]\n{}", response.text)).protected();
    let mut kept: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    for (i, msg) in messages.drain(..).enumerate() {
        if i == range.start {
            kept.push(summary.clone());
        }
        if range.contains(&i) && !msg.is_protected() {
            continue;
        }
        kept.push(msg);
    }
    *messages = kept;

    let mut usage = response.usage;
    usage.cost_usd = response
        .cost_usd
        .or_else(|| env.config.pricing_for(&model).map(|p| p.cost(&usage)))
        .unwrap_or(0.0);
    debug!(tokens = messages.iter().map(estimate_message_tokens).sum::<usize>(), "Summary inserted");
    Ok(Some(usage))
}
