use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use graphflow_core::context::{ContextUpdate, ExecutionContext};
use graphflow_core::error::{FlowError, Result};
use graphflow_core::graph::{NodeConfig, NodeDef, NodeKind};
use graphflow_core::template::render;
use graphflow_core::traits::RetrievalQuery;
use graphflow_core::validation::ConfigError;

use crate::executor::{cancellable, wrong_kind, NodeEnv, NodeExecutor};

/// Queries a named index and writes the ranked documents to a variable.
pub struct RetrievalExecutor;

impl NodeExecutor for RetrievalExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Retrieval
    }

    fn execute<'a>(
        &'a self,
        node: &'a NodeDef,
        ctx: &'a ExecutionContext,
        env: &'a NodeEnv,
    ) -> BoxFuture<'a, Result<ContextUpdate>> {
        Box::pin(async move {
            let NodeConfig::Retrieval(cfg) = &node.config else {
                return Err(wrong_kind(node, NodeKind::Retrieval));
            };
            let retriever = env
                .retrievers
                .get(&cfg.index)
                .ok_or_else(|| FlowError::Retrieval(format!("unknown index: {}", cfg.index)))?;

            let query = render(&cfg.query, &ctx.scope());
            // Over-fetch when reranking so the reranker has candidates to reorder.
            let fetch = if cfg.rerank { cfg.top_k * 2 } else { cfg.top_k };
            let request = RetrievalQuery {
                index: cfg.index.clone(),
                query: query.clone(),
                mode: cfg.mode,
                top_k: fetch,
                threshold: cfg.threshold,
            };
            let mut documents = cancellable(&env.cancel, retriever.retrieve(request)).await?;

            if let Some(threshold) = cfg.threshold {
                documents.retain(|d| d.score >= threshold);
            }
            if cfg.rerank {
                documents = cancellable(&env.cancel, retriever.rerank(&query, documents)).await?;
            }
            documents.truncate(cfg.top_k);

            debug!(
                node_id = %node.id,
                index = %cfg.index,
                hits = documents.len(),
                "Retrieval complete"
            );

            let value = serde_json::to_value(&documents)?;
            Ok(ContextUpdate::new()
                .with_variable(node.output_key(), value.clone())
                .with_output(value)
                .with_note(format!("retrieved {} documents", documents.len())))
        })
    }

    fn validate_config(&self, node: &NodeDef) -> Vec<ConfigError> {
        let NodeConfig::Retrieval(cfg) = &node.config else {
            return vec![ConfigError::new("kind", "expected retrieval config")];
        };
        let mut errors = Vec::new();
        if cfg.index.trim().is_empty() {
            errors.push(ConfigError::new("index", "index must not be empty"));
        }
        if cfg.query.trim().is_empty() {
            errors.push(ConfigError::new("query", "query must not be empty"));
        }
        if cfg.top_k == 0 {
            errors.push(ConfigError::new("top_k", "must be greater than 0"));
        }
        if let Some(t) = cfg.threshold {
            if !(0.0..=1.0).contains(&t) {
                errors.push(ConfigError::new("threshold", "must be between 0 and 1"));
            }
        }
        errors
    }
}

/// Render retrieved documents as a context block for prompts.
pub fn documents_as_text(value: &Value) -> String {
    value
        .as_array()
        .map(|docs| {
            docs.iter()
                .filter_map(|d| d.get("content").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n\n")
        })
        .unwrap_or_default()
}
