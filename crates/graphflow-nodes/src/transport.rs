//! Offline transports: a model that echoes its prompt and an in-memory index.

use std::collections::HashSet;

use futures::future::BoxFuture;
use serde_json::Value;

use graphflow_core::error::Result;
use graphflow_core::graph::RetrievalMode;
use graphflow_core::traits::{
    ModelClient, ModelRequest, ModelResponse, RetrievalQuery, RetrievedDocument, Retriever,
};
use graphflow_core::types::{Role, Usage};

use crate::tokens::{estimate_tokens, total_tokens};

/// Replies with the text of the last user message.
#[derive(Debug, Default, Clone)]
pub struct EchoModel;

impl ModelClient for EchoModel {
    fn invoke(&self, request: ModelRequest) -> BoxFuture<'_, Result<ModelResponse>> {
        Box::pin(async move {
            let text = request
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.text())
                .unwrap_or_default();
            let system_tokens = request.system.as_deref().map(estimate_tokens).unwrap_or(0);
            let input_tokens = total_tokens(&request.messages) + system_tokens;
            let output_tokens = estimate_tokens(&text).max(1);
            Ok(ModelResponse {
                text,
                usage: Usage::new(input_tokens as u64, output_tokens as u64),
                cost_usd: None,
            })
        })
    }
}

/// In-memory keyword / similarity index.
#[derive(Debug, Default, Clone)]
pub struct KeywordIndex {
    documents: Vec<IndexedDocument>,
}

#[derive(Debug, Clone)]
struct IndexedDocument {
    id: String,
    content: String,
    metadata: Value,
    terms: HashSet<String>,
}

impl KeywordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: impl Into<String>, content: impl Into<String>, metadata: Value) {
        let content = content.into();
        let terms = terms(&content);
        self.documents.push(IndexedDocument {
            id: id.into(),
            content,
            metadata,
            terms,
        });
    }

    pub fn with_document(mut self, id: impl Into<String>, content: impl Into<String>) -> Self {
        self.add(id, content, Value::Null);
        self
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Score every document for a query, best first.
    pub fn search(&self, query: &RetrievalQuery) -> Vec<RetrievedDocument> {
        let query_terms = terms(&query.query);
        let mut hits: Vec<RetrievedDocument> = self
            .documents
            .iter()
            .filter_map(|doc| {
                let score = match query.mode {
                    RetrievalMode::Keyword => keyword_score(&query_terms, &doc.terms),
                    RetrievalMode::Similarity => jaccard(&query_terms, &doc.terms),
                    RetrievalMode::Hybrid => {
                        (keyword_score(&query_terms, &doc.terms) + jaccard(&query_terms, &doc.terms))
                            / 2.0
                    }
                };
                if score <= 0.0 || query.threshold.is_some_and(|t| score < t) {
                    return None;
                }
                Some(RetrievedDocument {
                    id: doc.id.clone(),
                    content: doc.content.clone(),
                    score,
                    metadata: doc.metadata.clone(),
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(query.top_k);
        hits
    }
}

impl Retriever for KeywordIndex {
    fn retrieve(&self, query: RetrievalQuery) -> BoxFuture<'_, Result<Vec<RetrievedDocument>>> {
        Box::pin(async move { Ok(self.search(&query)) })
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Fraction of query terms present in the document.
fn keyword_score(query: &HashSet<String>, doc: &HashSet<String>) -> f32 {
    if query.is_empty() {
        return 0.0;
    }
    query.intersection(doc).count() as f32 / query.len() as f32
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / union as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphflow_core::types::ChatMessage;

    fn query(text: &str, mode: RetrievalMode) -> RetrievalQuery {
        RetrievalQuery {
            index: "docs".into(),
            query: text.into(),
            mode,
            top_k: 2,
            threshold: None,
        }
    }

    #[tokio::test]
    async fn test_echo_model_replies_with_prompt() {
        let response = EchoModel
            .invoke(ModelRequest {
                model: "echo".into(),
                system: None,
                messages: vec![ChatMessage::user("Echo: Hello")],
                temperature: None,
                max_tokens: None,
            })
            .await
            .unwrap();
        assert_eq!(response.text, "Echo: Hello");
        assert!(response.usage.total_tokens() > 0);
        assert!(response.cost_usd.is_none());
    }

    #[test]
    fn test_keyword_ranking_and_top_k() {
        let index = KeywordIndex::new()
            .with_document("a", "Rust async runtime tokio")
            .with_document("b", "Rust ownership and borrowing")
            .with_document("c", "Gardening tips");
        let hits = index.search(&query("rust tokio", RetrievalMode::Keyword));
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert!((hits[0].score - 1.0).abs() < f32::EPSILON);
        assert_eq!(hits[1].id, "b");
    }

    #[test]
    fn test_threshold_filters() {
        let index = KeywordIndex::new()
            .with_document("a", "rust tokio")
            .with_document("b", "rust");
        let mut q = query("rust tokio", RetrievalMode::Hybrid);
        q.threshold = Some(0.9);
        let hits = index.search(&q);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
    }
}
