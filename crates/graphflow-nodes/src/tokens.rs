use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;

use graphflow_core::types::ChatMessage;

/// Tokenizer for cl100k_base, or `None` when it cannot be loaded.
fn tokenizer() -> Option<&'static CoreBPE> {
    static TOKENIZER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    TOKENIZER
        .get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load cl100k_base, estimating by length");
                None
            }
        })
        .as_ref()
}

/// Token count using BPE tokenization (cl100k_base), falling back to chars / 4.
pub fn estimate_tokens(text: &str) -> usize {
    match tokenizer() {
        Some(bpe) => bpe.encode_ordinary(text).len(),
        None => text.chars().count().div_ceil(4),
    }
}

/// Estimate token count for an entire ChatMessage.
/// Serializes content blocks to JSON and adds 4 tokens overhead per message.
pub fn estimate_message_tokens(msg: &ChatMessage) -> usize {
    let content_str = serde_json::to_string(&msg.content).unwrap_or_default();
    estimate_tokens(&content_str) + 4
}

pub fn total_tokens(messages: &[ChatMessage]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}
