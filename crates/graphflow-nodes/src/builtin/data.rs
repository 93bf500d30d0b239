use futures::future::BoxFuture;
use serde::Deserialize;

use graphflow_core::error::{FlowError, Result};
use graphflow_core::security::SecurityTier;
use graphflow_core::traits::Tool;
use graphflow_core::types::{ToolContext, ToolResult};

// ── JsonQueryTool ───────────────────────────────────────────────

pub struct JsonQueryTool;

#[derive(Deserialize)]
struct JsonQueryInput {
    /// A JSON document, or a string containing one.
    json: serde_json::Value,
    path: String,
}

impl Tool for JsonQueryTool {
    fn name(&self) -> &str {
        "json_query"
    }
    fn tier(&self) -> SecurityTier {
        SecurityTier::T0
    }
    fn description(&self) -> &str {
        "Query a JSON value by dot-notation path (e.g. 'foo.bar[0].baz')."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "json": { "description": "JSON value, or a string containing JSON" },
                "path": { "type": "string", "description": "Dot-notation path (e.g. 'items[0].name')" }
            },
            "required": ["json", "path"]
        })
    }
    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: JsonQueryInput = serde_json::from_value(input)
                .map_err(|e| FlowError::ToolValidation(e.to_string()))?;
            let value = match p.json {
                serde_json::Value::String(text) => serde_json::from_str(&text)
                    .map_err(|e| FlowError::ToolValidation(format!("Invalid JSON: {}", e)))?,
                other => other,
            };
            Ok(ToolResult::success(json_path_query(&value, &p.path)))
        })
    }
}

fn json_path_query(value: &serde_json::Value, path: &str) -> serde_json::Value {
    let mut current = value.clone();
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        // Check for array index: key[0]
        if let Some(bracket_pos) = segment.find('[') {
            let key = &segment[..bracket_pos];
            let idx_str = segment[bracket_pos + 1..].trim_end_matches(']');
            if !key.is_empty() {
                current = current.get(key).cloned().unwrap_or(serde_json::Value::Null);
            }
            if let Ok(idx) = idx_str.parse::<usize>() {
                current = current.get(idx).cloned().unwrap_or(serde_json::Value::Null);
            }
        } else {
            current = current
                .get(segment)
                .cloned()
                .unwrap_or(serde_json::Value::Null);
        }
    }
    current
}
