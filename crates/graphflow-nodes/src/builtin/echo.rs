use futures::future::BoxFuture;

use graphflow_core::error::Result;
use graphflow_core::security::SecurityTier;
use graphflow_core::traits::Tool;
use graphflow_core::types::{ToolContext, ToolResult};

/// Returns its input unchanged.
pub struct EchoTool;

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn tier(&self) -> SecurityTier {
        SecurityTier::T0
    }
    fn description(&self) -> &str {
        "Return the input unchanged."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }
    fn timeout_secs(&self) -> u64 {
        5
    }
    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move { Ok(ToolResult::success(input)) })
    }
}
