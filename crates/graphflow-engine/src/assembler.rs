//! Maps the final execution state into the caller-facing result.

use serde_json::{json, Value};

use graphflow_core::context::ExecutionContext;
use graphflow_core::execution::{
    ExecutionRequest, ExecutionResult, ExecutionStatus, ResultMetadata, ResultUsage, SourceKind,
    WorkflowKind,
};
use graphflow_core::graph::{GraphDefinition, VariableScope};
use graphflow_core::template::display;

/// How a traversal ended.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub failed_node: Option<String>,
}

impl Outcome {
    pub fn completed() -> Self {
        Self {
            status: ExecutionStatus::Completed,
            error: None,
            failed_node: None,
        }
    }

    pub fn failed(node: Option<&str>, error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            error: Some(error.into()),
            failed_node: node.map(str::to_string),
        }
    }

    pub fn cancelled(node: Option<&str>) -> Self {
        Self {
            status: ExecutionStatus::Cancelled,
            error: Some("Execution cancelled".to_string()),
            failed_node: node.map(str::to_string),
        }
    }
}

/// The result's source identifier: the definition id, else the template id,
/// else the request's target typed by its workflow kind.
pub fn resolve_source(
    graph: &GraphDefinition,
    request: &ExecutionRequest,
) -> (Option<String>, Option<SourceKind>) {
    match (&graph.definition_id, &graph.template_id, &request.target_id) {
        (Some(id), _, _) => (Some(id.clone()), Some(SourceKind::Definition)),
        (None, Some(id), _) => (Some(id.clone()), Some(SourceKind::Template)),
        (None, None, Some(id)) => {
            let kind = match request.workflow_kind {
                WorkflowKind::Template => SourceKind::Template,
                _ => SourceKind::Definition,
            };
            (Some(id.clone()), Some(kind))
        }
        (None, None, None) => (None, None),
    }
}

/// Build the result. Pure: reads the context, never changes it.
pub fn assemble(
    ctx: &ExecutionContext,
    request: &ExecutionRequest,
    graph: &GraphDefinition,
    outcome: &Outcome,
    execution_time_ms: u64,
) -> ExecutionResult {
    let output = ctx
        .final_output
        .clone()
        .or_else(|| ctx.last_output.as_ref().map(display))
        .unwrap_or_default();

    let errors = outcome.error.iter().cloned().collect();

    let (source_id, source_kind) = resolve_source(graph, request);
    let show_debug = request.debug || outcome.status != ExecutionStatus::Completed;
    let debug = show_debug.then(|| debug_info(ctx, outcome));

    ExecutionResult {
        execution_id: ctx.execution_id.clone(),
        status: outcome.status,
        output,
        payload: Value::Object(ctx.payload.clone()),
        usage: ResultUsage::from_usage(&ctx.usage, execution_time_ms),
        errors,
        metadata: ResultMetadata {
            workflow_kind: request.workflow_kind,
            source_id,
            source_kind,
            correlation_id: Some(ctx.correlation_id.0.clone()),
            session: ctx.scope_values(VariableScope::Session),
            global: ctx.scope_values(VariableScope::Global),
            debug,
        },
    }
}

fn debug_info(ctx: &ExecutionContext, outcome: &Outcome) -> Value {
    let loops: serde_json::Map<String, Value> = ctx
        .loops
        .iter()
        .map(|(id, state)| (id.clone(), json!(state)))
        .collect();
    json!({
        "history": ctx.history,
        "log": ctx.log,
        "variables": ctx.variables,
        "conditions": ctx.conditions,
        "loops": loops,
        "errors": ctx.errors,
        "messages": ctx.messages.len(),
        "failed_node": outcome.failed_node,
    })
}
