//! Layer 4: quotas on graph size, tool calls, loop bounds and start rate.

use graphflow_core::config::ResourceLimits;
use graphflow_core::graph::{GraphDefinition, NodeConfig};
use graphflow_core::validation::{LayerReport, ValidationIssue, ValidationLayer};

/// Check `graph` against already caller-resolved `limits`.
///
/// `recent_executions` is the number of executions the caller started in the
/// last minute, not counting this one.
pub fn check(
    graph: &GraphDefinition,
    limits: &ResourceLimits,
    recent_executions: usize,
) -> LayerReport {
    let mut report = LayerReport::new(ValidationLayer::Resource);

    let nodes = graph.nodes.len();
    quota(&mut report, limits, "too_many_nodes", "nodes", nodes, limits.max_nodes);

    let tool_calls: usize = graph
        .nodes
        .iter()
        .map(|n| match &n.config {
            NodeConfig::Tool(cfg) => cfg.calls.len(),
            _ => 0,
        })
        .sum();
    quota(
        &mut report,
        limits,
        "too_many_tool_calls",
        "tool calls",
        tool_calls,
        limits.max_tool_calls,
    );

    for node in &graph.nodes {
        if let NodeConfig::Loop(cfg) = &node.config {
            if cfg.max_iterations > limits.max_loop_iterations {
                report.error(ValidationIssue::at(
                    "loop_bound_exceeded",
                    &node.id,
                    format!(
                        "max_iterations {} exceeds the limit of {}",
                        cfg.max_iterations, limits.max_loop_iterations
                    ),
                ));
            }
        }
    }

    let rate = limits.max_executions_per_minute as usize;
    if rate > 0 {
        if recent_executions >= rate {
            report.error(ValidationIssue::new(
                "rate_limited",
                format!("{} executions started in the last minute (limit {})", recent_executions, rate),
            ));
        } else if limits.near_limit(recent_executions + 1, rate) {
            report.warning(ValidationIssue::new(
                "near_rate_limit",
                format!("{} of {} executions per minute", recent_executions + 1, rate),
            ));
        }
    }
    report
}

fn quota(
    report: &mut LayerReport,
    limits: &ResourceLimits,
    code: &str,
    what: &str,
    used: usize,
    limit: usize,
) {
    if used > limit {
        report.error(ValidationIssue::new(
            code,
            format!("{} {} exceeds the limit of {}", used, what, limit),
        ));
    } else if limits.near_limit(used, limit) {
        report.warning(ValidationIssue::new(
            &format!("near_{}", code.trim_start_matches("too_many_")),
            format!("{} of {} {} used", used, limit, what),
        ));
    }
}
