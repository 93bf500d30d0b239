//! Layer 2: is the caller allowed to run these node kinds and tools?

use graphflow_core::graph::{GraphDefinition, NodeConfig};
use graphflow_core::security::{
    CallerIdentity, DangerousPatternMatcher, GateDecision, SecurityPolicy, SecurityTier,
};
use graphflow_core::validation::{LayerReport, ValidationIssue, ValidationLayer};
use graphflow_nodes::ToolRegistry;

pub fn check(
    graph: &GraphDefinition,
    caller: &CallerIdentity,
    policy: &SecurityPolicy,
    tools: &ToolRegistry,
) -> LayerReport {
    let mut report = LayerReport::new(ValidationLayer::Security);
    let matcher = DangerousPatternMatcher::new(&policy.dangerous_patterns);

    for node in &graph.nodes {
        let kind = node.kind();
        if !policy.node_kind_permitted(caller, kind) {
            report.error(ValidationIssue::at(
                "node_kind_denied",
                &node.id,
                format!("caller '{}' may not run {} nodes", caller.id, kind),
            ));
            continue;
        }

        let NodeConfig::Tool(cfg) = &node.config else {
            continue;
        };
        for call in &cfg.calls {
            // Unknown tools are a capability finding, not a security one.
            let Some(tool) = tools.get(&call.tool) else {
                continue;
            };
            let mut tier = tool.tier();
            let input = call.input.to_string();
            if let Some(label) = matcher.is_dangerous(&input) {
                tracing::debug!(node_id = %node.id, tool = %call.tool, label, "Dangerous tool input");
                tier = SecurityTier::T4;
            }

            match policy.decide_for(caller, tier, &call.tool) {
                GateDecision::Allow => {}
                GateDecision::NeedsApproval => report.warning(ValidationIssue::at(
                    "needs_approval",
                    &node.id,
                    format!("tool '{}' ({}) requires approval", call.tool, tier),
                )),
                GateDecision::Deny => report.error(ValidationIssue::at(
                    "tool_denied",
                    &node.id,
                    format!("tool '{}' ({}) is denied for caller '{}'", call.tool, tier, caller.id),
                )),
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphflow_core::graph::{NodeDef, NodeKind, ToolCallConfig, ToolNodeConfig};
    use graphflow_core::security::CallerRules;
    use serde_json::json;

    fn tool_graph(input: serde_json::Value) -> GraphDefinition {
        GraphDefinition::new("g").with_node(NodeDef::new(
            "t",
            NodeConfig::Tool(ToolNodeConfig {
                calls: vec![ToolCallConfig::new("echo", input)],
                parallel: false,
            }),
        ))
    }

    #[test]
    fn test_default_policy_allows_builtin_tool() {
        let report = check(
            &tool_graph(json!({"msg": "hi"})),
            &CallerIdentity::anonymous(),
            &SecurityPolicy::default(),
            &ToolRegistry::with_builtins(),
        );
        assert!(report.is_ok());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_dangerous_input_escalates_to_t4() {
        let policy = SecurityPolicy {
            deny_above: Some(SecurityTier::T3),
            ..Default::default()
        };
        let report = check(
            &tool_graph(json!({"path": "../../etc/passwd"})),
            &CallerIdentity::anonymous(),
            &policy,
            &ToolRegistry::with_builtins(),
        );
        assert_eq!(report.errors[0].code, "tool_denied");

        let report = check(
            &tool_graph(json!({"path": "../../etc/passwd"})),
            &CallerIdentity::anonymous(),
            &SecurityPolicy::default(),
            &ToolRegistry::with_builtins(),
        );
        assert!(report.is_ok());
        assert_eq!(report.warnings[0].code, "needs_approval");
    }

    #[test]
    fn test_caller_rules_deny_kind_and_tool() {
        let mut policy = SecurityPolicy::default();
        policy.callers.insert(
            "guest".into(),
            CallerRules {
                denied_tools: vec!["echo".into()],
                ..Default::default()
            },
        );
        let guest = CallerIdentity::new("guest");
        let report = check(
            &tool_graph(json!({})),
            &guest,
            &policy,
            &ToolRegistry::with_builtins(),
        );
        assert_eq!(report.errors[0].code, "tool_denied");

        policy.denied_node_kinds.push(NodeKind::Tool);
        let report = check(
            &tool_graph(json!({})),
            &guest,
            &policy,
            &ToolRegistry::with_builtins(),
        );
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].code, "node_kind_denied");
    }
}
