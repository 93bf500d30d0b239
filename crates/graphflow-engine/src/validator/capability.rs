//! Layer 3: can this platform run every node as configured?

use graphflow_core::config::PlatformCapabilities;
use graphflow_core::graph::{GraphDefinition, MemoryStrategy, NodeConfig};
use graphflow_core::validation::{LayerReport, ValidationIssue, ValidationLayer};
use graphflow_nodes::{NodeRegistry, RetrieverRegistry, ToolRegistry};

pub fn check(
    graph: &GraphDefinition,
    nodes: &NodeRegistry,
    tools: &ToolRegistry,
    retrievers: &RetrieverRegistry,
    platform: &PlatformCapabilities,
) -> LayerReport {
    let mut report = LayerReport::new(ValidationLayer::Capability);

    for node in &graph.nodes {
        let Some(executor) = nodes.get(node.kind()) else {
            report.error(ValidationIssue::at(
                "unsupported_node_kind",
                &node.id,
                format!("no executor registered for {} nodes", node.kind()),
            ));
            continue;
        };
        for err in executor.validate_config(node) {
            report.error(ValidationIssue::at("invalid_config", &node.id, err.to_string()));
        }

        match &node.config {
            NodeConfig::Tool(cfg) => {
                for call in cfg.calls.iter().filter(|c| !tools.contains(&c.tool)) {
                    report.error(ValidationIssue::at(
                        "unknown_tool",
                        &node.id,
                        format!("tool '{}' is not registered", call.tool),
                    ));
                }
                if cfg.parallel && cfg.calls.len() > 1 && !platform.parallel_tools {
                    report.warning(ValidationIssue::at(
                        "parallel_unsupported",
                        &node.id,
                        "parallel tool calls will run sequentially",
                    ));
                }
            }
            NodeConfig::Retrieval(cfg) if !retrievers.contains(&cfg.index) => {
                report.error(ValidationIssue::at(
                    "unknown_index",
                    &node.id,
                    format!("retrieval index '{}' is not registered", cfg.index),
                ));
            }
            NodeConfig::Memory(cfg)
                if cfg.strategy == MemoryStrategy::Summarize && !platform.summarization =>
            {
                report.warning(ValidationIssue::at(
                    "summarization_unsupported",
                    &node.id,
                    "summarization is disabled; history will be trimmed instead",
                ));
            }
            _ => {}
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphflow_core::graph::{
        MemoryConfig, NodeDef, NodeKind, RetrievalConfig, RetrievalMode, ToolCallConfig,
        ToolNodeConfig,
    };
    use serde_json::json;

    fn tools_node(names: &[&str], parallel: bool) -> NodeDef {
        NodeDef::new(
            "t",
            NodeConfig::Tool(ToolNodeConfig {
                calls: names
                    .iter()
                    .map(|n| ToolCallConfig::new(*n, json!({})))
                    .collect(),
                parallel,
            }),
        )
    }

    fn run(graph: &GraphDefinition, nodes: &NodeRegistry, platform: &PlatformCapabilities) -> LayerReport {
        check(
            graph,
            nodes,
            &ToolRegistry::with_builtins(),
            &RetrieverRegistry::new(),
            platform,
        )
    }

    #[test]
    fn test_unknown_tool_and_index() {
        let graph = GraphDefinition::new("g")
            .with_node(tools_node(&["echo", "missing"], false))
            .with_node(NodeDef::new(
                "r",
                NodeConfig::Retrieval(RetrievalConfig {
                    index: "docs".into(),
                    query: "{input}".into(),
                    mode: RetrievalMode::Keyword,
                    top_k: 3,
                    threshold: None,
                    rerank: false,
                    output_key: None,
                }),
            ));
        let report = run(&graph, &NodeRegistry::with_defaults(), &PlatformCapabilities::default());
        let codes: Vec<&str> = report.errors.iter().map(|e| e.code.as_str()).collect();
        assert_eq!(codes, vec!["unknown_tool", "unknown_index"]);
    }

    #[test]
    fn test_unregistered_kind_and_bad_config() {
        let mut nodes = NodeRegistry::with_defaults();
        nodes.unregister(NodeKind::Tool);
        let graph = GraphDefinition::new("g")
            .with_node(tools_node(&["echo"], false))
            .with_node(NodeDef::new(
                "mem",
                NodeConfig::Memory(MemoryConfig {
                    strategy: MemoryStrategy::Trim,
                    max_messages: None,
                    max_tokens: None,
                    keep_last: 2,
                    model: None,
                }),
            ));
        let report = run(&graph, &nodes, &PlatformCapabilities::default());
        assert_eq!(report.errors[0].code, "unsupported_node_kind");
        assert_eq!(report.errors[1].code, "invalid_config");
        assert_eq!(report.errors[1].node_id.as_deref(), Some("mem"));
    }

    #[test]
    fn test_degraded_platform_warns() {
        let platform = PlatformCapabilities {
            parallel_tools: false,
            summarization: false,
            ..Default::default()
        };
        let graph = GraphDefinition::new("g")
            .with_node(tools_node(&["echo", "json_query"], true))
            .with_node(NodeDef::new(
                "mem",
                NodeConfig::Memory(MemoryConfig {
                    strategy: MemoryStrategy::Summarize,
                    max_messages: Some(10),
                    max_tokens: None,
                    keep_last: 2,
                    model: None,
                }),
            ));
        let report = run(&graph, &NodeRegistry::with_defaults(), &platform);
        assert!(report.is_ok(), "{:?}", report.errors);
        let codes: Vec<&str> = report.warnings.iter().map(|e| e.code.as_str()).collect();
        assert_eq!(codes, vec!["parallel_unsupported", "summarization_unsupported"]);
    }
}
