//! Four-layer pre-execution validation.
//!
//! Layers run in order: structure, security, capability, resource. A graph
//! that fails structure is not analysed further, since later layers assume
//! well-formed edges. The other layers always all run, so one report lists
//! every blocking issue.

pub mod capability;
pub mod resource;
pub mod security;
pub mod structure;

use std::sync::Arc;

use tracing::debug;

use graphflow_core::config::EngineConfig;
use graphflow_core::graph::GraphDefinition;
use graphflow_core::security::CallerIdentity;
use graphflow_core::validation::ValidationResult;
use graphflow_nodes::{NodeRegistry, RetrieverRegistry, ToolRegistry};

#[derive(Clone)]
pub struct Validator {
    config: Arc<EngineConfig>,
    nodes: Arc<NodeRegistry>,
    tools: Arc<ToolRegistry>,
    retrievers: Arc<RetrieverRegistry>,
}

impl Validator {
    pub fn new(
        config: Arc<EngineConfig>,
        nodes: Arc<NodeRegistry>,
        tools: Arc<ToolRegistry>,
        retrievers: Arc<RetrieverRegistry>,
    ) -> Self {
        Self {
            config,
            nodes,
            tools,
            retrievers,
        }
    }

    /// Validate `graph` for `caller`. Never fails; problems are in the result.
    pub fn validate(
        &self,
        graph: &GraphDefinition,
        caller: &CallerIdentity,
        recent_executions: usize,
    ) -> ValidationResult {
        let mut result = ValidationResult::new();

        let structure = structure::check(graph);
        let structure_ok = structure.is_ok();
        result.push(structure);
        if !structure_ok {
            debug!(graph = %graph.name, "Structure invalid, skipping remaining layers");
            return result;
        }

        result.push(security::check(
            graph,
            caller,
            &self.config.security,
            &self.tools,
        ));
        result.push(capability::check(
            graph,
            &self.nodes,
            &self.tools,
            &self.retrievers,
            &self.config.platform,
        ));
        result.push(resource::check(
            graph,
            &self.config.limits.for_caller(caller),
            recent_executions,
        ));

        debug!(
            graph = %graph.name,
            valid = result.is_valid(),
            errors = result.errors().count(),
            warnings = result.warnings().count(),
            "Validation finished"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphflow_core::graph::{EdgeDef, NodeConfig, NodeDef, NodeKind, ToolCallConfig, ToolNodeConfig};
    use graphflow_core::validation::ValidationLayer;
    use graphflow_test_utils::echo_graph;
    use serde_json::json;

    fn validator(config: EngineConfig) -> Validator {
        Validator::new(
            Arc::new(config),
            Arc::new(NodeRegistry::with_defaults()),
            Arc::new(ToolRegistry::with_builtins()),
            Arc::new(RetrieverRegistry::new()),
        )
    }

    #[test]
    fn test_valid_graph_runs_all_layers() {
        let result = validator(EngineConfig::default()).validate(
            &echo_graph("Echo: {input}"),
            &CallerIdentity::anonymous(),
            0,
        );
        assert!(result.is_valid(), "{:?}", result);
        assert_eq!(result.layers_run(), ValidationLayer::ALL.to_vec());
    }

    #[test]
    fn test_structure_failure_short_circuits() {
        let graph = echo_graph("x").with_edge(EdgeDef::new("end", "ghost"));
        let result = validator(EngineConfig::default()).validate(
            &graph,
            &CallerIdentity::anonymous(),
            0,
        );
        assert!(!result.is_valid());
        assert_eq!(result.layers_run(), vec![ValidationLayer::Structure]);
    }

    #[test]
    fn test_later_layers_all_report() {
        let mut config = EngineConfig::default();
        config.security.denied_node_kinds.push(NodeKind::Model);
        config.limits.max_nodes = 2;

        let mut graph = echo_graph("x");
        graph.nodes.push(NodeDef::new(
            "t",
            NodeConfig::Tool(ToolNodeConfig {
                calls: vec![ToolCallConfig::new("nope", json!({}))],
                parallel: false,
            }),
        ));
        graph.edges.retain(|e| e.source != "model");
        graph.edges.push(EdgeDef::new("model", "t"));
        graph.edges.push(EdgeDef::new("t", "end"));

        let result = validator(config).validate(&graph, &CallerIdentity::anonymous(), 0);
        assert_eq!(result.layers_run(), ValidationLayer::ALL.to_vec());
        assert!(result.has_error_code("node_kind_denied"));
        assert!(result.has_error_code("unknown_tool"));
        assert!(result.has_error_code("too_many_nodes"));
    }
}
