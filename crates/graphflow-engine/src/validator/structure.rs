//! Layer 1: graph well-formedness. A failure here stops later layers.

use std::collections::{HashMap, HashSet, VecDeque};

use graphflow_core::expression::Expression;
use graphflow_core::graph::{EdgeDef, GraphDefinition, NodeConfig, NodeKind};
use graphflow_core::validation::{LayerReport, ValidationIssue, ValidationLayer};

pub fn check(graph: &GraphDefinition) -> LayerReport {
    let mut report = LayerReport::new(ValidationLayer::Structure);

    check_ids(graph, &mut report);
    let declared: HashSet<&str> = graph.nodes.iter().map(|n| n.id.as_str()).collect();

    for edge in &graph.edges {
        for end in [&edge.source, &edge.target] {
            if !declared.contains(end.as_str()) {
                report.error(ValidationIssue::new(
                    "dangling_edge",
                    format!(
                        "edge {} -> {} references undeclared node '{}'",
                        edge.source, edge.target, end
                    ),
                ));
            }
        }
    }

    let entry = match graph.entry_node_id() {
        Some(id) if declared.contains(id) => Some(id),
        Some(id) => {
            report.error(ValidationIssue::new(
                "missing_entry",
                format!("entry node '{}' is not declared", id),
            ));
            None
        }
        None => {
            report.error(ValidationIssue::new(
                "missing_entry",
                "no entry node: set `entry` or declare exactly one start node",
            ));
            None
        }
    };

    check_edges(graph, &mut report);
    check_handlers(graph, &declared, &mut report);

    // Cycle and reachability analysis need a well-formed edge set.
    if !report.is_ok() {
        return report;
    }
    check_cycles(graph, &mut report);
    if let Some(entry) = entry {
        check_reachability(graph, entry, &mut report);
    }
    report
}

fn check_ids(graph: &GraphDefinition, report: &mut LayerReport) {
    let mut seen = HashSet::new();
    for node in &graph.nodes {
        if node.id.trim().is_empty() {
            report.error(ValidationIssue::new("empty_node_id", "node id must not be empty"));
        } else if !seen.insert(node.id.as_str()) {
            report.error(ValidationIssue::at("duplicate_node", &node.id, "node id declared twice"));
        }
    }
    if graph.nodes.is_empty() {
        report.error(ValidationIssue::new("empty_graph", "graph declares no nodes"));
    }
}

fn check_edges(graph: &GraphDefinition, report: &mut LayerReport) {
    for node in &graph.nodes {
        let out: Vec<&EdgeDef> = graph.outgoing(&node.id).collect();
        match &node.config {
            NodeConfig::End(_) => {
                if !out.is_empty() {
                    report.error(ValidationIssue::at(
                        "end_has_edges",
                        &node.id,
                        "end nodes cannot have outgoing edges",
                    ));
                }
            }
            NodeConfig::Conditional(cfg) => {
                let defaults = out.iter().filter(|e| e.condition.is_none()).count();
                if defaults > 1 {
                    report.error(ValidationIssue::at(
                        "multiple_defaults",
                        &node.id,
                        format!("{} unconditional edges; at most one is allowed", defaults),
                    ));
                }
                if defaults == 0 && !cfg.terminal_on_no_match {
                    report.error(ValidationIssue::at(
                        "dangling_conditional",
                        &node.id,
                        "no default edge and terminal_on_no_match is not set",
                    ));
                }
                for edge in out.iter().filter_map(|e| e.condition.as_deref()) {
                    if let Err(e) = Expression::parse(edge) {
                        report.error(ValidationIssue::at("invalid_condition", &node.id, e.to_string()));
                    }
                }
            }
            NodeConfig::Loop(cfg) => {
                if cfg.max_iterations == 0 {
                    report.error(ValidationIssue::at(
                        "invalid_loop_bound",
                        &node.id,
                        "max_iterations must be at least 1",
                    ));
                }
                if graph.node(&cfg.body).is_none() {
                    report.error(ValidationIssue::at(
                        "unknown_loop_body",
                        &node.id,
                        format!("body node '{}' is not declared", cfg.body),
                    ));
                } else if !out.iter().any(|e| e.target == cfg.body) {
                    report.error(ValidationIssue::at(
                        "missing_loop_body_edge",
                        &node.id,
                        format!("no edge from the loop to its body '{}'", cfg.body),
                    ));
                }
                let exits = out.iter().filter(|e| e.target != cfg.body).count();
                if exits > 1 || out.len() > 2 {
                    report.error(ValidationIssue::at(
                        "too_many_edges",
                        &node.id,
                        "a loop has one body edge and at most one exit edge",
                    ));
                }
                if out.iter().any(|e| e.condition.is_some()) {
                    report.error(ValidationIssue::at(
                        "unexpected_condition",
                        &node.id,
                        "loop edges cannot carry conditions",
                    ));
                }
            }
            _ => {
                if out.len() > 1 {
                    report.error(ValidationIssue::at(
                        "too_many_edges",
                        &node.id,
                        format!("{} nodes have at most one outgoing edge", node.kind()),
                    ));
                }
                if out.iter().any(|e| e.condition.is_some()) {
                    report.error(ValidationIssue::at(
                        "unexpected_condition",
                        &node.id,
                        "only conditional nodes may have conditional edges",
                    ));
                }
            }
        }
    }
}

fn check_handlers(graph: &GraphDefinition, declared: &HashSet<&str>, report: &mut LayerReport) {
    let mut protected_by: HashMap<&str, &str> = HashMap::new();
    for node in &graph.nodes {
        let NodeConfig::ErrorHandler(cfg) = &node.config else {
            continue;
        };
        for target in &cfg.protects {
            if !declared.contains(target.as_str()) {
                report.error(ValidationIssue::at(
                    "unknown_protected_node",
                    &node.id,
                    format!("protected node '{}' is not declared", target),
                ));
                continue;
            }
            if graph.node(target).is_some_and(|t| t.kind().is_control()) {
                report.error(ValidationIssue::at(
                    "invalid_protected_node",
                    &node.id,
                    format!("'{}' is a control node and cannot be protected", target),
                ));
            }
            if let Some(other) = protected_by.insert(target.as_str(), node.id.as_str()) {
                if other != node.id {
                    report.error(ValidationIssue::at(
                        "multiple_handlers",
                        target,
                        format!("protected by both '{}' and '{}'", other, node.id),
                    ));
                }
            }
        }
    }
}

/// Nodes reachable from `from` without passing through `barrier`.
fn reach_without<'a>(
    graph: &'a GraphDefinition,
    from: &'a str,
    barrier: &str,
) -> HashSet<&'a str> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([from]);
    while let Some(id) = queue.pop_front() {
        if id == barrier || !seen.insert(id) {
            continue;
        }
        for edge in graph.outgoing(id) {
            queue.push_back(edge.target.as_str());
        }
    }
    seen
}

/// Edges permitted to close a cycle: `u -> loop` where `u` is inside the loop's body
/// and cannot be reached again through the loop's exit edge.
fn back_edges(graph: &GraphDefinition) -> HashSet<usize> {
    let mut allowed = HashSet::new();
    for node in &graph.nodes {
        let NodeConfig::Loop(cfg) = &node.config else {
            continue;
        };
        let body = reach_without(graph, &cfg.body, &node.id);
        // Each exit resets the loop, so a path back from the exit side is unbounded.
        let after_exit: HashSet<&str> = graph
            .outgoing(&node.id)
            .filter(|edge| edge.target != cfg.body)
            .flat_map(|edge| reach_without(graph, &edge.target, &node.id))
            .collect();
        for (i, edge) in graph.edges.iter().enumerate() {
            let source = edge.source.as_str();
            if edge.target == node.id && body.contains(source) && !after_exit.contains(source) {
                allowed.insert(i);
            }
        }
    }
    allowed
}

fn check_cycles(graph: &GraphDefinition, report: &mut LayerReport) {
    let allowed = back_edges(graph);
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for (i, edge) in graph.edges.iter().enumerate() {
        if !allowed.contains(&i) {
            adjacency
                .entry(edge.source.as_str())
                .or_default()
                .push(edge.target.as_str());
        }
    }

    // Iterative three-colour DFS.
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    for root in graph.nodes.iter().map(|n| n.id.as_str()) {
        if marks.contains_key(root) {
            continue;
        }
        let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
        marks.insert(root, Mark::Visiting);
        while let Some((id, next)) = stack.pop() {
            let children = adjacency.get(id).map(Vec::as_slice).unwrap_or(&[]);
            if next < children.len() {
                stack.push((id, next + 1));
                let child = children[next];
                match marks.get(child) {
                    Some(Mark::Visiting) => {
                        report.error(ValidationIssue::at(
                            "cycle",
                            child,
                            format!("cycle {} -> {} is not closed by a loop node", id, child),
                        ));
                        return;
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(child, Mark::Visiting);
                        stack.push((child, 0));
                    }
                }
            } else {
                marks.insert(id, Mark::Done);
            }
        }
    }
}

fn check_reachability(graph: &GraphDefinition, entry: &str, report: &mut LayerReport) {
    let reachable = reach_without(graph, entry, "");
    for node in &graph.nodes {
        // Handlers are entered on failure, not along edges; their fallbacks count as reachable.
        if node.kind() == NodeKind::ErrorHandler || reachable.contains(node.id.as_str()) {
            continue;
        }
        let via_handler = graph
            .nodes
            .iter()
            .filter(|h| h.kind() == NodeKind::ErrorHandler)
            .any(|h| reach_without(graph, &h.id, "").contains(node.id.as_str()));
        if !via_handler {
            report.warning(ValidationIssue::at(
                "unreachable",
                &node.id,
                "node cannot be reached from the entry node",
            ));
        }
    }
}
