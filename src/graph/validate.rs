//! Graph validation: deterministic topological ordering, cycle detection,
//! and structural checks. Runs before every `execute`/`resume`, so a
//! since-edited definition can never smuggle a cycle into a resumed run.

use std::collections::{BinaryHeap, HashMap, HashSet};

use petgraph::algo::{is_cyclic_directed, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};

use crate::core::errors::{EngineError, Result};
use crate::graph::definition::{NodeKind, WorkflowDefinition, WorkflowEdge, WorkflowNode};

/// Builds the petgraph representation of a definition, weighted by each
/// node's input position. Fails on edges referencing unknown node ids.
pub fn build_graph(
    nodes: &[WorkflowNode],
    edges: &[WorkflowEdge],
) -> Result<(DiGraph<usize, ()>, HashMap<String, NodeIndex>)> {
    let mut graph = DiGraph::new();
    let mut indices = HashMap::with_capacity(nodes.len());

    for (position, node) in nodes.iter().enumerate() {
        if indices.contains_key(&node.id) {
            return Err(EngineError::validation(format!(
                "duplicate node id '{}'",
                node.id
            )));
        }
        let idx = graph.add_node(position);
        indices.insert(node.id.clone(), idx);
    }

    for edge in edges {
        let source = indices.get(&edge.source).ok_or_else(|| {
            EngineError::validation(format!(
                "edge '{}' references unknown source node '{}'",
                edge.id, edge.source
            ))
        })?;
        let target = indices.get(&edge.target).ok_or_else(|| {
            EngineError::validation(format!(
                "edge '{}' references unknown target node '{}'",
                edge.id, edge.target
            ))
        })?;
        graph.add_edge(*source, *target, ());
    }

    Ok((graph, indices))
}

/// Kahn's-algorithm ordering with ties broken by input order: among ready
/// nodes, the one that appears first in `nodes` always emits first. This
/// keeps re-validation of an unmodified definition byte-for-byte
/// deterministic, which `petgraph::visit::Topo` does not guarantee.
pub fn topological_sort<'a>(
    nodes: &'a [WorkflowNode],
    edges: &[WorkflowEdge],
) -> Result<Vec<&'a WorkflowNode>> {
    let index_of: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; nodes.len()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for edge in edges {
        let (source, target) = match (
            index_of.get(edge.source.as_str()),
            index_of.get(edge.target.as_str()),
        ) {
            (Some(s), Some(t)) => (*s, *t),
            _ => {
                return Err(EngineError::validation(format!(
                    "edge '{}' references an unknown node",
                    edge.id
                )))
            }
        };
        successors[source].push(target);
        in_degree[target] += 1;
    }

    // Min-heap over input positions keeps the tie-break deterministic.
    let mut ready: BinaryHeap<std::cmp::Reverse<usize>> = (0..nodes.len())
        .filter(|i| in_degree[*i] == 0)
        .map(std::cmp::Reverse)
        .collect();

    let mut ordered = Vec::with_capacity(nodes.len());
    while let Some(std::cmp::Reverse(position)) = ready.pop() {
        ordered.push(&nodes[position]);
        for &next in &successors[position] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(std::cmp::Reverse(next));
            }
        }
    }

    if ordered.len() != nodes.len() {
        return Err(EngineError::CycleDetected(describe_cycle(nodes, edges)));
    }
    Ok(ordered)
}

/// True when the graph contains any cycle, self-loops included. Edges
/// referencing unknown nodes are ignored here; `validate` rejects them
/// separately.
pub fn detect_cycles(nodes: &[WorkflowNode], edges: &[WorkflowEdge]) -> bool {
    let known: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    let well_formed: Vec<WorkflowEdge> = edges
        .iter()
        .filter(|e| known.contains(e.source.as_str()) && known.contains(e.target.as_str()))
        .cloned()
        .collect();

    match build_graph(nodes, &well_formed) {
        Ok((graph, _)) => is_cyclic_directed(&graph),
        Err(_) => false,
    }
}

/// Names the nodes on a cycle for the validation error message.
fn describe_cycle(nodes: &[WorkflowNode], edges: &[WorkflowEdge]) -> String {
    if let Ok((graph, _)) = build_graph(nodes, edges) {
        // A strongly connected component larger than one node is a cycle;
        // a single node is only cyclic through a self-loop.
        for component in tarjan_scc(&graph) {
            let is_cycle = component.len() > 1
                || graph.contains_edge(component[0], component[0]);
            if is_cycle {
                let ids: Vec<&str> = component
                    .iter()
                    .map(|idx| nodes[graph[*idx]].id.as_str())
                    .collect();
                return format!("cycle involving nodes [{}]", ids.join(", "));
            }
        }
    }
    "cycle present in graph".to_string()
}

/// Full structural validation of a definition. Everything here fails
/// before any node executes, with no partial side effects.
pub fn validate(definition: &WorkflowDefinition) -> Result<()> {
    let (_, indices) = build_graph(&definition.nodes, &definition.edges)?;

    if detect_cycles(&definition.nodes, &definition.edges) {
        return Err(EngineError::CycleDetected(describe_cycle(
            &definition.nodes,
            &definition.edges,
        )));
    }

    for node in &definition.nodes {
        match &node.kind {
            NodeKind::Parallel(data) => {
                if data.branch_node_ids.is_empty() {
                    return Err(EngineError::validation(format!(
                        "parallel node '{}' declares no branches",
                        node.id
                    )));
                }
                if let Some(names) = &data.branch_names {
                    if names.len() != data.branch_node_ids.len() {
                        return Err(EngineError::validation(format!(
                            "parallel node '{}' declares {} branch names for {} branches",
                            node.id,
                            names.len(),
                            data.branch_node_ids.len()
                        )));
                    }
                    let mut seen = HashSet::new();
                    for name in names {
                        if !seen.insert(name.as_str()) {
                            return Err(EngineError::validation(format!(
                                "parallel node '{}' declares duplicate branch name '{name}'",
                                node.id
                            )));
                        }
                    }
                }
                for branch in &data.branch_node_ids {
                    if branch.is_empty() {
                        return Err(EngineError::validation(format!(
                            "parallel node '{}' has an empty branch",
                            node.id
                        )));
                    }
                    for id in branch {
                        validate_embedded_node(definition, &indices, &node.id, id, "branch")?;
                    }
                }
            }
            NodeKind::Loop(data) => {
                if data.body_node_ids.is_empty() {
                    return Err(EngineError::validation(format!(
                        "loop node '{}' declares an empty body",
                        node.id
                    )));
                }
                if data.max_iterations == 0 {
                    return Err(EngineError::validation(format!(
                        "loop node '{}' has max_iterations of 0",
                        node.id
                    )));
                }
                for id in &data.body_node_ids {
                    validate_embedded_node(definition, &indices, &node.id, id, "loop body")?;
                }
            }
            _ => {}
        }
    }

    Ok(())
}

/// Checks a node referenced from a parallel branch or loop body. Approval
/// nodes cannot appear there (suspension does not compose with concurrent
/// siblings or repeated iterations), and nesting of further fan-out is
/// rejected rather than silently mis-executed.
fn validate_embedded_node(
    definition: &WorkflowDefinition,
    indices: &HashMap<String, NodeIndex>,
    owner_id: &str,
    node_id: &str,
    context: &str,
) -> Result<()> {
    if !indices.contains_key(node_id) {
        return Err(EngineError::validation(format!(
            "node '{owner_id}' references unknown {context} node '{node_id}'"
        )));
    }
    let node = definition
        .node(node_id)
        .expect("node id resolved through the index map");
    match &node.kind {
        NodeKind::Approval(_) => Err(EngineError::validation(format!(
            "approval node '{node_id}' is not permitted inside a {context} of '{owner_id}'"
        ))),
        NodeKind::Parallel(_) | NodeKind::Loop(_) => Err(EngineError::validation(format!(
            "{} node '{node_id}' cannot be nested inside a {context} of '{owner_id}'",
            node.kind.name()
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::definition::{ApprovalNode, InputNode, ParallelNode, ToolNode};
    use pretty_assertions::assert_eq;

    fn node(id: &str) -> WorkflowNode {
        WorkflowNode {
            id: id.to_string(),
            kind: NodeKind::Tool(ToolNode {
                tool_name: "noop".to_string(),
                args: serde_json::json!({}),
                arg_refs: Default::default(),
                retry: None,
            }),
            position: None,
        }
    }

    fn edge(id: &str, source: &str, target: &str) -> WorkflowEdge {
        WorkflowEdge {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            label: None,
        }
    }

    #[test]
    fn test_topological_sort_respects_edges() {
        let nodes = vec![node("c"), node("a"), node("b")];
        let edges = vec![edge("e1", "a", "b"), edge("e2", "b", "c")];
        let ordered: Vec<&str> = topological_sort(&nodes, &edges)
            .unwrap()
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(ordered, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_topological_sort_ties_broken_by_input_order() {
        // No edges at all: output must be exactly the input order.
        let nodes = vec![node("z"), node("m"), node("a")];
        let ordered: Vec<&str> = topological_sort(&nodes, &[])
            .unwrap()
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(ordered, vec!["z", "m", "a"]);
    }

    #[test]
    fn test_topological_sort_includes_disconnected_nodes() {
        let nodes = vec![node("a"), node("island"), node("b")];
        let edges = vec![edge("e1", "a", "b")];
        let ordered: Vec<&str> = topological_sort(&nodes, &edges)
            .unwrap()
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(ordered, vec!["a", "island", "b"]);
    }

    #[test]
    fn test_topological_sort_is_deterministic() {
        let nodes = vec![node("a"), node("b"), node("c"), node("d")];
        let edges = vec![edge("e1", "a", "c"), edge("e2", "b", "c")];
        let first: Vec<String> = topological_sort(&nodes, &edges)
            .unwrap()
            .iter()
            .map(|n| n.id.clone())
            .collect();
        for _ in 0..10 {
            let again: Vec<String> = topological_sort(&nodes, &edges)
                .unwrap()
                .iter()
                .map(|n| n.id.clone())
                .collect();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn test_every_edge_source_precedes_target() {
        let nodes = vec![node("e"), node("d"), node("c"), node("b"), node("a")];
        let edges = vec![
            edge("e1", "a", "b"),
            edge("e2", "b", "d"),
            edge("e3", "a", "c"),
            edge("e4", "c", "d"),
            edge("e5", "d", "e"),
        ];
        let ordered: Vec<&str> = topological_sort(&nodes, &edges)
            .unwrap()
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        for e in &edges {
            let source_pos = ordered.iter().position(|id| *id == e.source).unwrap();
            let target_pos = ordered.iter().position(|id| *id == e.target).unwrap();
            assert!(source_pos < target_pos, "{} must precede {}", e.source, e.target);
        }
    }

    #[test]
    fn test_detect_cycles() {
        let nodes = vec![node("a"), node("b")];
        let cyclic = vec![edge("e1", "a", "b"), edge("e2", "b", "a")];
        assert!(detect_cycles(&nodes, &cyclic));

        let acyclic = vec![edge("e1", "a", "b")];
        assert!(!detect_cycles(&nodes, &acyclic));
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let nodes = vec![node("a")];
        let edges = vec![edge("e1", "a", "a")];
        assert!(detect_cycles(&nodes, &edges));

        let err = topological_sort(&nodes, &edges).unwrap_err();
        assert!(matches!(err, EngineError::CycleDetected(_)));
        assert!(err.to_string().contains('a'));
    }

    #[test]
    fn test_unknown_edge_target_rejected() {
        let nodes = vec![node("a")];
        let edges = vec![edge("e1", "a", "ghost")];
        let err = topological_sort(&nodes, &edges).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    fn definition(nodes: Vec<WorkflowNode>, edges: Vec<WorkflowEdge>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf".to_string(),
            version: 1,
            name: "test".to_string(),
            description: None,
            nodes,
            edges,
        }
    }

    #[test]
    fn test_validate_rejects_approval_in_parallel_branch() {
        let approval = WorkflowNode {
            id: "gate".to_string(),
            kind: NodeKind::Approval(ApprovalNode::default()),
            position: None,
        };
        let parallel = WorkflowNode {
            id: "fan".to_string(),
            kind: NodeKind::Parallel(ParallelNode {
                branch_node_ids: vec![vec!["gate".to_string()]],
                branch_names: None,
                merge_strategy: Default::default(),
                error_handling: Default::default(),
                timeout_ms: None,
            }),
            position: None,
        };
        let def = definition(vec![parallel, approval], vec![]);
        let err = validate(&def).unwrap_err();
        assert!(err.to_string().contains("approval"));
    }

    #[test]
    fn test_validate_rejects_empty_branches() {
        let parallel = WorkflowNode {
            id: "fan".to_string(),
            kind: NodeKind::Parallel(ParallelNode {
                branch_node_ids: vec![],
                branch_names: None,
                merge_strategy: Default::default(),
                error_handling: Default::default(),
                timeout_ms: None,
            }),
            position: None,
        };
        let def = definition(vec![parallel], vec![]);
        assert!(validate(&def).is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_branch_node() {
        let parallel = WorkflowNode {
            id: "fan".to_string(),
            kind: NodeKind::Parallel(ParallelNode {
                branch_node_ids: vec![vec!["missing".to_string()]],
                branch_names: None,
                merge_strategy: Default::default(),
                error_handling: Default::default(),
                timeout_ms: None,
            }),
            position: None,
        };
        let def = definition(vec![parallel], vec![]);
        assert!(validate(&def).is_err());
    }

    #[test]
    fn test_validate_accepts_simple_pipeline() {
        let input = WorkflowNode {
            id: "in".to_string(),
            kind: NodeKind::Input(InputNode::default()),
            position: None,
        };
        let def = definition(
            vec![input, node("work")],
            vec![edge("e1", "in", "work")],
        );
        validate(&def).unwrap();
    }
}
