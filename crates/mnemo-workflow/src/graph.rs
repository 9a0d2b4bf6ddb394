//! Graph Builder
//!
//! Validates a raw workflow config and resolves it into an executable
//! structure: typed nodes in topological order, successor lookups, error
//! edges, and the set of (streaming node, End node) pairs that are safe for
//! live chunk forwarding. Back-edges are only legal inside loop bodies, so
//! the top-level graph must be acyclic.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{Result, WorkflowError};
use crate::nodes::{ConvVarSpec, EdgeSpec, Node, NodeKind, WorkflowConfig};

/// Build-time resolved workflow graph
#[derive(Debug)]
pub struct WorkflowGraph {
    /// Nodes in topological order
    pub nodes: Vec<Node>,
    pub edges: Vec<EdgeSpec>,
    pub variables: Vec<ConvVarSpec>,
    pub start_node_id: String,
    pub end_node_ids: Vec<String>,
    /// (producer, end) pairs where a branch-free path guarantees the End
    /// node runs whenever the producer runs
    pub streamable_pairs: HashSet<(String, String)>,
    index: HashMap<String, usize>,
}

impl WorkflowGraph {
    /// Validate and resolve a raw config
    pub fn build(config: WorkflowConfig) -> Result<Self> {
        if config.nodes.is_empty() {
            return Err(WorkflowError::InvalidWorkflow("workflow has no nodes".to_string()));
        }

        let mut parsed: Vec<Node> = Vec::with_capacity(config.nodes.len());
        let mut by_id: HashMap<String, usize> = HashMap::new();
        for spec in &config.nodes {
            if by_id.contains_key(&spec.id) {
                return Err(WorkflowError::InvalidWorkflow(format!(
                    "duplicate node id '{}'",
                    spec.id
                )));
            }
            by_id.insert(spec.id.clone(), parsed.len());
            parsed.push(Node::parse(spec)?);
        }

        for edge in &config.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !by_id.contains_key(endpoint) {
                    return Err(WorkflowError::InvalidWorkflow(format!(
                        "edge references unknown node '{endpoint}'"
                    )));
                }
            }
        }

        let start_nodes: Vec<&Node> = parsed
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Start))
            .collect();
        if start_nodes.len() != 1 {
            return Err(WorkflowError::InvalidWorkflow(format!(
                "workflow needs exactly one start node, found {}",
                start_nodes.len()
            )));
        }
        let start_node_id = start_nodes[0].id.clone();

        let end_node_ids: Vec<String> = parsed
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::End(_)))
            .map(|n| n.id.clone())
            .collect();
        if end_node_ids.is_empty() {
            return Err(WorkflowError::InvalidWorkflow(
                "workflow needs at least one end node".to_string(),
            ));
        }

        let order = topological_order(&parsed, &config.edges, &by_id)?;
        let nodes: Vec<Node> = order.into_iter().map(|i| parsed[i].clone()).collect();
        let index: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();

        let streamable_pairs = streamable_pairs(&nodes, &config.edges, &index);

        Ok(Self {
            nodes,
            edges: config.edges,
            variables: config.variables,
            start_node_id,
            end_node_ids,
            streamable_pairs,
            index,
        })
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|i| &self.nodes[*i])
    }

    /// Normal successors of a node, with their branch handles
    pub fn successors(&self, id: &str) -> impl Iterator<Item = &EdgeSpec> {
        self.edges
            .iter()
            .filter(move |e| e.source == id && !e.is_error())
    }

    /// Error edge of a node, when declared
    pub fn error_edge(&self, id: &str) -> Option<&EdgeSpec> {
        self.edges.iter().find(|e| e.source == id && e.is_error())
    }
}

/// Kahn's algorithm; a leftover node means a cycle
fn topological_order(
    nodes: &[Node],
    edges: &[EdgeSpec],
    by_id: &HashMap<String, usize>,
) -> Result<Vec<usize>> {
    let mut indegree = vec![0_usize; nodes.len()];
    let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for edge in edges {
        let source = by_id[&edge.source];
        let target = by_id[&edge.target];
        outgoing[source].push(target);
        indegree[target] += 1;
    }

    // Stable order: ready nodes keep their declaration order
    let mut ready: VecDeque<usize> = (0..nodes.len()).filter(|i| indegree[*i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(current) = ready.pop_front() {
        order.push(current);
        for &next in &outgoing[current] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push_back(next);
            }
        }
    }

    if order.len() != nodes.len() {
        return Err(WorkflowError::InvalidWorkflow(
            "workflow contains a cycle outside a loop scope".to_string(),
        ));
    }
    Ok(order)
}

/// (producer, end) pairs connected by at least one branch-free path
///
/// Whenever such a producer runs, activation propagates unconditionally down
/// that path, so the End node is guaranteed to run and its cursor may accept
/// live chunks from the producer.
fn streamable_pairs(
    nodes: &[Node],
    edges: &[EdgeSpec],
    index: &HashMap<String, usize>,
) -> HashSet<(String, String)> {
    let mut pairs = HashSet::new();
    for node in nodes {
        if !matches!(node.kind, NodeKind::Llm(_)) {
            continue;
        }
        // BFS over normal edges through non-branch intermediates
        let mut queue = VecDeque::from([node.id.clone()]);
        let mut seen = HashSet::new();
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            for edge in edges.iter().filter(|e| e.source == current && !e.is_error()) {
                let target = &nodes[index[&edge.target]];
                match &target.kind {
                    NodeKind::End(_) => {
                        pairs.insert((node.id.clone(), target.id.clone()));
                    }
                    kind if kind.is_branch() => {}
                    _ => queue.push_back(target.id.clone()),
                }
            }
        }
    }
    pairs
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::NodeSpec;
    use serde_json::json;

    fn spec(id: &str, node_type: &str, config: serde_json::Value) -> NodeSpec {
        NodeSpec {
            id: id.to_string(),
            node_type: node_type.to_string(),
            name: None,
            config,
        }
    }

    fn edge(source: &str, target: &str) -> EdgeSpec {
        EdgeSpec {
            source: source.to_string(),
            target: target.to_string(),
            edge_type: String::new(),
            branch: None,
        }
    }

    fn linear_config() -> WorkflowConfig {
        WorkflowConfig {
            nodes: vec![
                spec("start", "start", json!({})),
                spec("llm1", "llm", json!({"user_prompt": "{{sys.message}}", "streaming": true})),
                spec("end", "end", json!({"outputs": ["{{llm1.output}}"]})),
            ],
            edges: vec![edge("start", "llm1"), edge("llm1", "end")],
            variables: vec![],
        }
    }

    #[test]
    fn test_build_linear_graph() {
        let graph = WorkflowGraph::build(linear_config()).unwrap();
        assert_eq!(graph.start_node_id, "start");
        assert_eq!(graph.end_node_ids, vec!["end"]);
        let ids: Vec<&str> = graph.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["start", "llm1", "end"]);
        assert!(graph
            .streamable_pairs
            .contains(&("llm1".to_string(), "end".to_string())));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut config = linear_config();
        config.edges.push(edge("end", "llm1"));
        assert!(matches!(
            WorkflowGraph::build(config),
            Err(WorkflowError::InvalidWorkflow(_))
        ));
    }

    #[test]
    fn test_missing_start_rejected() {
        let config = WorkflowConfig {
            nodes: vec![spec("end", "end", json!({"outputs": ["x"]}))],
            edges: vec![],
            variables: vec![],
        };
        assert!(WorkflowGraph::build(config).is_err());
    }

    #[test]
    fn test_unknown_edge_endpoint_rejected() {
        let mut config = linear_config();
        config.edges.push(edge("llm1", "ghost"));
        assert!(WorkflowGraph::build(config).is_err());
    }

    #[test]
    fn test_branch_breaks_streamability() {
        let config = WorkflowConfig {
            nodes: vec![
                spec("start", "start", json!({})),
                spec("llm1", "llm", json!({"user_prompt": "p", "streaming": true})),
                spec(
                    "branch",
                    "if-else",
                    json!({"cases": [{"logical_operator": "and", "expressions": [{
                        "left": "{{llm1.output}}", "operator": "not_empty", "right": null,
                        "input_type": "constant"
                    }]}]}),
                ),
                spec("end", "end", json!({"outputs": ["{{llm1.output}}"]})),
            ],
            edges: vec![
                edge("start", "llm1"),
                edge("llm1", "branch"),
                EdgeSpec {
                    source: "branch".to_string(),
                    target: "end".to_string(),
                    edge_type: String::new(),
                    branch: Some("CASE1".to_string()),
                },
            ],
            variables: vec![],
        };
        let graph = WorkflowGraph::build(config).unwrap();
        // The only path runs through a branch node: no live streaming
        assert!(graph.streamable_pairs.is_empty());
    }
}
