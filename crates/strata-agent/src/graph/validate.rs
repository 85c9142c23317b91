use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use strata_core::error::{Result, StrataError};
use strata_core::types::{GraphEdge, GraphNode, PositionConstraint, WorkflowGraph};
use strata_tools::ToolRegistry;

/// A workflow graph that passed validation, with its execution order fixed.
#[derive(Debug, Clone)]
pub struct ValidatedGraph {
    /// Node ids in topological order, entry first and terminal last.
    pub order: Vec<String>,
    nodes: HashMap<String, GraphNode>,
    outgoing: HashMap<String, Vec<GraphEdge>>,
    critical: HashSet<String>,
    entry: String,
    terminal: String,
}

impl ValidatedGraph {
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn outgoing(&self, id: &str) -> &[GraphEdge] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Entry and terminal nodes; their failure fails the execution.
    pub fn is_critical(&self, id: &str) -> bool {
        self.critical.contains(id)
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn terminal(&self) -> &str {
        &self.terminal
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

fn invalid(msg: impl Into<String>) -> StrataError {
    StrataError::GraphValidation(msg.into())
}

/// Topologically sort with Kahn's algorithm.
///
/// Ready nodes are taken in declaration order, so the result is deterministic.
/// When the graph has a cycle the returned order is shorter than the node list.
pub fn topological_order(graph: &WorkflowGraph) -> Vec<String> {
    let index: HashMap<&str, usize> = graph
        .nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; graph.nodes.len()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); graph.nodes.len()];
    for edge in &graph.edges {
        if let (Some(&s), Some(&t)) = (index.get(edge.source.as_str()), index.get(edge.target.as_str())) {
            successors[s].push(t);
            in_degree[t] += 1;
        }
    }

    let mut ready: BTreeSet<usize> = (0..graph.nodes.len()).filter(|i| in_degree[*i] == 0).collect();
    let mut order = Vec::with_capacity(graph.nodes.len());
    while let Some(i) = ready.pop_first() {
        order.push(graph.nodes[i].id.clone());
        for &t in &successors[i] {
            in_degree[t] -= 1;
            if in_degree[t] == 0 {
                ready.insert(t);
            }
        }
    }
    order
}

/// Validate a declared graph against the tool registry. Fails closed.
pub fn validate(graph: &WorkflowGraph, tools: &ToolRegistry) -> Result<ValidatedGraph> {
    if graph.nodes.is_empty() {
        return Err(invalid("graph has no nodes"));
    }

    let mut nodes = HashMap::new();
    for node in &graph.nodes {
        if nodes.insert(node.id.clone(), node.clone()).is_some() {
            return Err(invalid(format!("duplicate node id '{}'", node.id)));
        }
    }

    for edge in &graph.edges {
        for end in [&edge.source, &edge.target] {
            if !nodes.contains_key(end) {
                return Err(invalid(format!(
                    "edge {} -> {} references unknown node '{}'",
                    edge.source, edge.target, end
                )));
            }
        }
    }

    let mut entries = Vec::new();
    let mut terminals = Vec::new();
    let mut conditional = HashSet::new();
    for node in &graph.nodes {
        let tool = tools.get(&node.tool).ok_or_else(|| {
            invalid(format!("node '{}' references unknown tool '{}'", node.id, node.tool))
        })?;
        match tool.position() {
            PositionConstraint::MustBeFirst => entries.push(node.id.clone()),
            PositionConstraint::MustBeLast => terminals.push(node.id.clone()),
            PositionConstraint::Any => {}
        }
        if tool.conditional() {
            conditional.insert(node.id.clone());
        }
    }
    let entry = match entries.as_slice() {
        [one] => one.clone(),
        [] => return Err(invalid("graph has no entry node (must_be_first tool)")),
        many => return Err(invalid(format!("graph has multiple entry nodes: {}", many.join(", ")))),
    };
    let terminal = match terminals.as_slice() {
        [one] => one.clone(),
        [] => return Err(invalid("graph has no terminal node (must_be_last tool)")),
        many => {
            return Err(invalid(format!(
                "graph has multiple terminal nodes: {}",
                many.join(", ")
            )))
        }
    };

    for edge in &graph.edges {
        if edge.branch.is_some() && !conditional.contains(&edge.source) {
            return Err(invalid(format!(
                "edge {} -> {} has a branch label but '{}' is not a conditional node",
                edge.source, edge.target, edge.source
            )));
        }
    }

    let order = topological_order(graph);
    if order.len() != graph.nodes.len() {
        return Err(invalid(format!(
            "graph contains a cycle ({} of {} nodes sortable)",
            order.len(),
            graph.nodes.len()
        )));
    }

    let mut outgoing: HashMap<String, Vec<GraphEdge>> = HashMap::new();
    let mut has_incoming = HashSet::new();
    for edge in &graph.edges {
        outgoing.entry(edge.source.clone()).or_default().push(edge.clone());
        has_incoming.insert(edge.target.clone());
    }

    if has_incoming.contains(&entry) {
        return Err(invalid(format!("entry node '{entry}' has incoming edges")));
    }
    if outgoing.contains_key(&terminal) {
        return Err(invalid(format!("terminal node '{terminal}' has outgoing edges")));
    }
    if order.first() != Some(&entry) {
        return Err(invalid(format!(
            "entry node '{entry}' is not first in execution order"
        )));
    }
    if order.last() != Some(&terminal) {
        return Err(invalid(format!(
            "terminal node '{terminal}' is not last in execution order"
        )));
    }

    // Every node must be reachable from the entry
    let mut seen = HashSet::from([entry.clone()]);
    let mut queue = VecDeque::from([entry.clone()]);
    while let Some(id) = queue.pop_front() {
        for edge in outgoing.get(&id).map(Vec::as_slice).unwrap_or(&[]) {
            if seen.insert(edge.target.clone()) {
                queue.push_back(edge.target.clone());
            }
        }
    }
    if let Some(orphan) = order.iter().find(|id| !seen.contains(*id)) {
        return Err(invalid(format!(
            "node '{orphan}' is not reachable from entry node '{entry}'"
        )));
    }

    let critical = HashSet::from([entry.clone(), terminal.clone()]);
    Ok(ValidatedGraph {
        order,
        nodes,
        outgoing,
        critical,
        entry,
        terminal,
    })
}
