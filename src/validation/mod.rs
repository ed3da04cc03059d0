//! Workflow graph validation
//!
//! Gates every enqueue: acyclicity, single entry, full reachability, terminal
//! action rule, schema-valid configuration. Validation collects every
//! violation rather than stopping at the first, and fails closed: one
//! violation prevents execution.

use crate::error::{EngineError, EngineResult};
use crate::model::{BlockType, NodeId, Workflow};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// One violated graph invariant, serialized for the HTTP 400 body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Violation {
    #[serde(rename = "EMPTY")]
    Empty,
    #[serde(rename = "CYCLE")]
    Cycle {
        #[serde(rename = "nodeId")]
        node_id: NodeId,
    },
    #[serde(rename = "ORPHAN")]
    Orphan {
        #[serde(rename = "nodeId")]
        node_id: NodeId,
    },
    #[serde(rename = "MULTIPLE_ENTRIES")]
    MultipleEntries {
        #[serde(rename = "nodeIds")]
        node_ids: Vec<NodeId>,
    },
    #[serde(rename = "NO_ENTRY")]
    NoEntry,
    #[serde(rename = "TERMINAL_NOT_ACTION")]
    TerminalNotAction {
        #[serde(rename = "nodeId")]
        node_id: NodeId,
    },
    #[serde(rename = "DUPLICATE_NODE")]
    DuplicateNode {
        #[serde(rename = "nodeId")]
        node_id: NodeId,
    },
    #[serde(rename = "CONFIG_INVALID")]
    ConfigInvalid {
        #[serde(rename = "nodeId")]
        node_id: NodeId,
        field: String,
        reason: String,
    },
    #[serde(rename = "MISSING_CONFIG")]
    MissingConfig {
        #[serde(rename = "nodeId")]
        node_id: NodeId,
        field: String,
    },
    #[serde(rename = "UNKNOWN_REFERENCE")]
    UnknownReference {
        #[serde(rename = "edgeId")]
        edge_id: String,
        endpoint: String,
    },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Violation::Empty => write!(f, "workflow has no nodes"),
            Violation::Cycle { node_id } => write!(f, "cycle through node {}", node_id),
            Violation::Orphan { node_id } => {
                write!(f, "node {} is unreachable from the entry", node_id)
            }
            Violation::MultipleEntries { node_ids } => {
                write!(f, "multiple entry nodes: {}", node_ids.join(", "))
            }
            Violation::NoEntry => write!(f, "no entry node"),
            Violation::TerminalNotAction { node_id } => {
                write!(f, "terminal node {} is not an action block", node_id)
            }
            Violation::DuplicateNode { node_id } => {
                write!(f, "duplicate node id {}", node_id)
            }
            Violation::ConfigInvalid {
                node_id,
                field,
                reason,
            } => write!(f, "node {} config field {}: {}", node_id, field, reason),
            Violation::MissingConfig { node_id, field } => {
                write!(f, "node {} missing required config field {}", node_id, field)
            }
            Violation::UnknownReference { edge_id, endpoint } => {
                write!(f, "edge {} references unknown {}", edge_id, endpoint)
            }
        }
    }
}

/// Validate every graph invariant, collecting all violations.
pub fn validate(workflow: &Workflow) -> Result<(), Vec<Violation>> {
    let mut violations = Vec::new();

    if workflow.nodes.is_empty() {
        return Err(vec![Violation::Empty]);
    }

    let mut ids: HashSet<&str> = HashSet::with_capacity(workflow.nodes.len());
    for node in &workflow.nodes {
        if !ids.insert(node.id.as_str()) {
            violations.push(Violation::DuplicateNode {
                node_id: node.id.clone(),
            });
        }
    }

    // Edge endpoints must reference existing nodes; dangling edges are
    // excluded from the structural checks below.
    let mut edges_ok = Vec::with_capacity(workflow.edges.len());
    for edge in &workflow.edges {
        let mut dangling = false;
        if !ids.contains(edge.source.as_str()) {
            violations.push(Violation::UnknownReference {
                edge_id: edge.id.clone(),
                endpoint: "source".to_string(),
            });
            dangling = true;
        }
        if !ids.contains(edge.target.as_str()) {
            violations.push(Violation::UnknownReference {
                edge_id: edge.id.clone(),
                endpoint: "target".to_string(),
            });
            dangling = true;
        }
        if !dangling {
            edges_ok.push(edge);
        }
    }

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut out_degree: HashMap<&str, usize> = HashMap::new();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in &workflow.nodes {
        in_degree.entry(node.id.as_str()).or_insert(0);
        out_degree.entry(node.id.as_str()).or_insert(0);
        adjacency.entry(node.id.as_str()).or_default();
    }
    for edge in &edges_ok {
        *in_degree.entry(edge.target.as_str()).or_insert(0) += 1;
        *out_degree.entry(edge.source.as_str()).or_insert(0) += 1;
        adjacency
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
    }

    if let Some(node_id) = find_cycle(workflow, &adjacency) {
        violations.push(Violation::Cycle { node_id });
    }

    // Entry rule: exactly one node with in-degree zero.
    let mut entries: Vec<&str> = workflow
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| in_degree.get(id).copied().unwrap_or(0) == 0)
        .collect();
    entries.sort_unstable();
    entries.dedup();
    match entries.len() {
        0 => violations.push(Violation::NoEntry),
        1 => {
            for node_id in unreachable_from(entries[0], workflow, &adjacency) {
                violations.push(Violation::Orphan { node_id });
            }
        }
        _ => violations.push(Violation::MultipleEntries {
            node_ids: entries.iter().map(|s| s.to_string()).collect(),
        }),
    }

    // Terminal rule: out-degree zero requires an Action block.
    for node in &workflow.nodes {
        if out_degree.get(node.id.as_str()).copied().unwrap_or(0) == 0
            && !node.block_type.is_action()
        {
            violations.push(Violation::TerminalNotAction {
                node_id: node.id.clone(),
            });
        }
    }

    validate_configs(workflow, &mut violations);

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

/// Schema-check every node's configuration. Required fields must be present;
/// typed fields must match unless the value carries a template expression
/// that only resolves at run time.
fn validate_configs(workflow: &Workflow, violations: &mut Vec<Violation>) {
    for node in &workflow.nodes {
        if node.block_type == BlockType::Unknown {
            violations.push(Violation::ConfigInvalid {
                node_id: node.id.clone(),
                field: "blockType".to_string(),
                reason: "unknown block type".to_string(),
            });
            continue;
        }
        let schema = node.block_type.schema();
        for field in &schema.config {
            match node.config.get(&field.name) {
                None => {
                    if field.required {
                        violations.push(Violation::MissingConfig {
                            node_id: node.id.clone(),
                            field: field.name.clone(),
                        });
                    }
                }
                Some(value) => {
                    if is_templated(value) {
                        continue;
                    }
                    if !field.ty.accepts(value) {
                        violations.push(Violation::ConfigInvalid {
                            node_id: node.id.clone(),
                            field: field.name.clone(),
                            reason: format!("expected {:?}", field.ty),
                        });
                    }
                }
            }
        }
    }
}

fn is_templated(value: &serde_json::Value) -> bool {
    matches!(value, serde_json::Value::String(s) if s.contains("{{"))
}

/// Iterative three-color DFS; returns a node on a cycle, if any.
fn find_cycle(workflow: &Workflow, adjacency: &HashMap<&str, Vec<&str>>) -> Option<NodeId> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }
    let mut color: HashMap<&str, Color> = workflow
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), Color::White))
        .collect();

    // Deterministic scan order so reruns name the same cycle node.
    let mut roots: Vec<&str> = workflow.nodes.iter().map(|n| n.id.as_str()).collect();
    roots.sort_unstable();

    for root in roots {
        if color[root] != Color::White {
            continue;
        }
        // Stack frames carry the node and its next child index.
        let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
        color.insert(root, Color::Gray);
        while let Some((node, idx)) = stack.pop() {
            let children = adjacency.get(node).map(|v| v.as_slice()).unwrap_or(&[]);
            if idx < children.len() {
                stack.push((node, idx + 1));
                let child = children[idx];
                match color[child] {
                    Color::Gray => return Some(child.to_string()),
                    Color::White => {
                        color.insert(child, Color::Gray);
                        stack.push((child, 0));
                    }
                    Color::Black => {}
                }
            } else {
                color.insert(node, Color::Black);
            }
        }
    }
    None
}

/// BFS from the entry; returns every node not reached, sorted.
fn unreachable_from(
    entry: &str,
    workflow: &Workflow,
    adjacency: &HashMap<&str, Vec<&str>>,
) -> Vec<NodeId> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue = VecDeque::new();
    seen.insert(entry);
    queue.push_back(entry);
    while let Some(node) = queue.pop_front() {
        for child in adjacency.get(node).map(|v| v.as_slice()).unwrap_or(&[]) {
            if seen.insert(child) {
                queue.push_back(child);
            }
        }
    }
    let mut missing: Vec<NodeId> = workflow
        .nodes
        .iter()
        .map(|n| n.id.clone())
        .filter(|id| !seen.contains(id.as_str()))
        .collect();
    missing.sort_unstable();
    missing.dedup();
    missing
}

/// Deterministic linear extension: Kahn's algorithm, ties broken by
/// ascending node id so reruns dispatch in the same order.
pub fn topological_order(workflow: &Workflow) -> EngineResult<Vec<NodeId>> {
    let mut in_degree: HashMap<&str, usize> = workflow
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), 0))
        .collect();
    for edge in &workflow.edges {
        if let Some(count) = in_degree.get_mut(edge.target.as_str()) {
            *count += 1;
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, &count)| count == 0)
        .map(|(&id, _)| id)
        .collect();

    let mut order = Vec::with_capacity(workflow.nodes.len());
    while let Some(&next) = ready.iter().next() {
        ready.remove(next);
        order.push(next.to_string());
        for edge in workflow.edges.iter().filter(|e| e.source == next) {
            if let Some(count) = in_degree.get_mut(edge.target.as_str()) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(edge.target.as_str());
                }
            }
        }
    }

    if order.len() != workflow.nodes.len() {
        return Err(EngineError::Validation(
            "workflow contains a cycle".to_string(),
        ));
    }
    Ok(order)
}
