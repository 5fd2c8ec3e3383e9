//! Structural validation of a flow graph.
//!
//! Validation runs in stages; each stage only runs if the previous one was
//! clean, because later checks assume the earlier invariants (the cycle check
//! assumes edges reference real nodes, reachability assumes a single entry).

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use thiserror::Error;

use crate::node::{Edge, EdgeTag, Node, NodeKind};

/// A structural problem found in a flow document, tied to the offending
/// node or edge id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphError {
  /// The node or edge the error refers to. Empty for flow-level errors
  /// (e.g. a flow with no entry point at all).
  pub id: String,
  pub reason: GraphErrorReason,
}

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum GraphErrorReason {
  #[error("unknown node type: {node_type}")]
  UnknownNodeType { node_type: String },

  #[error("missing required field: {field}")]
  MissingField { field: &'static str },

  #[error("unknown operator: {operator}")]
  UnknownOperator { operator: String },

  #[error("unknown wait unit: {unit}")]
  UnknownWaitUnit { unit: String },

  #[error("unknown edge handle: {handle}")]
  UnknownHandle { handle: String },

  #[error("duplicate node id")]
  DuplicateNode,

  #[error("edge references unknown node: {node_id}")]
  UnknownNode { node_id: String },

  #[error("flow must have exactly one entry point")]
  MultipleOrNoEntryPoints,

  #[error("missing required {tag} edge")]
  MissingBranch { tag: EdgeTag },

  #[error("duplicate {tag} edge")]
  DuplicateBranch { tag: EdgeTag },

  #[error("edge tag {tag} is not valid for this node kind")]
  UnexpectedTag { tag: EdgeTag },

  #[error("outgoing edge from a branching node must carry a tag")]
  MissingTag,

  #[error("node has more than one outgoing edge")]
  TooManyOutgoing,

  #[error("edge closes a cycle (mark it allow_loop if intended)")]
  CycleDetected,

  #[error("node is unreachable from the entry point")]
  Unreachable,
}

/// Validate nodes and edges; on success returns the entry node id.
pub(crate) fn validate(nodes: &[Node], edges: &[Edge]) -> Result<String, Vec<GraphError>> {
  // Stage: node ids are unique, edges reference existing nodes.
  let mut errors = Vec::new();
  let mut node_ids: HashSet<&str> = HashSet::new();
  for node in nodes {
    if !node_ids.insert(node.id.as_str()) {
      errors.push(GraphError {
        id: node.id.clone(),
        reason: GraphErrorReason::DuplicateNode,
      });
    }
  }
  for edge in edges {
    for endpoint in [&edge.source, &edge.target] {
      if !node_ids.contains(endpoint.as_str()) {
        errors.push(GraphError {
          id: edge.id.clone(),
          reason: GraphErrorReason::UnknownNode {
            node_id: endpoint.clone(),
          },
        });
      }
    }
  }
  if !errors.is_empty() {
    return Err(errors);
  }

  // Stage: exactly one entry point. Loop-permitted back edges do not count
  // as incoming, otherwise a timeout looping to the first node would hide
  // the entry.
  let mut has_incoming: HashSet<&str> = HashSet::new();
  for edge in edges.iter().filter(|e| !e.allow_loop) {
    has_incoming.insert(edge.target.as_str());
  }
  let entries: Vec<&Node> = nodes
    .iter()
    .filter(|n| !has_incoming.contains(n.id.as_str()))
    .collect();
  if entries.len() != 1 {
    for node in &entries {
      errors.push(GraphError {
        id: node.id.clone(),
        reason: GraphErrorReason::MultipleOrNoEntryPoints,
      });
    }
    if entries.is_empty() {
      errors.push(GraphError {
        id: String::new(),
        reason: GraphErrorReason::MultipleOrNoEntryPoints,
      });
    }
    return Err(errors);
  }
  let entry = entries[0].id.clone();

  let mut outgoing: HashMap<&str, Vec<&Edge>> = HashMap::new();
  for edge in edges {
    outgoing.entry(edge.source.as_str()).or_default().push(edge);
  }

  // Stage: every node is reachable from the entry (loop edges count).
  let mut visited: HashSet<&str> = HashSet::new();
  let mut stack = vec![entry.as_str()];
  while let Some(id) = stack.pop() {
    if !visited.insert(id) {
      continue;
    }
    if let Some(out) = outgoing.get(id) {
      stack.extend(out.iter().map(|e| e.target.as_str()));
    }
  }
  for node in nodes {
    if !visited.contains(node.id.as_str()) {
      errors.push(GraphError {
        id: node.id.clone(),
        reason: GraphErrorReason::Unreachable,
      });
    }
  }
  if !errors.is_empty() {
    return Err(errors);
  }

  // Stage: tag completeness and uniqueness per node kind.
  for node in nodes {
    let out = outgoing.get(node.id.as_str()).map_or(&[][..], |v| v);
    let required: &[EdgeTag] = match node.kind {
      NodeKind::Condition { .. } => &[EdgeTag::Yes, EdgeTag::No],
      NodeKind::Wait { .. } => &[EdgeTag::Reply, EdgeTag::Timeout],
      NodeKind::Message { .. } => &[],
    };
    if required.is_empty() {
      // Non-branching: at most one untagged outgoing edge.
      for edge in out {
        if let Some(tag) = edge.tag {
          errors.push(GraphError {
            id: edge.id.clone(),
            reason: GraphErrorReason::UnexpectedTag { tag },
          });
        }
      }
      if out.iter().filter(|e| e.tag.is_none()).count() > 1 {
        errors.push(GraphError {
          id: node.id.clone(),
          reason: GraphErrorReason::TooManyOutgoing,
        });
      }
      continue;
    }
    for tag in required {
      match out.iter().filter(|e| e.tag == Some(*tag)).count() {
        0 => errors.push(GraphError {
          id: node.id.clone(),
          reason: GraphErrorReason::MissingBranch { tag: *tag },
        }),
        1 => {}
        _ => errors.push(GraphError {
          id: node.id.clone(),
          reason: GraphErrorReason::DuplicateBranch { tag: *tag },
        }),
      }
    }
    for edge in out {
      match edge.tag {
        Some(tag) if !required.contains(&tag) => errors.push(GraphError {
          id: edge.id.clone(),
          reason: GraphErrorReason::UnexpectedTag { tag },
        }),
        Some(_) => {}
        None => errors.push(GraphError {
          id: edge.id.clone(),
          reason: GraphErrorReason::MissingTag,
        }),
      }
    }
  }
  if !errors.is_empty() {
    return Err(errors);
  }

  // Stage: the graph is a DAG over edges not marked allow_loop.
  errors.extend(find_cycles(nodes, edges));
  if !errors.is_empty() {
    return Err(errors);
  }

  Ok(entry)
}

/// Depth-first cycle detection; reports the edge that closes each cycle.
fn find_cycles(nodes: &[Node], edges: &[Edge]) -> Vec<GraphError> {
  let mut outgoing: HashMap<&str, Vec<&Edge>> = HashMap::new();
  for edge in edges.iter().filter(|e| !e.allow_loop) {
    outgoing.entry(edge.source.as_str()).or_default().push(edge);
  }

  let mut errors = Vec::new();
  let mut done: HashSet<&str> = HashSet::new();
  for node in nodes {
    if done.contains(node.id.as_str()) {
      continue;
    }
    // Iterative DFS with an explicit path set for back-edge detection.
    let mut on_path: HashSet<&str> = HashSet::new();
    let mut stack: Vec<(&str, usize)> = vec![(node.id.as_str(), 0)];
    on_path.insert(node.id.as_str());
    while let Some((id, next_child)) = stack.pop() {
      let children = outgoing.get(id).map_or(&[][..], |v| v);
      if next_child < children.len() {
        stack.push((id, next_child + 1));
        let edge = children[next_child];
        let target = edge.target.as_str();
        if on_path.contains(target) {
          errors.push(GraphError {
            id: edge.id.clone(),
            reason: GraphErrorReason::CycleDetected,
          });
        } else if !done.contains(target) {
          on_path.insert(target);
          stack.push((target, 0));
        }
      } else {
        on_path.remove(id);
        done.insert(id);
      }
    }
  }
  errors
}
