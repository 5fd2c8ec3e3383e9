use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::doc::FlowDoc;
use crate::node::{Edge, EdgeTag, Node};
use crate::validate::{GraphError, validate};

/// A validated, immutable flow graph ready for execution.
///
/// Only constructible through [`FlowGraph::build`] (or [`FlowGraph::from_doc`]),
/// so holding one is proof the structural invariants were checked: one entry
/// point, complete branch tags, no unmarked cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowGraph {
  flow_id: String,
  version: u32,
  nodes: HashMap<String, Node>,
  outgoing: HashMap<String, Vec<Edge>>,
  entry: String,
}

impl FlowGraph {
  /// Validate nodes and edges into a graph.
  pub fn build(
    flow_id: impl Into<String>,
    version: u32,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
  ) -> Result<Self, Vec<GraphError>> {
    let entry = validate(&nodes, &edges)?;

    let mut outgoing: HashMap<String, Vec<Edge>> = HashMap::new();
    for edge in edges {
      outgoing.entry(edge.source.clone()).or_default().push(edge);
    }

    Ok(Self {
      flow_id: flow_id.into(),
      version,
      nodes: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
      outgoing,
      entry,
    })
  }

  /// Normalize and validate an editor document in one step.
  pub fn from_doc(doc: &FlowDoc) -> Result<Self, Vec<GraphError>> {
    let (nodes, edges) = doc.normalize()?;
    Self::build(doc.id.clone(), doc.version, nodes, edges)
  }

  pub fn flow_id(&self) -> &str {
    &self.flow_id
  }

  pub fn version(&self) -> u32 {
    self.version
  }

  /// The entry node: the unique node with no incoming edges.
  pub fn entry(&self) -> &str {
    &self.entry
  }

  pub fn node(&self, node_id: &str) -> Option<&Node> {
    self.nodes.get(node_id)
  }

  pub fn node_count(&self) -> usize {
    self.nodes.len()
  }

  /// The successor reached by following the edge with the given tag.
  pub fn successor(&self, node_id: &str, tag: EdgeTag) -> Option<&str> {
    self
      .outgoing
      .get(node_id)?
      .iter()
      .find(|e| e.tag == Some(tag))
      .map(|e| e.target.as_str())
  }

  /// The single untagged successor of a non-branching node, if any.
  /// `None` means the node is terminal.
  pub fn sole_successor(&self, node_id: &str) -> Option<&str> {
    self
      .outgoing
      .get(node_id)?
      .iter()
      .find(|e| e.tag.is_none())
      .map(|e| e.target.as_str())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::node::NodeKind;
  use serde_json::json;

  #[test]
  fn builds_from_editor_document() {
    let doc: FlowDoc = serde_json::from_value(json!({
      "id": "flow-1",
      "name": "welcome",
      "version": 1,
      "nodes": [
        {"id": "m1", "type": "messageNode", "data": {"content": "Hello {{name}}!"}},
        {"id": "w1", "type": "waitNode", "data": {"waitTime": 30, "waitUnit": "seconds"}},
        {"id": "m2", "type": "messageNode", "data": {"content": "Thanks"}},
        {"id": "m3", "type": "messageNode", "data": {"content": "Still there?"}}
      ],
      "edges": [
        {"id": "e1", "source": "m1", "target": "w1"},
        {"id": "e2", "source": "w1", "target": "m2", "sourceHandle": "reply"},
        {"id": "e3", "source": "w1", "target": "m3", "sourceHandle": "timeout"}
      ]
    }))
    .unwrap();

    let graph = FlowGraph::from_doc(&doc).unwrap();
    assert_eq!(graph.entry(), "m1");
    assert_eq!(graph.sole_successor("m1"), Some("w1"));
    assert_eq!(graph.successor("w1", EdgeTag::Reply), Some("m2"));
    assert_eq!(graph.successor("w1", EdgeTag::Timeout), Some("m3"));
    assert_eq!(graph.sole_successor("m2"), None);
    assert!(matches!(
      graph.node("w1").unwrap().kind,
      NodeKind::Wait { timeout_seconds: 30 }
    ));
  }
}
