//! The flow document as serialized by the editor.
//!
//! The editor's node `data` objects are loosely shaped and carry legacy field
//! aliases (`content` vs `message`, `waitTime` vs `timeout`). All of that
//! ambiguity is resolved here, in one normalization pass at the boundary; the
//! typed model and the engine never see it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::node::{Edge, EdgeTag, Node, NodeKind, Operator};
use crate::validate::{GraphError, GraphErrorReason};

/// A flow document received from the editor/CRUD layer. Read-only input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDoc {
  pub id: String,
  pub name: String,
  pub version: u32,
  pub nodes: Vec<DocNode>,
  pub edges: Vec<DocEdge>,
}

/// A node as drawn in the editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocNode {
  pub id: String,
  #[serde(rename = "type")]
  pub node_type: String,
  #[serde(default)]
  pub data: Value,
}

/// An edge as drawn in the editor. `source_handle` carries the branch tag
/// for Condition (`yes`/`no`) and Wait (`reply`/`timeout`) nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocEdge {
  pub id: String,
  pub source: String,
  pub target: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source_handle: Option<String>,
  #[serde(default)]
  pub allow_loop: bool,
}

impl FlowDoc {
  /// Parse a flow document from JSON.
  pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(raw)
  }

  /// Normalize the editor document into typed nodes and edges.
  ///
  /// Unknown node types, missing required fields, and unknown edge handles
  /// are reported as [`GraphError`]s; nothing is defaulted silently except
  /// the documented aliases.
  pub fn normalize(&self) -> Result<(Vec<Node>, Vec<Edge>), Vec<GraphError>> {
    let mut errors = Vec::new();
    let mut nodes = Vec::with_capacity(self.nodes.len());

    for doc_node in &self.nodes {
      match normalize_node(doc_node) {
        Ok(node) => nodes.push(node),
        Err(reason) => errors.push(GraphError {
          id: doc_node.id.clone(),
          reason,
        }),
      }
    }

    let mut edges = Vec::with_capacity(self.edges.len());
    for doc_edge in &self.edges {
      let tag = match doc_edge.source_handle.as_deref() {
        None => None,
        Some("yes") => Some(EdgeTag::Yes),
        Some("no") => Some(EdgeTag::No),
        Some("reply") => Some(EdgeTag::Reply),
        Some("timeout") => Some(EdgeTag::Timeout),
        Some(other) => {
          errors.push(GraphError {
            id: doc_edge.id.clone(),
            reason: GraphErrorReason::UnknownHandle {
              handle: other.to_string(),
            },
          });
          continue;
        }
      };
      edges.push(Edge {
        id: doc_edge.id.clone(),
        source: doc_edge.source.clone(),
        target: doc_edge.target.clone(),
        tag,
        allow_loop: doc_edge.allow_loop,
      });
    }

    if errors.is_empty() {
      Ok((nodes, edges))
    } else {
      Err(errors)
    }
  }
}

fn normalize_node(doc: &DocNode) -> Result<Node, GraphErrorReason> {
  let kind = match doc.node_type.as_str() {
    "messageNode" => normalize_message(&doc.data)?,
    "conditionNode" => normalize_condition(&doc.data)?,
    "waitNode" => normalize_wait(&doc.data)?,
    other => {
      return Err(GraphErrorReason::UnknownNodeType {
        node_type: other.to_string(),
      });
    }
  };
  Ok(Node {
    id: doc.id.clone(),
    kind,
  })
}

fn normalize_message(data: &Value) -> Result<NodeKind, GraphErrorReason> {
  // `content` is the current field; older documents used `message`.
  let text = data
    .get("content")
    .or_else(|| data.get("message"))
    .and_then(Value::as_str)
    .ok_or(GraphErrorReason::MissingField { field: "content" })?;
  let allow_variables = data
    .get("variables")
    .and_then(Value::as_bool)
    .unwrap_or(true);
  Ok(NodeKind::Message {
    text: text.to_string(),
    allow_variables,
  })
}

fn normalize_condition(data: &Value) -> Result<NodeKind, GraphErrorReason> {
  let variable = data
    .get("variable")
    .and_then(Value::as_str)
    .ok_or(GraphErrorReason::MissingField { field: "variable" })?;
  let operator = data
    .get("operator")
    .and_then(Value::as_str)
    .ok_or(GraphErrorReason::MissingField { field: "operator" })?;
  let operator = parse_operator(operator).ok_or(GraphErrorReason::UnknownOperator {
    operator: operator.to_string(),
  })?;
  // `value` in current documents, `operand` in older ones.
  let operand = data
    .get("value")
    .or_else(|| data.get("operand"))
    .and_then(Value::as_str)
    .unwrap_or_default();
  Ok(NodeKind::Condition {
    variable: variable.to_string(),
    operator,
    operand: operand.to_string(),
  })
}

/// Upper bound on a wait timeout (one year). Editor inputs are untrusted;
/// anything larger saturates here so downstream deadline arithmetic never
/// overflows.
const MAX_WAIT_SECONDS: u64 = 60 * 60 * 24 * 365;

fn normalize_wait(data: &Value) -> Result<NodeKind, GraphErrorReason> {
  // Current documents carry `waitTime` + `waitUnit`; legacy ones a bare
  // `timeout` in seconds.
  let timeout_seconds = if let Some(wait_time) = data.get("waitTime").and_then(Value::as_u64) {
    let unit = data.get("waitUnit").and_then(Value::as_str).unwrap_or("seconds");
    match unit {
      "seconds" => wait_time,
      "minutes" => wait_time.saturating_mul(60),
      "hours" => wait_time.saturating_mul(3600),
      other => {
        return Err(GraphErrorReason::UnknownWaitUnit {
          unit: other.to_string(),
        });
      }
    }
  } else if let Some(timeout) = data.get("timeout").and_then(Value::as_u64) {
    timeout
  } else {
    return Err(GraphErrorReason::MissingField { field: "waitTime" });
  };
  Ok(NodeKind::Wait {
    timeout_seconds: timeout_seconds.min(MAX_WAIT_SECONDS),
  })
}

fn parse_operator(raw: &str) -> Option<Operator> {
  let op = match raw {
    "equals" => Operator::Equals,
    "contains" => Operator::Contains,
    "startsWith" => Operator::StartsWith,
    "endsWith" => Operator::EndsWith,
    "greaterThan" => Operator::GreaterThan,
    "lessThan" => Operator::LessThan,
    "exists" => Operator::Exists,
    _ => return None,
  };
  Some(op)
}
