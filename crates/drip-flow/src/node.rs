use serde::{Deserialize, Serialize};

/// A node in a validated flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
  pub id: String,
  #[serde(flatten)]
  pub kind: NodeKind,
}

/// The closed set of node kinds the engine can execute.
///
/// Adding a kind here forces every `match` in the engine to be revisited;
/// there is deliberately no open/dynamic dispatch over node types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
  /// Send a message and advance immediately.
  Message {
    text: String,
    /// When false the text is sent verbatim, without template rendering.
    allow_variables: bool,
  },
  /// Branch on a variable binding via the `yes`/`no` edges.
  Condition {
    variable: String,
    operator: Operator,
    operand: String,
  },
  /// Suspend until a reply arrives or the timeout elapses.
  ///
  /// A timeout of zero means "wait indefinitely": no timer is scheduled and
  /// only a reply advances the instance.
  Wait { timeout_seconds: u64 },
}

/// Comparison operators for Condition nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
  Equals,
  Contains,
  StartsWith,
  EndsWith,
  GreaterThan,
  LessThan,
  Exists,
}

/// Label on an outgoing edge that disambiguates a branching node's successors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeTag {
  Yes,
  No,
  Reply,
  Timeout,
}

impl std::fmt::Display for EdgeTag {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      EdgeTag::Yes => "yes",
      EdgeTag::No => "no",
      EdgeTag::Reply => "reply",
      EdgeTag::Timeout => "timeout",
    };
    f.write_str(s)
  }
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
  pub id: String,
  pub source: String,
  pub target: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tag: Option<EdgeTag>,
  /// Marks a deliberate back edge (a Wait timeout looping to an earlier
  /// node). Edges without this flag must not form cycles.
  #[serde(default)]
  pub allow_loop: bool,
}
