use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;

/// Status of an execution instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum InstanceStatus {
  Running,
  WaitingForReply,
  Completed,
  Aborted,
}

impl InstanceStatus {
  /// Completed and Aborted instances never advance again.
  pub fn is_terminal(self) -> bool {
    matches!(self, InstanceStatus::Completed | InstanceStatus::Aborted)
  }
}

/// One contact's progress through one flow version.
///
/// Mutated exclusively by the execution engine, and only through
/// [`Store::update_instance`](crate::Store::update_instance), which
/// compare-and-swaps on `revision`. A stale revision means another event was
/// durably claimed first and the writer must discard its work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ExecutionInstance {
  pub instance_id: String,
  pub flow_id: String,
  pub flow_version: i64,
  pub contact_id: String,
  pub current_node_id: String,
  pub bindings: Json<HashMap<String, String>>,
  pub status: InstanceStatus,
  pub wait_deadline: Option<DateTime<Utc>>,
  pub last_error: Option<String>,
  pub revision: i64,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl ExecutionInstance {
  /// Create a fresh Running instance positioned at the flow's entry node.
  pub fn new(
    flow_id: impl Into<String>,
    flow_version: i64,
    contact_id: impl Into<String>,
    entry_node_id: impl Into<String>,
    bindings: HashMap<String, String>,
  ) -> Self {
    let now = Utc::now();
    Self {
      instance_id: uuid::Uuid::new_v4().to_string(),
      flow_id: flow_id.into(),
      flow_version,
      contact_id: contact_id.into(),
      current_node_id: entry_node_id.into(),
      bindings: Json(bindings),
      status: InstanceStatus::Running,
      wait_deadline: None,
      last_error: None,
      revision: 0,
      created_at: now,
      updated_at: now,
    }
  }
}

/// Delivery status of an outbound send, as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SendStatus {
  Queued,
  Sent,
  Delivered,
  Read,
  Failed,
}

/// A persisted outbound send. The `(instance_id, node_id)` pair is the dedup
/// key: re-processing an event after a crash finds the record and skips the
/// transport call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SendRecord {
  pub send_id: String,
  pub instance_id: String,
  pub node_id: String,
  pub contact_id: String,
  pub body: String,
  pub provider_message_id: Option<String>,
  pub status: SendStatus,
  pub created_at: DateTime<Utc>,
}

impl SendRecord {
  pub fn new(
    instance_id: impl Into<String>,
    node_id: impl Into<String>,
    contact_id: impl Into<String>,
    body: impl Into<String>,
  ) -> Self {
    Self {
      send_id: uuid::Uuid::new_v4().to_string(),
      instance_id: instance_id.into(),
      node_id: node_id.into(),
      contact_id: contact_id.into(),
      body: body.into(),
      provider_message_id: None,
      status: SendStatus::Queued,
      created_at: Utc::now(),
    }
  }
}

/// A published flow version. Immutable once published; editing a flow
/// publishes a new version, it never rewrites an existing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct FlowRecord {
  pub flow_id: String,
  pub version: i64,
  pub name: String,
  /// The validated flow graph, stored as JSON.
  pub document: Json<serde_json::Value>,
  pub active: bool,
  pub published_at: DateTime<Utc>,
}
