//! Drip Store
//!
//! Persistence for the execution engine: one record per execution instance,
//! one record per published flow version, one record per outbound send.
//! Exposed through the [`Store`] trait with two implementations: an
//! in-memory reference store ([`MemoryStore`]) and a SQLite store
//! ([`SqliteStore`]).
//!
//! The store is the engine's single source of truth. Two operations carry
//! the concurrency contract:
//! - [`Store::update_instance`] compare-and-swaps on the instance revision;
//!   a stale write returns [`Error::Conflict`], which is how the engine
//!   durably claims one event at a time per instance.
//! - [`Store::record_send`] inserts the `(instance_id, node_id)` dedup key;
//!   a replayed event finds the key and produces zero transport calls.

mod memory;
mod sqlite;
mod types;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::{ExecutionInstance, FlowRecord, InstanceStatus, SendRecord, SendStatus};

/// JSON column wrapper, re-exported so callers building records do not need
/// a direct sqlx dependency.
pub use sqlx::types::Json;

use async_trait::async_trait;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// A write lost a compare-and-swap race, or would violate the
  /// one-non-terminal-instance-per-(flow, contact) invariant.
  #[error("conflict: {0}")]
  Conflict(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
}

/// Storage trait for flows, execution instances, and send records.
#[async_trait]
pub trait Store: Send + Sync {
  /// Publish a flow version. Versions are immutable; publishing the same
  /// `(flow_id, version)` twice is a conflict.
  async fn publish_flow(&self, flow: &FlowRecord) -> Result<(), Error>;

  /// Get a published flow version.
  async fn get_flow(&self, flow_id: &str, version: i64) -> Result<FlowRecord, Error>;

  /// Get the active version of a flow, if any.
  async fn get_active_flow(&self, flow_id: &str) -> Result<Option<FlowRecord>, Error>;

  /// Mark a flow version active or inactive. At most one version of a flow
  /// is active at a time; activating one deactivates the others.
  async fn set_flow_active(&self, flow_id: &str, version: i64, active: bool) -> Result<(), Error>;

  /// Create a new execution instance. Fails with [`Error::Conflict`] if a
  /// non-terminal instance already exists for the same (flow, contact).
  async fn create_instance(&self, instance: &ExecutionInstance) -> Result<(), Error>;

  /// Get an instance by id.
  async fn get_instance(&self, instance_id: &str) -> Result<ExecutionInstance, Error>;

  /// Persist a new instance state, compare-and-swapping on the revision the
  /// caller read. On success the stored revision becomes
  /// `expected_revision + 1`; a stale `expected_revision` returns
  /// [`Error::Conflict`] and nothing is written.
  async fn update_instance(
    &self,
    instance: &ExecutionInstance,
    expected_revision: i64,
  ) -> Result<(), Error>;

  /// Find the instance waiting for a reply from this contact, if any. A
  /// contact can wait in several flows at once (the uniqueness invariant is
  /// per flow); the instance that has been waiting longest wins, with the
  /// instance id as a stable tie break.
  async fn find_waiting_for_contact(
    &self,
    contact_id: &str,
  ) -> Result<Option<ExecutionInstance>, Error>;

  /// All instances waiting with a deadline; scheduler recovery after a
  /// restart rebuilds its timers from this.
  async fn list_pending_timers(&self) -> Result<Vec<ExecutionInstance>, Error>;

  /// All instances bound to any version of a flow, for deactivation sweeps.
  async fn list_instances_for_flow(&self, flow_id: &str) -> Result<Vec<ExecutionInstance>, Error>;

  /// Insert a send record keyed by `(instance_id, node_id)`. Returns `true`
  /// if inserted, `false` if the key already existed (duplicate send).
  async fn record_send(&self, record: &SendRecord) -> Result<bool, Error>;

  /// Attach the provider message id and status after a transport send.
  async fn mark_send_result(
    &self,
    send_id: &str,
    provider_message_id: Option<&str>,
    status: SendStatus,
  ) -> Result<(), Error>;

  /// Update delivery status from a provider status callback.
  async fn update_send_status(
    &self,
    provider_message_id: &str,
    status: SendStatus,
  ) -> Result<(), Error>;
}
