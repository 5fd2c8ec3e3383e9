//! SQLite-backed store.

use async_trait::async_trait;
use chrono::Utc;
use std::str::FromStr;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::types::{ExecutionInstance, FlowRecord, SendRecord, SendStatus};
use crate::{Error, Store};

/// SQLite store implementation over an sqlx connection pool.
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if missing) a database at `url` and run the schema
  /// migration. Accepts any sqlite URL, e.g. `sqlite://drip.db` or
  /// `sqlite::memory:`.
  pub async fn connect(url: &str) -> Result<Self, Error> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// Create the schema. Idempotent.
  ///
  /// The partial unique index on `instances` enforces the
  /// one-non-terminal-instance-per-(flow, contact) invariant at the database
  /// level; the unique index on `sends` is the send dedup key.
  pub async fn migrate(&self) -> Result<(), Error> {
    sqlx::raw_sql(
      r#"
      CREATE TABLE IF NOT EXISTS flows (
        flow_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        name TEXT NOT NULL,
        document TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 0,
        published_at TEXT NOT NULL,
        PRIMARY KEY (flow_id, version)
      );

      CREATE TABLE IF NOT EXISTS instances (
        instance_id TEXT PRIMARY KEY,
        flow_id TEXT NOT NULL,
        flow_version INTEGER NOT NULL,
        contact_id TEXT NOT NULL,
        current_node_id TEXT NOT NULL,
        bindings TEXT NOT NULL,
        status TEXT NOT NULL,
        wait_deadline TEXT,
        last_error TEXT,
        revision INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
      );

      CREATE UNIQUE INDEX IF NOT EXISTS idx_instances_live
        ON instances (flow_id, contact_id)
        WHERE status IN ('running', 'waiting_for_reply');

      CREATE INDEX IF NOT EXISTS idx_instances_contact
        ON instances (contact_id, status);

      CREATE TABLE IF NOT EXISTS sends (
        send_id TEXT PRIMARY KEY,
        instance_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        contact_id TEXT NOT NULL,
        body TEXT NOT NULL,
        provider_message_id TEXT,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL
      );

      CREATE UNIQUE INDEX IF NOT EXISTS idx_sends_dedup
        ON sends (instance_id, node_id);
      "#,
    )
    .execute(&self.pool)
    .await?;
    Ok(())
  }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
  err
    .as_database_error()
    .is_some_and(|e| e.is_unique_violation())
}

#[async_trait]
impl Store for SqliteStore {
  async fn publish_flow(&self, flow: &FlowRecord) -> Result<(), Error> {
    let result = sqlx::query(
      r#"
      INSERT INTO flows (flow_id, version, name, document, active, published_at)
      VALUES (?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(&flow.flow_id)
    .bind(flow.version)
    .bind(&flow.name)
    .bind(&flow.document)
    .bind(flow.active)
    .bind(flow.published_at)
    .execute(&self.pool)
    .await;

    match result {
      Ok(_) => Ok(()),
      Err(e) if is_unique_violation(&e) => Err(Error::Conflict(format!(
        "flow {} version {} already published",
        flow.flow_id, flow.version
      ))),
      Err(e) => Err(e.into()),
    }
  }

  async fn get_flow(&self, flow_id: &str, version: i64) -> Result<FlowRecord, Error> {
    sqlx::query_as(
      r#"
      SELECT flow_id, version, name, document, active, published_at
      FROM flows
      WHERE flow_id = ? AND version = ?
      "#,
    )
    .bind(flow_id)
    .bind(version)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("flow {flow_id} version {version}")))
  }

  async fn get_active_flow(&self, flow_id: &str) -> Result<Option<FlowRecord>, Error> {
    Ok(
      sqlx::query_as(
        r#"
        SELECT flow_id, version, name, document, active, published_at
        FROM flows
        WHERE flow_id = ? AND active = 1
        "#,
      )
      .bind(flow_id)
      .fetch_optional(&self.pool)
      .await?,
    )
  }

  async fn set_flow_active(&self, flow_id: &str, version: i64, active: bool) -> Result<(), Error> {
    let mut tx = self.pool.begin().await?;
    sqlx::query("UPDATE flows SET active = 0 WHERE flow_id = ?")
      .bind(flow_id)
      .execute(&mut *tx)
      .await?;
    let result = sqlx::query("UPDATE flows SET active = ? WHERE flow_id = ? AND version = ?")
      .bind(active)
      .bind(flow_id)
      .bind(version)
      .execute(&mut *tx)
      .await?;
    if result.rows_affected() == 0 {
      return Err(Error::NotFound(format!("flow {flow_id} version {version}")));
    }
    tx.commit().await?;
    Ok(())
  }

  async fn create_instance(&self, instance: &ExecutionInstance) -> Result<(), Error> {
    let result = sqlx::query(
      r#"
      INSERT INTO instances (
        instance_id, flow_id, flow_version, contact_id, current_node_id,
        bindings, status, wait_deadline, last_error, revision, created_at, updated_at
      )
      VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(&instance.instance_id)
    .bind(&instance.flow_id)
    .bind(instance.flow_version)
    .bind(&instance.contact_id)
    .bind(&instance.current_node_id)
    .bind(&instance.bindings)
    .bind(instance.status)
    .bind(instance.wait_deadline)
    .bind(&instance.last_error)
    .bind(instance.revision)
    .bind(instance.created_at)
    .bind(instance.updated_at)
    .execute(&self.pool)
    .await;

    match result {
      Ok(_) => Ok(()),
      Err(e) if is_unique_violation(&e) => Err(Error::Conflict(format!(
        "contact {} already has a live instance of flow {}",
        instance.contact_id, instance.flow_id
      ))),
      Err(e) => Err(e.into()),
    }
  }

  async fn get_instance(&self, instance_id: &str) -> Result<ExecutionInstance, Error> {
    sqlx::query_as(
      r#"
      SELECT instance_id, flow_id, flow_version, contact_id, current_node_id,
             bindings, status, wait_deadline, last_error, revision, created_at, updated_at
      FROM instances
      WHERE instance_id = ?
      "#,
    )
    .bind(instance_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("instance {instance_id}")))
  }

  async fn update_instance(
    &self,
    instance: &ExecutionInstance,
    expected_revision: i64,
  ) -> Result<(), Error> {
    let result = sqlx::query(
      r#"
      UPDATE instances
      SET current_node_id = ?, bindings = ?, status = ?, wait_deadline = ?,
          last_error = ?, revision = ?, updated_at = ?
      WHERE instance_id = ? AND revision = ?
      "#,
    )
    .bind(&instance.current_node_id)
    .bind(&instance.bindings)
    .bind(instance.status)
    .bind(instance.wait_deadline)
    .bind(&instance.last_error)
    .bind(expected_revision + 1)
    .bind(Utc::now())
    .bind(&instance.instance_id)
    .bind(expected_revision)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      return Err(Error::Conflict(format!(
        "instance {} revision was not {}",
        instance.instance_id, expected_revision
      )));
    }
    Ok(())
  }

  async fn find_waiting_for_contact(
    &self,
    contact_id: &str,
  ) -> Result<Option<ExecutionInstance>, Error> {
    Ok(
      sqlx::query_as(
        r#"
        SELECT instance_id, flow_id, flow_version, contact_id, current_node_id,
               bindings, status, wait_deadline, last_error, revision, created_at, updated_at
        FROM instances
        WHERE contact_id = ? AND status = 'waiting_for_reply'
        ORDER BY updated_at ASC, instance_id ASC
        LIMIT 1
        "#,
      )
      .bind(contact_id)
      .fetch_optional(&self.pool)
      .await?,
    )
  }

  async fn list_pending_timers(&self) -> Result<Vec<ExecutionInstance>, Error> {
    Ok(
      sqlx::query_as(
        r#"
        SELECT instance_id, flow_id, flow_version, contact_id, current_node_id,
               bindings, status, wait_deadline, last_error, revision, created_at, updated_at
        FROM instances
        WHERE status = 'waiting_for_reply' AND wait_deadline IS NOT NULL
        "#,
      )
      .fetch_all(&self.pool)
      .await?,
    )
  }

  async fn list_instances_for_flow(&self, flow_id: &str) -> Result<Vec<ExecutionInstance>, Error> {
    Ok(
      sqlx::query_as(
        r#"
        SELECT instance_id, flow_id, flow_version, contact_id, current_node_id,
               bindings, status, wait_deadline, last_error, revision, created_at, updated_at
        FROM instances
        WHERE flow_id = ?
        "#,
      )
      .bind(flow_id)
      .fetch_all(&self.pool)
      .await?,
    )
  }

  async fn record_send(&self, record: &SendRecord) -> Result<bool, Error> {
    let result = sqlx::query(
      r#"
      INSERT INTO sends (send_id, instance_id, node_id, contact_id, body,
                         provider_message_id, status, created_at)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(&record.send_id)
    .bind(&record.instance_id)
    .bind(&record.node_id)
    .bind(&record.contact_id)
    .bind(&record.body)
    .bind(&record.provider_message_id)
    .bind(record.status)
    .bind(record.created_at)
    .execute(&self.pool)
    .await;

    match result {
      Ok(_) => Ok(true),
      Err(e) if is_unique_violation(&e) => Ok(false),
      Err(e) => Err(e.into()),
    }
  }

  async fn mark_send_result(
    &self,
    send_id: &str,
    provider_message_id: Option<&str>,
    status: SendStatus,
  ) -> Result<(), Error> {
    let result = sqlx::query(
      "UPDATE sends SET provider_message_id = ?, status = ? WHERE send_id = ?",
    )
    .bind(provider_message_id)
    .bind(status)
    .bind(send_id)
    .execute(&self.pool)
    .await?;
    if result.rows_affected() == 0 {
      return Err(Error::NotFound(format!("send {send_id}")));
    }
    Ok(())
  }

  async fn update_send_status(
    &self,
    provider_message_id: &str,
    status: SendStatus,
  ) -> Result<(), Error> {
    let result = sqlx::query("UPDATE sends SET status = ? WHERE provider_message_id = ?")
      .bind(status)
      .bind(provider_message_id)
      .execute(&self.pool)
      .await?;
    if result.rows_affected() == 0 {
      return Err(Error::NotFound(format!(
        "send for provider message {provider_message_id}"
      )));
    }
    Ok(())
  }
}
