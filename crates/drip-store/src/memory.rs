//! In-memory reference store.
//!
//! Used by tests and the CLI simulator. Semantics match [`SqliteStore`],
//! including the revision compare-and-swap and the send dedup key.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::types::{ExecutionInstance, FlowRecord, SendRecord, SendStatus};
use crate::{Error, Store};

#[derive(Default)]
struct Inner {
  flows: HashMap<(String, i64), FlowRecord>,
  instances: HashMap<String, ExecutionInstance>,
  sends: HashMap<(String, String), SendRecord>,
}

/// In-memory store backed by a single `RwLock`.
#[derive(Default)]
pub struct MemoryStore {
  inner: RwLock<Inner>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn publish_flow(&self, flow: &FlowRecord) -> Result<(), Error> {
    let mut inner = self.inner.write().await;
    let key = (flow.flow_id.clone(), flow.version);
    if inner.flows.contains_key(&key) {
      return Err(Error::Conflict(format!(
        "flow {} version {} already published",
        flow.flow_id, flow.version
      )));
    }
    inner.flows.insert(key, flow.clone());
    Ok(())
  }

  async fn get_flow(&self, flow_id: &str, version: i64) -> Result<FlowRecord, Error> {
    let inner = self.inner.read().await;
    inner
      .flows
      .get(&(flow_id.to_string(), version))
      .cloned()
      .ok_or_else(|| Error::NotFound(format!("flow {flow_id} version {version}")))
  }

  async fn get_active_flow(&self, flow_id: &str) -> Result<Option<FlowRecord>, Error> {
    let inner = self.inner.read().await;
    Ok(
      inner
        .flows
        .values()
        .find(|f| f.flow_id == flow_id && f.active)
        .cloned(),
    )
  }

  async fn set_flow_active(&self, flow_id: &str, version: i64, active: bool) -> Result<(), Error> {
    let mut inner = self.inner.write().await;
    if !inner.flows.contains_key(&(flow_id.to_string(), version)) {
      return Err(Error::NotFound(format!("flow {flow_id} version {version}")));
    }
    for flow in inner.flows.values_mut() {
      if flow.flow_id == flow_id {
        flow.active = active && flow.version == version;
      }
    }
    Ok(())
  }

  async fn create_instance(&self, instance: &ExecutionInstance) -> Result<(), Error> {
    let mut inner = self.inner.write().await;
    let clash = inner.instances.values().any(|i| {
      i.flow_id == instance.flow_id
        && i.contact_id == instance.contact_id
        && !i.status.is_terminal()
    });
    if clash {
      return Err(Error::Conflict(format!(
        "contact {} already has a live instance of flow {}",
        instance.contact_id, instance.flow_id
      )));
    }
    inner
      .instances
      .insert(instance.instance_id.clone(), instance.clone());
    Ok(())
  }

  async fn get_instance(&self, instance_id: &str) -> Result<ExecutionInstance, Error> {
    let inner = self.inner.read().await;
    inner
      .instances
      .get(instance_id)
      .cloned()
      .ok_or_else(|| Error::NotFound(format!("instance {instance_id}")))
  }

  async fn update_instance(
    &self,
    instance: &ExecutionInstance,
    expected_revision: i64,
  ) -> Result<(), Error> {
    let mut inner = self.inner.write().await;
    let stored = inner
      .instances
      .get_mut(&instance.instance_id)
      .ok_or_else(|| Error::NotFound(format!("instance {}", instance.instance_id)))?;
    if stored.revision != expected_revision {
      return Err(Error::Conflict(format!(
        "instance {} revision {} != expected {}",
        instance.instance_id, stored.revision, expected_revision
      )));
    }
    *stored = instance.clone();
    stored.revision = expected_revision + 1;
    stored.updated_at = Utc::now();
    Ok(())
  }

  async fn find_waiting_for_contact(
    &self,
    contact_id: &str,
  ) -> Result<Option<ExecutionInstance>, Error> {
    let inner = self.inner.read().await;
    Ok(
      inner
        .instances
        .values()
        .filter(|i| {
          i.contact_id == contact_id && i.status == crate::InstanceStatus::WaitingForReply
        })
        .min_by_key(|i| (i.updated_at, i.instance_id.clone()))
        .cloned(),
    )
  }

  async fn list_pending_timers(&self) -> Result<Vec<ExecutionInstance>, Error> {
    let inner = self.inner.read().await;
    Ok(
      inner
        .instances
        .values()
        .filter(|i| {
          i.status == crate::InstanceStatus::WaitingForReply && i.wait_deadline.is_some()
        })
        .cloned()
        .collect(),
    )
  }

  async fn list_instances_for_flow(&self, flow_id: &str) -> Result<Vec<ExecutionInstance>, Error> {
    let inner = self.inner.read().await;
    Ok(
      inner
        .instances
        .values()
        .filter(|i| i.flow_id == flow_id)
        .cloned()
        .collect(),
    )
  }

  async fn record_send(&self, record: &SendRecord) -> Result<bool, Error> {
    let mut inner = self.inner.write().await;
    let key = (record.instance_id.clone(), record.node_id.clone());
    if inner.sends.contains_key(&key) {
      return Ok(false);
    }
    inner.sends.insert(key, record.clone());
    Ok(true)
  }

  async fn mark_send_result(
    &self,
    send_id: &str,
    provider_message_id: Option<&str>,
    status: SendStatus,
  ) -> Result<(), Error> {
    let mut inner = self.inner.write().await;
    let record = inner
      .sends
      .values_mut()
      .find(|s| s.send_id == send_id)
      .ok_or_else(|| Error::NotFound(format!("send {send_id}")))?;
    record.provider_message_id = provider_message_id.map(str::to_string);
    record.status = status;
    Ok(())
  }

  async fn update_send_status(
    &self,
    provider_message_id: &str,
    status: SendStatus,
  ) -> Result<(), Error> {
    let mut inner = self.inner.write().await;
    let record = inner
      .sends
      .values_mut()
      .find(|s| s.provider_message_id.as_deref() == Some(provider_message_id))
      .ok_or_else(|| Error::NotFound(format!("send for provider message {provider_message_id}")))?;
    record.status = status;
    Ok(())
  }
}
