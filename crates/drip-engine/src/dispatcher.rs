//! Outbound message dispatch: dedup first, then send with bounded retry.

use std::sync::Arc;
use std::time::Duration;

use drip_store::{SendRecord, SendStatus, Store};
use tracing::{debug, warn};

use crate::transport::{Transport, TransportError};

/// Retry knobs for transport sends.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
  pub max_attempts: u32,
  pub initial_backoff: Duration,
}

impl Default for DispatchConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      initial_backoff: Duration::from_millis(500),
    }
  }
}

/// Outcome of one dispatch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
  Sent { provider_message_id: String },
  /// The `(instance_id, node_id)` dedup key already existed; nothing was
  /// sent. This is the normal outcome when an event is replayed.
  Duplicate,
  /// All attempts failed. The send is marked failed and logged; the graph
  /// still advances - a transport failure is not a graph error.
  Failed,
}

/// Forwards rendered message text to the transport adapter, exactly once per
/// `(instance_id, node_id)`.
///
/// The dedup key is persisted in the store before the first transport
/// attempt, so a crash between send and instance persist cannot double-send
/// on replay.
pub struct Dispatcher {
  store: Arc<dyn Store>,
  transport: Arc<dyn Transport>,
  config: DispatchConfig,
}

impl Dispatcher {
  pub fn new(store: Arc<dyn Store>, transport: Arc<dyn Transport>, config: DispatchConfig) -> Self {
    Self {
      store,
      transport,
      config,
    }
  }

  pub async fn dispatch(
    &self,
    instance_id: &str,
    node_id: &str,
    contact_id: &str,
    text: &str,
  ) -> Result<DispatchResult, drip_store::Error> {
    let record = SendRecord::new(instance_id, node_id, contact_id, text);
    if !self.store.record_send(&record).await? {
      debug!(
        instance_id = %instance_id,
        node_id = %node_id,
        "send_deduplicated"
      );
      return Ok(DispatchResult::Duplicate);
    }

    let mut backoff = self.config.initial_backoff;
    for attempt in 1..=self.config.max_attempts {
      match self.transport.send(contact_id, text).await {
        Ok(provider_message_id) => {
          self
            .store
            .mark_send_result(&record.send_id, Some(&provider_message_id), SendStatus::Sent)
            .await?;
          return Ok(DispatchResult::Sent {
            provider_message_id,
          });
        }
        Err(e) => {
          warn!(
            instance_id = %instance_id,
            node_id = %node_id,
            attempt = attempt,
            error = %e,
            "transport_send_failed"
          );
          // A rejection is permanent; only retry when the provider was
          // unreachable.
          if matches!(e, TransportError::Rejected(_)) {
            break;
          }
          if attempt < self.config.max_attempts {
            tokio::time::sleep(backoff).await;
            backoff *= 2;
          }
        }
      }
    }

    self
      .store
      .mark_send_result(&record.send_id, None, SendStatus::Failed)
      .await?;
    warn!(
      instance_id = %instance_id,
      node_id = %node_id,
      "send_exhausted_retries"
    );
    Ok(DispatchResult::Failed)
  }
}
