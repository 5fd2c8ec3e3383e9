//! The messaging-provider boundary.
//!
//! The engine depends only on this trait. The real integration (WhatsApp
//! Cloud API, Twilio, ...) lives outside the engine and implements `send`;
//! inbound messages and delivery receipts come back through the runner's
//! event channel and [`FlowEngine::handle_status_update`].
//!
//! [`FlowEngine::handle_status_update`]: crate::FlowEngine::handle_status_update

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
  /// The provider accepted the request but refused the message.
  #[error("provider rejected the message: {0}")]
  Rejected(String),

  /// The provider could not be reached; worth retrying.
  #[error("provider unreachable: {0}")]
  Unreachable(String),
}

/// Outbound send interface. Returns the provider's message id, used later to
/// correlate delivery status callbacks.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, contact_id: &str, text: &str) -> Result<String, TransportError>;
}

/// Transport that prints to stdout. Used by the CLI simulator.
#[derive(Debug, Clone, Default)]
pub struct ConsoleTransport;

#[async_trait]
impl Transport for ConsoleTransport {
  async fn send(&self, contact_id: &str, text: &str) -> Result<String, TransportError> {
    println!("-> [{contact_id}] {text}");
    Ok(uuid::Uuid::new_v4().to_string())
  }
}
