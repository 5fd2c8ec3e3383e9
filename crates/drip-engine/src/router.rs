//! Inbound message routing.
//!
//! Maps a decoded inbound message to the instance waiting on that contact
//! across all active flows. The data model allows one non-terminal instance
//! per (flow, contact), so a contact enrolled in several flows can have
//! several waiting instances; the store resolves to the one waiting longest.
//! A message with no waiting instance is not an engine event; the caller
//! hands it to the surrounding chat UI.

use std::sync::Arc;

use drip_store::{ExecutionInstance, Store};

pub struct InboundRouter {
  store: Arc<dyn Store>,
}

impl InboundRouter {
  pub fn new(store: Arc<dyn Store>) -> Self {
    Self { store }
  }

  /// Resolve an inbound message to the waiting instance for the contact.
  pub async fn resolve(
    &self,
    contact_id: &str,
  ) -> Result<Option<ExecutionInstance>, drip_store::Error> {
    self.store.find_waiting_for_contact(contact_id).await
  }
}
