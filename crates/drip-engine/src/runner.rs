//! Event loop with per-contact single-writer workers.
//!
//! Thousands of independent conversations progress concurrently, but events
//! for one conversation must apply in receipt order. The runner gets both
//! properties by routing every event to a worker task keyed by contact id:
//! each worker drains its own FIFO channel (serialized per contact, and
//! therefore per instance), while workers for different contacts run fully
//! in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::{EngineEvent, FlowEngine};
use crate::events::ExecutionNotifier;

pub struct EngineRunner<N: ExecutionNotifier + 'static> {
  engine: Arc<FlowEngine<N>>,
  sender: mpsc::UnboundedSender<EngineEvent>,
  receiver: mpsc::UnboundedReceiver<EngineEvent>,
}

impl<N: ExecutionNotifier + 'static> EngineRunner<N> {
  /// Create a runner around an engine. The paired sender feeds the channel
  /// that the [`TimerScheduler`](crate::TimerScheduler) and the transport
  /// webhook layer write into.
  pub fn new(
    engine: Arc<FlowEngine<N>>,
    sender: mpsc::UnboundedSender<EngineEvent>,
    receiver: mpsc::UnboundedReceiver<EngineEvent>,
  ) -> Self {
    Self {
      engine,
      sender,
      receiver,
    }
  }

  /// A sender handle for injecting events (webhooks, simulators, tests).
  pub fn sender(&self) -> mpsc::UnboundedSender<EngineEvent> {
    self.sender.clone()
  }

  /// Run the routing loop until the cancellation token fires or the channel
  /// closes. Dropping the worker senders on exit lets in-flight workers
  /// drain and stop.
  pub async fn start(mut self, cancel: CancellationToken) {
    info!("engine runner started");
    let mut workers: HashMap<String, mpsc::UnboundedSender<EngineEvent>> = HashMap::new();

    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          info!("engine runner cancelled");
          break;
        }
        event = self.receiver.recv() => {
          let Some(event) = event else {
            info!("engine event channel closed");
            break;
          };
          let Some(key) = self.routing_key(&event).await else {
            continue;
          };
          let worker = workers
            .entry(key)
            .or_insert_with(|| spawn_worker(Arc::clone(&self.engine)));
          // Worker tasks only exit when their sender is dropped, so this
          // send can only fail during shutdown.
          let _ = worker.send(event);
        }
      }
    }
  }

  /// Events are serialized per contact. Timer events carry an instance id;
  /// the owning contact is looked up so a timer and a reply for the same
  /// conversation land on the same worker.
  async fn routing_key(&self, event: &EngineEvent) -> Option<String> {
    match event {
      EngineEvent::InboundMessage { contact_id, .. } => Some(contact_id.clone()),
      EngineEvent::TimerFired { instance_id, .. } => {
        match self.engine.store().get_instance(instance_id).await {
          Ok(instance) => Some(instance.contact_id),
          Err(drip_store::Error::NotFound(_)) => {
            debug!(instance_id = %instance_id, "timer_for_unknown_instance");
            None
          }
          Err(e) => {
            error!(instance_id = %instance_id, error = %e, "timer_routing_failed");
            None
          }
        }
      }
    }
  }
}

fn spawn_worker<N: ExecutionNotifier + 'static>(
  engine: Arc<FlowEngine<N>>,
) -> mpsc::UnboundedSender<EngineEvent> {
  let (tx, mut rx) = mpsc::unbounded_channel::<EngineEvent>();
  tokio::spawn(async move {
    while let Some(event) = rx.recv().await {
      if let Err(e) = engine.handle_event(event).await {
        // Engine errors are per-event; the worker keeps serving its contact.
        error!(error = %e, "event_handling_failed");
      }
    }
  });
  tx
}
