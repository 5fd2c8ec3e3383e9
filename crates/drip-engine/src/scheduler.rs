//! Wait/timeout timers.
//!
//! The scheduler is not the durable record of a wait - the instance's
//! `wait_deadline` in the store is. Timers here are just the in-process
//! mechanism that turns a deadline into a [`EngineEvent::TimerFired`] on the
//! engine channel; after a restart, [`TimerScheduler::recover`] rebuilds
//! them from the store (deadlines already in the past fire immediately).
//!
//! Firing is at-least-once: a timer that loses the race against a reply is
//! delivered anyway and discarded by the engine as stale.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use drip_store::Store;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::EngineEvent;

struct PendingTimer {
  timer_id: String,
  handle: tokio::task::JoinHandle<()>,
}

/// Durable-deadline timer service. At most one pending timer per instance.
#[derive(Clone)]
pub struct TimerScheduler {
  events: mpsc::UnboundedSender<EngineEvent>,
  pending: Arc<Mutex<HashMap<String, PendingTimer>>>,
}

impl TimerScheduler {
  pub fn new(events: mpsc::UnboundedSender<EngineEvent>) -> Self {
    Self {
      events,
      pending: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  /// Register a timer for an instance's wait deadline. Replaces any timer
  /// already pending for the instance. Returns the timer id, which is
  /// carried in the fired event so superseded timers can be told apart.
  pub async fn schedule(&self, instance_id: &str, fire_at: DateTime<Utc>) -> String {
    let timer_id = uuid::Uuid::new_v4().to_string();
    let events = self.events.clone();
    let registry = Arc::clone(&self.pending);
    let task_instance_id = instance_id.to_string();
    let task_timer_id = timer_id.clone();

    // The lock is taken before spawning and held until the map entry is in
    // place, so an already-elapsed timer cannot observe the map without it.
    let mut pending = self.pending.lock().await;

    let handle = tokio::spawn(async move {
      let delay = (fire_at - Utc::now())
        .to_std()
        .unwrap_or(std::time::Duration::ZERO);
      tokio::time::sleep(delay).await;

      // Deregister before emitting, but only if this timer is still the
      // current one for the instance.
      {
        let mut registry = registry.lock().await;
        match registry.get(&task_instance_id) {
          Some(timer) if timer.timer_id == task_timer_id => {
            registry.remove(&task_instance_id);
          }
          _ => return,
        }
      }
      let _ = events.send(EngineEvent::TimerFired {
        instance_id: task_instance_id,
        timer_id: task_timer_id,
      });
    });

    if let Some(previous) = pending.insert(
      instance_id.to_string(),
      PendingTimer {
        timer_id: timer_id.clone(),
        handle,
      },
    ) {
      previous.handle.abort();
    }
    timer_id
  }

  /// Cancel the pending timer for an instance, if any.
  pub async fn cancel(&self, instance_id: &str) {
    let mut pending = self.pending.lock().await;
    if let Some(timer) = pending.remove(instance_id) {
      timer.handle.abort();
      debug!(instance_id = %instance_id, timer_id = %timer.timer_id, "timer_cancelled");
    }
  }

  /// Rebuild timers from the store after a restart.
  pub async fn recover(&self, store: &dyn Store) -> Result<usize, drip_store::Error> {
    let waiting = store.list_pending_timers().await?;
    let count = waiting.len();
    for instance in waiting {
      if let Some(deadline) = instance.wait_deadline {
        self.schedule(&instance.instance_id, deadline).await;
      }
    }
    Ok(count)
  }

  /// Abort all pending timers. Called at shutdown.
  pub async fn shutdown(&self) {
    let mut pending = self.pending.lock().await;
    for (_, timer) in pending.drain() {
      timer.handle.abort();
    }
  }
}
