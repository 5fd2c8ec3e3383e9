//! Execution events and notifiers for observability.
//!
//! Events are emitted as instances move through their flows so the
//! surrounding product can display conversation state. The engine calls
//! `notify` for each event - implementations decide what to do with them
//! (persist, broadcast, log, ignore).

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted while instances advance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionEvent {
  /// A contact entered a flow.
  InstanceStarted {
    instance_id: String,
    flow_id: String,
    contact_id: String,
  },

  /// A message node dispatched its text.
  MessageSent {
    instance_id: String,
    node_id: String,
  },

  /// A condition node evaluated and picked a branch.
  ConditionEvaluated {
    instance_id: String,
    node_id: String,
    outcome: bool,
  },

  /// The instance suspended at a wait node.
  WaitStarted {
    instance_id: String,
    node_id: String,
  },

  /// A reply arrived for a waiting instance.
  ReplyReceived { instance_id: String },

  /// A wait deadline elapsed with no reply.
  TimerExpired { instance_id: String },

  /// The instance reached a terminal node.
  InstanceCompleted { instance_id: String },

  /// The instance was aborted (flow deactivated, or a runtime guard fired).
  InstanceAborted {
    instance_id: String,
    reason: String,
  },
}

/// Trait for receiving execution events.
pub trait ExecutionNotifier: Send + Sync {
  fn notify(&self, event: ExecutionEvent);
}

/// A no-op notifier that discards all events.
///
/// Useful for tests or when event observation is not needed.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {
    // Intentionally empty
  }
}

/// A notifier that sends events to an unbounded channel.
///
/// Use this when events are consumed asynchronously (persisted, streamed to
/// a UI). Unbounded so the engine never blocks on a slow consumer; the
/// volume is a handful of events per tick.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // Ignore send errors - receiver may have been dropped
    let _ = self.sender.send(event);
  }
}
