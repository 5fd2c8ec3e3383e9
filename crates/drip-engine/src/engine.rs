//! The flow execution state machine.
//!
//! One tick runs from an incoming event to the next suspension or terminal
//! state: Message and Condition nodes advance synchronously, only a Wait
//! node suspends. Every tick is claimed by a revision compare-and-swap
//! against the persisted instance, so concurrent events for the same
//! instance resolve to exactly one winner and the losers are discarded as
//! stale.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use drip_flow::{EdgeTag, FlowDoc, FlowGraph, NodeKind, evaluate, render_text};
use drip_store::{ExecutionInstance, FlowRecord, InstanceStatus, Json, SendStatus, Store};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::dispatcher::Dispatcher;
use crate::error::EngineError;
use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};
use crate::router::InboundRouter;
use crate::scheduler::TimerScheduler;

/// The variable a reply body is bound to before following the `reply` edge.
pub const LAST_MESSAGE_VAR: &str = "lastMessage";

/// An event the engine consumes. Inbound messages come from the transport
/// webhook layer, timer fires from the [`TimerScheduler`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
  InboundMessage {
    contact_id: String,
    body: String,
    received_at: DateTime<Utc>,
  },
  TimerFired {
    instance_id: String,
    timer_id: String,
  },
}

/// Outcome of handling one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
  /// The event was claimed and the instance advanced.
  Advanced,
  /// No waiting instance for this contact; the message belongs to the
  /// surrounding chat UI, not the engine.
  NotHandled,
  /// The event was stale (instance no longer waiting, superseded timer, or
  /// lost the claim race) and was discarded as a no-op.
  Discarded,
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
  /// Upper bound on synchronous node advancement within one tick. A guard
  /// against validator gaps; exceeding it aborts the instance.
  pub max_hops_per_tick: u32,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      max_hops_per_tick: 50,
    }
  }
}

/// The execution engine.
///
/// Generic over `N: ExecutionNotifier` to allow different observation
/// strategies; use [`FlowEngine::new`] for a no-op notifier.
pub struct FlowEngine<N: ExecutionNotifier = NoopNotifier> {
  store: Arc<dyn Store>,
  dispatcher: Dispatcher,
  scheduler: TimerScheduler,
  router: InboundRouter,
  /// Active graph per flow id. Instances bound to an older version keep
  /// executing it; their graphs are reloaded from the flow records.
  active: RwLock<HashMap<String, Arc<FlowGraph>>>,
  config: EngineConfig,
  notifier: N,
}

impl FlowEngine<NoopNotifier> {
  pub fn new(
    store: Arc<dyn Store>,
    dispatcher: Dispatcher,
    scheduler: TimerScheduler,
    config: EngineConfig,
  ) -> Self {
    Self::with_notifier(store, dispatcher, scheduler, config, NoopNotifier)
  }
}

impl<N: ExecutionNotifier> FlowEngine<N> {
  pub fn with_notifier(
    store: Arc<dyn Store>,
    dispatcher: Dispatcher,
    scheduler: TimerScheduler,
    config: EngineConfig,
    notifier: N,
  ) -> Self {
    let router = InboundRouter::new(Arc::clone(&store));
    Self {
      store,
      dispatcher,
      scheduler,
      router,
      active: RwLock::new(HashMap::new()),
      config,
      notifier,
    }
  }

  /// The injected store; the runner uses it for event routing lookups.
  pub fn store(&self) -> &Arc<dyn Store> {
    &self.store
  }

  /// Validate and activate a flow document.
  ///
  /// An invalid graph is rejected here, before any instance exists. At most
  /// one version of a flow is active at a time; activating a new version
  /// replaces the old one in the registry but does not touch instances
  /// already bound to it.
  #[instrument(skip(self, doc), fields(flow_id = %doc.id, version = doc.version))]
  pub async fn activate(&self, doc: &FlowDoc) -> Result<Arc<FlowGraph>, EngineError> {
    let graph = Arc::new(FlowGraph::from_doc(doc).map_err(EngineError::InvalidFlow)?);

    let record = FlowRecord {
      flow_id: doc.id.clone(),
      version: i64::from(doc.version),
      name: doc.name.clone(),
      document: Json(serde_json::to_value(graph.as_ref())?),
      active: true,
      published_at: Utc::now(),
    };
    match self.store.publish_flow(&record).await {
      Ok(()) => {}
      // Re-activating an already-published version is fine.
      Err(drip_store::Error::Conflict(_)) => {}
      Err(e) => return Err(e.into()),
    }
    self
      .store
      .set_flow_active(&doc.id, i64::from(doc.version), true)
      .await?;

    self
      .active
      .write()
      .await
      .insert(doc.id.clone(), Arc::clone(&graph));
    info!("flow_activated");
    Ok(graph)
  }

  /// Deactivate a flow: stop routing events to it, cancel pending timers,
  /// and abort every non-terminal instance.
  #[instrument(skip(self))]
  pub async fn deactivate(&self, flow_id: &str) -> Result<(), EngineError> {
    let removed = self.active.write().await.remove(flow_id);
    if let Some(graph) = &removed {
      self
        .store
        .set_flow_active(flow_id, i64::from(graph.version()), false)
        .await?;
    }

    for instance in self.store.list_instances_for_flow(flow_id).await? {
      if instance.status.is_terminal() {
        continue;
      }
      self.scheduler.cancel(&instance.instance_id).await;
      self.abort_instance(instance, "flow deactivated").await?;
    }
    info!("flow_deactivated");
    Ok(())
  }

  /// Enter a contact into the active version of a flow and run the first
  /// tick from the entry node.
  #[instrument(skip(self, seed_bindings))]
  pub async fn start_contact(
    &self,
    flow_id: &str,
    contact_id: &str,
    seed_bindings: HashMap<String, String>,
  ) -> Result<String, EngineError> {
    let graph = self
      .active
      .read()
      .await
      .get(flow_id)
      .cloned()
      .ok_or_else(|| EngineError::FlowNotActive(flow_id.to_string()))?;

    let instance = ExecutionInstance::new(
      flow_id,
      i64::from(graph.version()),
      contact_id,
      graph.entry(),
      seed_bindings,
    );
    match self.store.create_instance(&instance).await {
      Ok(()) => {}
      Err(drip_store::Error::Conflict(_)) => {
        return Err(EngineError::InstanceExists {
          flow_id: flow_id.to_string(),
          contact_id: contact_id.to_string(),
        });
      }
      Err(e) => return Err(e.into()),
    }
    self.notifier.notify(ExecutionEvent::InstanceStarted {
      instance_id: instance.instance_id.clone(),
      flow_id: flow_id.to_string(),
      contact_id: contact_id.to_string(),
    });
    info!(instance_id = %instance.instance_id, "instance_started");

    let instance_id = instance.instance_id.clone();
    let claimed = self.claim(instance).await?;
    if let Some(instance) = claimed {
      self.advance(&graph, instance).await?;
    }
    Ok(instance_id)
  }

  /// Handle one engine event. Serialization per instance is the caller's
  /// concern (the [`EngineRunner`](crate::EngineRunner) routes events for
  /// one contact through one worker); this method still tolerates races via
  /// the revision claim.
  #[instrument(skip(self, event))]
  pub async fn handle_event(&self, event: EngineEvent) -> Result<HandleOutcome, EngineError> {
    match event {
      EngineEvent::InboundMessage {
        contact_id, body, ..
      } => self.handle_inbound(&contact_id, &body).await,
      EngineEvent::TimerFired {
        instance_id,
        timer_id,
      } => self.handle_timer(&instance_id, &timer_id).await,
    }
  }

  async fn handle_inbound(
    &self,
    contact_id: &str,
    body: &str,
  ) -> Result<HandleOutcome, EngineError> {
    let Some(instance) = self.router.resolve(contact_id).await? else {
      debug!(contact_id = %contact_id, "inbound_not_for_engine");
      return Ok(HandleOutcome::NotHandled);
    };

    let Some(mut instance) = self.claim(instance).await? else {
      return Ok(HandleOutcome::Discarded);
    };
    self.scheduler.cancel(&instance.instance_id).await;

    let graph = self.graph_for(&instance).await?;
    instance
      .bindings
      .0
      .insert(LAST_MESSAGE_VAR.to_string(), body.to_string());
    self.notifier.notify(ExecutionEvent::ReplyReceived {
      instance_id: instance.instance_id.clone(),
    });

    let next = graph
      .successor(&instance.current_node_id, EdgeTag::Reply)
      .map(str::to_string);
    self
      .resume(&graph, instance, next)
      .await?;
    Ok(HandleOutcome::Advanced)
  }

  async fn handle_timer(
    &self,
    instance_id: &str,
    timer_id: &str,
  ) -> Result<HandleOutcome, EngineError> {
    let instance = match self.store.get_instance(instance_id).await {
      Ok(instance) => instance,
      Err(drip_store::Error::NotFound(_)) => {
        debug!(instance_id = %instance_id, timer_id = %timer_id, "timer_for_unknown_instance");
        return Ok(HandleOutcome::Discarded);
      }
      Err(e) => return Err(e.into()),
    };
    if instance.status != InstanceStatus::WaitingForReply {
      // A reply won the race; the queued fire is a no-op.
      debug!(instance_id = %instance_id, timer_id = %timer_id, "stale_timer_discarded");
      return Ok(HandleOutcome::Discarded);
    }

    let Some(instance) = self.claim(instance).await? else {
      return Ok(HandleOutcome::Discarded);
    };

    let graph = self.graph_for(&instance).await?;
    self.notifier.notify(ExecutionEvent::TimerExpired {
      instance_id: instance.instance_id.clone(),
    });

    let next = graph
      .successor(&instance.current_node_id, EdgeTag::Timeout)
      .map(str::to_string);
    self
      .resume(&graph, instance, next)
      .await?;
    Ok(HandleOutcome::Advanced)
  }

  /// Record a delivery status callback from the provider.
  pub async fn handle_status_update(
    &self,
    provider_message_id: &str,
    status: SendStatus,
  ) -> Result<(), EngineError> {
    match self
      .store
      .update_send_status(provider_message_id, status)
      .await
    {
      Ok(()) => Ok(()),
      Err(drip_store::Error::NotFound(_)) => {
        // Status for a message the engine did not send.
        debug!(provider_message_id = %provider_message_id, "status_for_unknown_send");
        Ok(())
      }
      Err(e) => Err(e.into()),
    }
  }

  /// Rebuild in-process state from the store after a restart: the active
  /// flow registry and the pending wait timers.
  pub async fn recover(&self, flow_ids: &[String]) -> Result<(), EngineError> {
    let mut active = self.active.write().await;
    for flow_id in flow_ids {
      if let Some(record) = self.store.get_active_flow(flow_id).await? {
        let graph: FlowGraph = serde_json::from_value(record.document.0.clone())?;
        active.insert(flow_id.clone(), Arc::new(graph));
      }
    }
    drop(active);

    let timers = self.scheduler.recover(self.store.as_ref()).await?;
    info!(timers = timers, "engine_recovered");
    Ok(())
  }

  /// Durably claim an event for an instance by advancing its revision.
  /// Returns `None` (and logs) when the claim loses a race.
  async fn claim(
    &self,
    mut instance: ExecutionInstance,
  ) -> Result<Option<ExecutionInstance>, EngineError> {
    let expected = instance.revision;
    match self.store.update_instance(&instance, expected).await {
      Ok(()) => {
        instance.revision = expected + 1;
        Ok(Some(instance))
      }
      Err(drip_store::Error::Conflict(_)) => {
        debug!(instance_id = %instance.instance_id, "event_lost_claim_race");
        Ok(None)
      }
      Err(e) => Err(e.into()),
    }
  }

  /// Set the instance back to Running at `next` and advance. `next = None`
  /// means the branch edge pointed nowhere, which validation rules out; the
  /// instance completes defensively.
  async fn resume(
    &self,
    graph: &FlowGraph,
    mut instance: ExecutionInstance,
    next: Option<String>,
  ) -> Result<(), EngineError> {
    instance.status = InstanceStatus::Running;
    instance.wait_deadline = None;
    match next {
      Some(node_id) => {
        instance.current_node_id = node_id;
        self.advance(graph, instance).await
      }
      None => self.complete(instance).await,
    }
  }

  /// Persist a tick's end state with the claim revision. Returns `false`
  /// when the write lost to a concurrent abort; the tick stops advancing.
  async fn persist(&self, instance: &ExecutionInstance) -> Result<bool, EngineError> {
    match self.store.update_instance(instance, instance.revision).await {
      Ok(()) => Ok(true),
      Err(drip_store::Error::Conflict(_)) => {
        debug!(instance_id = %instance.instance_id, "tick_superseded");
        Ok(false)
      }
      Err(e) => Err(e.into()),
    }
  }

  /// One synchronous tick: advance from the current node until the instance
  /// suspends at a Wait node, completes, or trips the hop guard.
  async fn advance(
    &self,
    graph: &FlowGraph,
    mut instance: ExecutionInstance,
  ) -> Result<(), EngineError> {
    for _hop in 0..self.config.max_hops_per_tick {
      let Some(node) = graph.node(&instance.current_node_id) else {
        // A validator gap or a corrupted record; only this instance dies.
        warn!(
          instance_id = %instance.instance_id,
          node_id = %instance.current_node_id,
          "missing_node"
        );
        let reason = format!("missing node {}", instance.current_node_id);
        return self.abort_instance(instance, &reason).await;
      };

      match &node.kind {
        NodeKind::Message {
          text,
          allow_variables,
        } => {
          let rendered = if *allow_variables {
            render_text(text, &instance.bindings.0)
          } else {
            text.clone()
          };
          // Send failures are logged by the dispatcher and do not stop the
          // graph; dedup makes replays free.
          self
            .dispatcher
            .dispatch(
              &instance.instance_id,
              &node.id,
              &instance.contact_id,
              &rendered,
            )
            .await?;
          self.notifier.notify(ExecutionEvent::MessageSent {
            instance_id: instance.instance_id.clone(),
            node_id: node.id.clone(),
          });
          match graph.sole_successor(&node.id) {
            Some(next) => instance.current_node_id = next.to_string(),
            None => return self.complete(instance).await,
          }
        }

        NodeKind::Condition {
          variable,
          operator,
          operand,
        } => {
          let outcome = evaluate(&instance.bindings.0, variable, *operator, operand);
          self.notifier.notify(ExecutionEvent::ConditionEvaluated {
            instance_id: instance.instance_id.clone(),
            node_id: node.id.clone(),
            outcome,
          });
          let tag = if outcome { EdgeTag::Yes } else { EdgeTag::No };
          match graph.successor(&node.id, tag) {
            Some(next) => instance.current_node_id = next.to_string(),
            None => return self.complete(instance).await,
          }
        }

        NodeKind::Wait { timeout_seconds } => {
          let timeout_seconds = *timeout_seconds;
          instance.status = InstanceStatus::WaitingForReply;
          // Zero means wait indefinitely for a reply; no timer. The
          // arithmetic is total: graphs built directly (not through
          // document normalization) may carry arbitrary timeouts, and an
          // overflowed deadline must never fire early.
          instance.wait_deadline = if timeout_seconds > 0 {
            let delay = i64::try_from(timeout_seconds)
              .ok()
              .and_then(Duration::try_seconds)
              .unwrap_or(Duration::MAX);
            Some(
              Utc::now()
                .checked_add_signed(delay)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            )
          } else {
            None
          };
          if !self.persist(&instance).await? {
            return Ok(());
          }
          if let Some(deadline) = instance.wait_deadline {
            self.scheduler.schedule(&instance.instance_id, deadline).await;
          }
          self.notifier.notify(ExecutionEvent::WaitStarted {
            instance_id: instance.instance_id.clone(),
            node_id: node.id.clone(),
          });
          debug!(
            instance_id = %instance.instance_id,
            node_id = %node.id,
            "instance_waiting"
          );
          return Ok(());
        }
      }
    }

    warn!(
      instance_id = %instance.instance_id,
      max_hops = self.config.max_hops_per_tick,
      "runaway_graph"
    );
    self.abort_instance(instance, "RunawayGraph").await
  }

  async fn complete(&self, mut instance: ExecutionInstance) -> Result<(), EngineError> {
    instance.status = InstanceStatus::Completed;
    instance.wait_deadline = None;
    if !self.persist(&instance).await? {
      return Ok(());
    }
    self.notifier.notify(ExecutionEvent::InstanceCompleted {
      instance_id: instance.instance_id.clone(),
    });
    info!(instance_id = %instance.instance_id, "instance_completed");
    Ok(())
  }

  /// Abort an instance, retrying the write until it wins against any
  /// in-flight tick. The losing tick's final persist then fails its claim
  /// and stops advancing.
  async fn abort_instance(
    &self,
    instance: ExecutionInstance,
    reason: &str,
  ) -> Result<(), EngineError> {
    let instance_id = instance.instance_id.clone();
    let mut current = instance;
    loop {
      if current.status.is_terminal() {
        return Ok(());
      }
      current.status = InstanceStatus::Aborted;
      current.wait_deadline = None;
      current.last_error = Some(reason.to_string());
      let revision = current.revision;
      match self.store.update_instance(&current, revision).await {
        Ok(()) => break,
        Err(drip_store::Error::Conflict(_)) => {
          current = self.store.get_instance(&instance_id).await?;
        }
        Err(e) => return Err(e.into()),
      }
    }
    self.notifier.notify(ExecutionEvent::InstanceAborted {
      instance_id: instance_id.clone(),
      reason: reason.to_string(),
    });
    warn!(instance_id = %instance_id, reason = %reason, "instance_aborted");
    Ok(())
  }

  /// The graph an instance is bound to: the active registry entry when the
  /// versions match, the stored flow record otherwise.
  async fn graph_for(&self, instance: &ExecutionInstance) -> Result<Arc<FlowGraph>, EngineError> {
    if let Some(graph) = self.active.read().await.get(&instance.flow_id) {
      if i64::from(graph.version()) == instance.flow_version {
        return Ok(Arc::clone(graph));
      }
    }
    let record = self
      .store
      .get_flow(&instance.flow_id, instance.flow_version)
      .await?;
    let graph: FlowGraph = serde_json::from_value(record.document.0.clone())?;
    Ok(Arc::new(graph))
  }
}
