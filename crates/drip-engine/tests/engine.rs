//! Integration tests for the flow engine using the in-memory store and a
//! recording transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use drip_engine::{
  DispatchConfig, DispatchResult, Dispatcher, EngineConfig, EngineError, EngineEvent,
  EngineRunner, FlowEngine, HandleOutcome, TimerScheduler, Transport, TransportError,
};
use drip_flow::FlowDoc;
use drip_store::{InstanceStatus, MemoryStore, Store};
use serde_json::json;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// Transport that records every send; can be told to fail the first N calls.
#[derive(Default)]
struct RecordingTransport {
  sent: Mutex<Vec<(String, String)>>,
  fail_remaining: AtomicU32,
}

impl RecordingTransport {
  fn failing(times: u32) -> Self {
    Self {
      sent: Mutex::new(Vec::new()),
      fail_remaining: AtomicU32::new(times),
    }
  }

  async fn bodies(&self) -> Vec<String> {
    self.sent.lock().await.iter().map(|(_, b)| b.clone()).collect()
  }
}

#[async_trait]
impl Transport for RecordingTransport {
  async fn send(&self, contact_id: &str, text: &str) -> Result<String, TransportError> {
    if self
      .fail_remaining
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok()
    {
      return Err(TransportError::Unreachable("test outage".to_string()));
    }
    self
      .sent
      .lock()
      .await
      .push((contact_id.to_string(), text.to_string()));
    Ok(uuid::Uuid::new_v4().to_string())
  }
}

struct Harness {
  store: Arc<MemoryStore>,
  transport: Arc<RecordingTransport>,
  engine: Arc<FlowEngine>,
  events: mpsc::UnboundedReceiver<EngineEvent>,
}

fn harness_with(transport: RecordingTransport, config: EngineConfig) -> Harness {
  let store = Arc::new(MemoryStore::new());
  let transport = Arc::new(transport);
  let (tx, rx) = mpsc::unbounded_channel();
  let scheduler = TimerScheduler::new(tx);
  let dispatcher = Dispatcher::new(
    store.clone() as Arc<dyn Store>,
    transport.clone(),
    DispatchConfig {
      max_attempts: 2,
      initial_backoff: Duration::from_millis(10),
    },
  );
  let engine = Arc::new(FlowEngine::new(
    store.clone() as Arc<dyn Store>,
    dispatcher,
    scheduler,
    config,
  ));
  Harness {
    store,
    transport,
    engine,
    events: rx,
  }
}

fn harness() -> Harness {
  harness_with(RecordingTransport::default(), EngineConfig::default())
}

/// Message("Hello {{name}}!") -> Wait(30s) -> reply: Message("Thanks")
///                                         -> timeout: Message("Still there?")
fn wait_flow() -> FlowDoc {
  serde_json::from_value(json!({
    "id": "flow-wait",
    "name": "wait flow",
    "version": 1,
    "nodes": [
      {"id": "m1", "type": "messageNode", "data": {"content": "Hello {{name}}!"}},
      {"id": "w1", "type": "waitNode", "data": {"waitTime": 30, "waitUnit": "seconds"}},
      {"id": "m2", "type": "messageNode", "data": {"content": "Thanks"}},
      {"id": "m3", "type": "messageNode", "data": {"content": "Still there?"}}
    ],
    "edges": [
      {"id": "e1", "source": "m1", "target": "w1"},
      {"id": "e2", "source": "w1", "target": "m2", "sourceHandle": "reply"},
      {"id": "e3", "source": "w1", "target": "m3", "sourceHandle": "timeout"}
    ]
  }))
  .unwrap()
}

/// Wait -> Condition(lastMessage contains "help") -> yes/no messages.
fn condition_flow() -> FlowDoc {
  serde_json::from_value(json!({
    "id": "flow-cond",
    "name": "support triage",
    "version": 1,
    "nodes": [
      {"id": "m1", "type": "messageNode", "data": {"content": "What do you need?"}},
      {"id": "w1", "type": "waitNode", "data": {"waitTime": 60, "waitUnit": "seconds"}},
      {"id": "c1", "type": "conditionNode",
       "data": {"variable": "lastMessage", "operator": "contains", "value": "help"}},
      {"id": "yes", "type": "messageNode", "data": {"content": "We can help"}},
      {"id": "no", "type": "messageNode", "data": {"content": "Noted"}},
      {"id": "t", "type": "messageNode", "data": {"content": "No rush"}}
    ],
    "edges": [
      {"id": "e1", "source": "m1", "target": "w1"},
      {"id": "e2", "source": "w1", "target": "c1", "sourceHandle": "reply"},
      {"id": "e3", "source": "w1", "target": "t", "sourceHandle": "timeout"},
      {"id": "e4", "source": "c1", "target": "yes", "sourceHandle": "yes"},
      {"id": "e5", "source": "c1", "target": "no", "sourceHandle": "no"}
    ]
  }))
  .unwrap()
}

fn inbound(contact: &str, body: &str) -> EngineEvent {
  EngineEvent::InboundMessage {
    contact_id: contact.to_string(),
    body: body.to_string(),
    received_at: chrono::Utc::now(),
  }
}

async fn live_instance(store: &MemoryStore, contact: &str) -> drip_store::ExecutionInstance {
  store
    .find_waiting_for_contact(contact)
    .await
    .unwrap()
    .expect("expected a waiting instance")
}

#[tokio::test]
async fn scenario_a_reply_before_timeout() {
  let mut h = harness();
  h.engine.activate(&wait_flow()).await.unwrap();

  let bindings = HashMap::from([("name".to_string(), "Ada".to_string())]);
  h.engine
    .start_contact("flow-wait", "c1", bindings)
    .await
    .unwrap();
  assert_eq!(h.transport.bodies().await, vec!["Hello Ada!"]);

  let outcome = h.engine.handle_event(inbound("c1", "hi!")).await.unwrap();
  assert_eq!(outcome, HandleOutcome::Advanced);
  assert_eq!(h.transport.bodies().await, vec!["Hello Ada!", "Thanks"]);

  // The instance completed; nothing is waiting on this contact anymore.
  assert!(h.store.find_waiting_for_contact("c1").await.unwrap().is_none());
  // And the timer never fired, so the channel stays quiet.
  assert!(h.events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn scenario_b_timeout_without_reply() {
  let mut h = harness();
  h.engine.activate(&wait_flow()).await.unwrap();
  h.engine
    .start_contact("flow-wait", "c1", HashMap::new())
    .await
    .unwrap();

  tokio::time::sleep(Duration::from_secs(31)).await;
  let timer = h.events.try_recv().expect("timer should have fired");
  let outcome = h.engine.handle_event(timer).await.unwrap();
  assert_eq!(outcome, HandleOutcome::Advanced);

  assert_eq!(h.transport.bodies().await, vec!["Hello !", "Still there?"]);
  let instance = h.store.list_instances_for_flow("flow-wait").await.unwrap();
  assert_eq!(instance[0].status, InstanceStatus::Completed);
}

#[tokio::test]
async fn scenario_c_condition_branches_on_reply() {
  let h = harness();
  h.engine.activate(&condition_flow()).await.unwrap();
  h.engine
    .start_contact("flow-cond", "c1", HashMap::new())
    .await
    .unwrap();

  h.engine
    .handle_event(inbound("c1", "I need help"))
    .await
    .unwrap();
  assert_eq!(
    h.transport.bodies().await,
    vec!["What do you need?", "We can help"]
  );
}

#[tokio::test]
async fn condition_no_branch_without_match() {
  let h = harness();
  h.engine.activate(&condition_flow()).await.unwrap();
  h.engine
    .start_contact("flow-cond", "c1", HashMap::new())
    .await
    .unwrap();

  h.engine
    .handle_event(inbound("c1", "just saying hi"))
    .await
    .unwrap();
  assert_eq!(
    h.transport.bodies().await,
    vec!["What do you need?", "Noted"]
  );
}

#[tokio::test]
async fn scenario_d_invalid_graph_rejected_at_activation() {
  let h = harness();
  let doc: FlowDoc = serde_json::from_value(json!({
    "id": "flow-bad",
    "name": "two entries",
    "version": 1,
    "nodes": [
      {"id": "a", "type": "messageNode", "data": {"content": "A"}},
      {"id": "b", "type": "messageNode", "data": {"content": "B"}}
    ],
    "edges": []
  }))
  .unwrap();

  let err = h.engine.activate(&doc).await.unwrap_err();
  let EngineError::InvalidFlow(errors) = err else {
    panic!("expected InvalidFlow");
  };
  assert!(
    errors
      .iter()
      .any(|e| e.reason == drip_flow::GraphErrorReason::MultipleOrNoEntryPoints)
  );

  // Zero instances were created, and the flow cannot be entered.
  assert!(
    h.store
      .list_instances_for_flow("flow-bad")
      .await
      .unwrap()
      .is_empty()
  );
  assert!(matches!(
    h.engine
      .start_contact("flow-bad", "c1", HashMap::new())
      .await,
    Err(EngineError::FlowNotActive(_))
  ));
}

#[tokio::test(start_paused = true)]
async fn reply_precedence_discards_queued_timer() {
  let mut h = harness();
  h.engine.activate(&wait_flow()).await.unwrap();
  h.engine
    .start_contact("flow-wait", "c1", HashMap::new())
    .await
    .unwrap();

  // Let the timer fire and sit queued, then process the reply first.
  tokio::time::sleep(Duration::from_secs(31)).await;
  let timer = h.events.try_recv().expect("timer should have fired");

  let outcome = h.engine.handle_event(inbound("c1", "here!")).await.unwrap();
  assert_eq!(outcome, HandleOutcome::Advanced);

  let outcome = h.engine.handle_event(timer).await.unwrap();
  assert_eq!(outcome, HandleOutcome::Discarded);

  // "Thanks" exactly once, never "Still there?".
  assert_eq!(h.transport.bodies().await, vec!["Hello !", "Thanks"]);
}

#[tokio::test(start_paused = true)]
async fn timeout_precedence_ignores_late_reply() {
  let mut h = harness();
  h.engine.activate(&wait_flow()).await.unwrap();
  h.engine
    .start_contact("flow-wait", "c1", HashMap::new())
    .await
    .unwrap();

  tokio::time::sleep(Duration::from_secs(31)).await;
  let timer = h.events.try_recv().unwrap();
  h.engine.handle_event(timer).await.unwrap();

  // The late reply finds nothing waiting; it belongs to the chat UI.
  let outcome = h.engine.handle_event(inbound("c1", "sorry!")).await.unwrap();
  assert_eq!(outcome, HandleOutcome::NotHandled);
  assert_eq!(h.transport.bodies().await, vec!["Hello !", "Still there?"]);
}

#[tokio::test(start_paused = true)]
async fn huge_wait_does_not_fire_early() {
  let doc: FlowDoc = serde_json::from_value(json!({
    "id": "flow-huge",
    "name": "huge wait",
    "version": 1,
    "nodes": [
      {"id": "m1", "type": "messageNode", "data": {"content": "Hello"}},
      {"id": "w1", "type": "waitNode", "data": {"waitTime": u64::MAX, "waitUnit": "seconds"}},
      {"id": "m2", "type": "messageNode", "data": {"content": "Thanks"}},
      {"id": "m3", "type": "messageNode", "data": {"content": "Still there?"}}
    ],
    "edges": [
      {"id": "e1", "source": "m1", "target": "w1"},
      {"id": "e2", "source": "w1", "target": "m2", "sourceHandle": "reply"},
      {"id": "e3", "source": "w1", "target": "m3", "sourceHandle": "timeout"}
    ]
  }))
  .unwrap();

  let mut h = harness();
  h.engine.activate(&doc).await.unwrap();
  h.engine
    .start_contact("flow-huge", "c1", HashMap::new())
    .await
    .unwrap();

  let instance = live_instance(&h.store, "c1").await;
  let deadline = instance.wait_deadline.expect("deadline should be set");
  assert!(deadline > chrono::Utc::now());

  // Nothing fires within a day; the instance stays suspended and a reply
  // still advances it.
  tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
  assert!(h.events.try_recv().is_err());

  let outcome = h.engine.handle_event(inbound("c1", "hi")).await.unwrap();
  assert_eq!(outcome, HandleOutcome::Advanced);
  assert_eq!(h.transport.bodies().await, vec!["Hello", "Thanks"]);
}

#[tokio::test]
async fn replayed_event_sends_nothing() {
  let h = harness();
  h.engine.activate(&wait_flow()).await.unwrap();
  h.engine
    .start_contact("flow-wait", "c1", HashMap::new())
    .await
    .unwrap();
  h.engine.handle_event(inbound("c1", "hi")).await.unwrap();
  let sent_before = h.transport.bodies().await.len();

  // Webhook retries redeliver the same message.
  let outcome = h.engine.handle_event(inbound("c1", "hi")).await.unwrap();
  assert_eq!(outcome, HandleOutcome::NotHandled);
  assert_eq!(h.transport.bodies().await.len(), sent_before);
}

#[tokio::test]
async fn dispatcher_deduplicates_by_instance_and_node() {
  let h = harness();
  let dispatcher = Dispatcher::new(
    h.store.clone() as Arc<dyn Store>,
    h.transport.clone(),
    DispatchConfig::default(),
  );

  let first = dispatcher.dispatch("i1", "n1", "c1", "hello").await.unwrap();
  assert!(matches!(first, DispatchResult::Sent { .. }));
  let second = dispatcher.dispatch("i1", "n1", "c1", "hello").await.unwrap();
  assert_eq!(second, DispatchResult::Duplicate);
  assert_eq!(h.transport.bodies().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn transport_failure_does_not_stop_the_graph() {
  // Both attempts at the first message fail; the flow still reaches Wait.
  let h = harness_with(RecordingTransport::failing(2), EngineConfig::default());
  h.engine.activate(&wait_flow()).await.unwrap();
  h.engine
    .start_contact("flow-wait", "c1", HashMap::new())
    .await
    .unwrap();

  assert!(h.transport.bodies().await.is_empty());
  let instance = live_instance(&h.store, "c1").await;
  assert_eq!(instance.status, InstanceStatus::WaitingForReply);

  // The reply path still works afterwards.
  h.engine.handle_event(inbound("c1", "hi")).await.unwrap();
  assert_eq!(h.transport.bodies().await, vec!["Thanks"]);
}

#[tokio::test(start_paused = true)]
async fn deactivate_aborts_and_cancels_timers() {
  let mut h = harness();
  h.engine.activate(&wait_flow()).await.unwrap();
  h.engine
    .start_contact("flow-wait", "c1", HashMap::new())
    .await
    .unwrap();

  h.engine.deactivate("flow-wait").await.unwrap();

  let instances = h.store.list_instances_for_flow("flow-wait").await.unwrap();
  assert_eq!(instances[0].status, InstanceStatus::Aborted);
  assert_eq!(instances[0].last_error.as_deref(), Some("flow deactivated"));

  // The cancelled timer never fires.
  tokio::time::sleep(Duration::from_secs(60)).await;
  assert!(h.events.try_recv().is_err());

  // Later messages from the contact are not engine events.
  let outcome = h.engine.handle_event(inbound("c1", "hello?")).await.unwrap();
  assert_eq!(outcome, HandleOutcome::NotHandled);
}

#[tokio::test]
async fn runaway_graph_aborts_only_that_instance() {
  // Two messages looping back via a marked edge: valid shape, infinite walk.
  let doc: FlowDoc = serde_json::from_value(json!({
    "id": "flow-loop",
    "name": "loop",
    "version": 1,
    "nodes": [
      {"id": "a", "type": "messageNode", "data": {"content": "ping"}},
      {"id": "b", "type": "messageNode", "data": {"content": "pong"}}
    ],
    "edges": [
      {"id": "e1", "source": "a", "target": "b"},
      {"id": "e2", "source": "b", "target": "a", "allowLoop": true}
    ]
  }))
  .unwrap();

  let h = harness_with(
    RecordingTransport::default(),
    EngineConfig {
      max_hops_per_tick: 5,
    },
  );
  h.engine.activate(&doc).await.unwrap();
  h.engine
    .start_contact("flow-loop", "c1", HashMap::new())
    .await
    .unwrap();

  let instances = h.store.list_instances_for_flow("flow-loop").await.unwrap();
  assert_eq!(instances[0].status, InstanceStatus::Aborted);
  assert_eq!(instances[0].last_error.as_deref(), Some("RunawayGraph"));

  // Dedup means the loop only ever sent each message once.
  assert_eq!(h.transport.bodies().await, vec!["ping", "pong"]);
}

#[tokio::test]
async fn single_live_instance_per_flow_and_contact() {
  let h = harness();
  h.engine.activate(&wait_flow()).await.unwrap();
  h.engine
    .start_contact("flow-wait", "c1", HashMap::new())
    .await
    .unwrap();

  let err = h
    .engine
    .start_contact("flow-wait", "c1", HashMap::new())
    .await
    .unwrap_err();
  assert!(matches!(err, EngineError::InstanceExists { .. }));
}

/// Two sequential question/answer rounds: "Q1" -> wait -> "Q2" -> wait ->
/// "Done", with both timeouts parked on a shared fallback message.
fn two_step_flow() -> FlowDoc {
  serde_json::from_value(json!({
    "id": "flow-steps",
    "name": "two questions",
    "version": 1,
    "nodes": [
      {"id": "m1", "type": "messageNode", "data": {"content": "Q1"}},
      {"id": "w1", "type": "waitNode", "data": {"waitTime": 3600, "waitUnit": "seconds"}},
      {"id": "m2", "type": "messageNode", "data": {"content": "Q2"}},
      {"id": "w2", "type": "waitNode", "data": {"waitTime": 3600, "waitUnit": "seconds"}},
      {"id": "m3", "type": "messageNode", "data": {"content": "Done"}},
      {"id": "t", "type": "messageNode", "data": {"content": "No rush"}}
    ],
    "edges": [
      {"id": "e1", "source": "m1", "target": "w1"},
      {"id": "e2", "source": "w1", "target": "m2", "sourceHandle": "reply"},
      {"id": "e3", "source": "w1", "target": "t", "sourceHandle": "timeout"},
      {"id": "e4", "source": "m2", "target": "w2"},
      {"id": "e5", "source": "w2", "target": "m3", "sourceHandle": "reply"},
      {"id": "e6", "source": "w2", "target": "t", "sourceHandle": "timeout"}
    ]
  }))
  .unwrap()
}

#[tokio::test]
async fn runner_serializes_events_per_contact() {
  let store = Arc::new(MemoryStore::new());
  let transport = Arc::new(RecordingTransport::default());
  let (tx, rx) = mpsc::unbounded_channel();
  let scheduler = TimerScheduler::new(tx.clone());
  let dispatcher = Dispatcher::new(
    store.clone() as Arc<dyn Store>,
    transport.clone(),
    DispatchConfig::default(),
  );
  let engine = Arc::new(FlowEngine::new(
    store.clone() as Arc<dyn Store>,
    dispatcher,
    scheduler,
    EngineConfig::default(),
  ));
  engine.activate(&two_step_flow()).await.unwrap();

  let runner = EngineRunner::new(Arc::clone(&engine), tx.clone(), rx);
  let cancel = CancellationToken::new();
  let runner_task = tokio::spawn(runner.start(cancel.clone()));

  engine
    .start_contact("flow-steps", "c1", HashMap::new())
    .await
    .unwrap();
  engine
    .start_contact("flow-steps", "c2", HashMap::new())
    .await
    .unwrap();

  // Interleave the two conversations. Each contact's second reply is only
  // meaningful if its first was fully applied before it, so out-of-order
  // or concurrent handling within a contact would strand the instance at
  // the second wait and fail the completion check below.
  for (contact, body) in [("c1", "one"), ("c2", "one"), ("c1", "two"), ("c2", "two")] {
    tx.send(EngineEvent::InboundMessage {
      contact_id: contact.to_string(),
      body: body.to_string(),
      received_at: chrono::Utc::now(),
    })
    .unwrap();
  }

  tokio::time::timeout(Duration::from_secs(5), async {
    loop {
      let instances = store.list_instances_for_flow("flow-steps").await.unwrap();
      if instances.len() == 2
        && instances.iter().all(|i| i.status == InstanceStatus::Completed)
      {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await
  .expect("both contacts should run to completion");

  // Per-contact sends arrive in graph order, independently per contact.
  for contact in ["c1", "c2"] {
    let sent: Vec<String> = transport
      .sent
      .lock()
      .await
      .iter()
      .filter(|(c, _)| c == contact)
      .map(|(_, b)| b.clone())
      .collect();
    assert_eq!(sent, vec!["Q1", "Q2", "Done"], "out of order for {contact}");
  }

  cancel.cancel();
  let _ = runner_task.await;
}

#[tokio::test(start_paused = true)]
async fn recover_reschedules_timers_from_the_store() {
  // First engine: start a conversation and leave it waiting.
  let h = harness();
  h.engine.activate(&wait_flow()).await.unwrap();
  h.engine
    .start_contact("flow-wait", "c1", HashMap::new())
    .await
    .unwrap();
  drop(h.engine);

  // "Restart": a fresh engine over the same store rebuilds its registry and
  // timers, and the wait still times out.
  let transport = Arc::new(RecordingTransport::default());
  let (tx, mut rx) = mpsc::unbounded_channel();
  let scheduler = TimerScheduler::new(tx);
  let dispatcher = Dispatcher::new(
    h.store.clone() as Arc<dyn Store>,
    transport.clone(),
    DispatchConfig::default(),
  );
  let engine = FlowEngine::new(
    h.store.clone() as Arc<dyn Store>,
    dispatcher,
    scheduler,
    EngineConfig::default(),
  );
  engine.recover(&["flow-wait".to_string()]).await.unwrap();

  tokio::time::sleep(Duration::from_secs(31)).await;
  let timer = rx.try_recv().expect("recovered timer should fire");
  engine.handle_event(timer).await.unwrap();
  assert_eq!(transport.bodies().await, vec!["Still there?"]);
}
