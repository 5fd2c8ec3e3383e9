//! Drip Engine
//!
//! The execution engine for drip flows: it advances one instance of a flow
//! graph per contact, reacting to inbound messages and elapsed wait timers,
//! and guarantees every conversation occupies exactly one well-defined
//! position in its graph.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       EngineRunner                          │
//! │  - owns the EngineEvent mpsc channel                        │
//! │  - one single-writer worker task per contact                │
//! │  - start(cancel) runs the routing loop                      │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        FlowEngine                           │
//! │  - activate/deactivate flows, start contacts                │
//! │  - handle_event: the Message/Condition/Wait state machine   │
//! │  - claims each event via a revision CAS in the Store        │
//! └─────────────────────────────────────────────────────────────┘
//!                 │                            │
//!                 ▼                            ▼
//! ┌───────────────────────────┐  ┌───────────────────────────────┐
//! │        Dispatcher         │  │        TimerScheduler         │
//! │  dedup + retry, then the  │  │  sleeps until wait deadlines, │
//! │  Transport adapter        │  │  feeds TimerFired back in     │
//! └───────────────────────────┘  └───────────────────────────────┘
//! ```
//!
//! The store is the single source of truth: the engine never advances
//! speculative state, and both send dedup keys and wait deadlines live in it
//! so a process restart loses nothing.

mod dispatcher;
mod engine;
mod error;
mod events;
mod router;
mod runner;
mod scheduler;
mod transport;

pub use dispatcher::{DispatchConfig, DispatchResult, Dispatcher};
pub use engine::{EngineConfig, EngineEvent, FlowEngine, HandleOutcome};
pub use error::EngineError;
pub use events::{ChannelNotifier, ExecutionEvent, ExecutionNotifier, NoopNotifier};
pub use router::InboundRouter;
pub use runner::EngineRunner;
pub use scheduler::TimerScheduler;
pub use transport::{ConsoleTransport, Transport, TransportError};
