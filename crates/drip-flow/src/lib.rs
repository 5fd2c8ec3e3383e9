//! Drip Flow
//!
//! This crate provides the flow graph model for drip. A flow arrives from the
//! editor as a loosely-shaped JSON document ([`FlowDoc`]); one normalization
//! pass turns it into the closed node/edge variants, and validation locks it
//! into a [`FlowGraph`] that the execution engine can walk.
//!
//! Key differences between the two forms:
//! - `FlowDoc` tolerates the editor's legacy field aliases; `FlowGraph` does not.
//! - Graph structure is validated (single entry, tag completeness, acyclic).
//! - `FlowGraph` is immutable and only constructible through validation.

mod condition;
mod doc;
mod graph;
mod node;
mod render;
mod validate;

pub use condition::evaluate;
pub use doc::{DocEdge, DocNode, FlowDoc};
pub use graph::FlowGraph;
pub use node::{Edge, EdgeTag, Node, NodeKind, Operator};
pub use render::render_text;
pub use validate::{GraphError, GraphErrorReason};
