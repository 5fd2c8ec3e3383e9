use drip_flow::GraphError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
  /// The flow document failed structural validation. No instances are ever
  /// created against an invalid graph.
  #[error("flow failed validation with {} error(s)", .0.len())]
  InvalidFlow(Vec<GraphError>),

  #[error("flow {0} is not active")]
  FlowNotActive(String),

  /// The contact already has a live instance of this flow.
  #[error("contact {contact_id} already has a live instance of flow {flow_id}")]
  InstanceExists {
    flow_id: String,
    contact_id: String,
  },

  #[error("stored flow document is not a valid graph: {0}")]
  CorruptFlowRecord(#[from] serde_json::Error),

  #[error(transparent)]
  Store(#[from] drip_store::Error),
}
