use thiserror::Error;

/// Errors raised while composing or committing a workflow graph.
#[derive(Debug, Error)]
pub enum BuildError {
  #[error("workflow '{workflow_id}' has already been committed")]
  AlreadyCommitted { workflow_id: String },

  #[error("workflow '{workflow_id}' has no nodes")]
  Empty { workflow_id: String },

  #[error("duplicate node id '{node_id}' in workflow '{workflow_id}'")]
  DuplicateId {
    workflow_id: String,
    node_id: String,
  },

  #[error("invalid node id '{node_id}': {reason}")]
  InvalidId { node_id: String, reason: String },

  #[error("invalid {kind} node in workflow '{workflow_id}': {reason}")]
  InvalidNode {
    workflow_id: String,
    kind: &'static str,
    reason: String,
  },

  #[error("output of '{from}' cannot feed '{to}': {reason}")]
  IncompatibleSchema {
    from: String,
    to: String,
    reason: String,
  },
}
