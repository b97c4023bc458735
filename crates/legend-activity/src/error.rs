//! Executor construction errors.

/// Errors that can occur while building an [`ActivityExecutor`](crate::ActivityExecutor).
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
  /// No built-in collaborator has this name.
  #[error("unknown collaborator '{name}' for step '{step}'")]
  UnknownCollaborator { step: String, name: String },
}
