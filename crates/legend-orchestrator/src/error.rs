//! Orchestrator and client errors.

use legend_activity::ExecutorError;
use legend_queue::QueueError;

/// Errors raised while processing work items.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
  #[error("store error: {0}")]
  Store(#[from] legend_store::Error),

  #[error("queue error: {0}")]
  Queue(#[from] QueueError),

  #[error("queue '{queue}' is full")]
  QueueFull { queue: String },

  #[error("invalid work item '{item_id}': {message}")]
  InvalidWorkItem { item_id: String, message: String },

  #[error(transparent)]
  Executor(#[from] ExecutorError),
}

impl OrchestratorError {
  /// Another writer appended to the run first.
  pub fn is_conflict(&self) -> bool {
    matches!(self, OrchestratorError::Store(e) if e.is_conflict())
  }
}

/// Errors returned by [`OrchestratorClient`](crate::OrchestratorClient).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
  #[error("run not found: {run_id}")]
  RunNotFound { run_id: String },

  #[error("scene id must not be empty")]
  InvalidSceneId,

  #[error(transparent)]
  Orchestrator(#[from] OrchestratorError),
}

impl From<legend_store::Error> for ClientError {
  fn from(e: legend_store::Error) -> Self {
    match e {
      legend_store::Error::NotFound(run_id) => ClientError::RunNotFound { run_id },
      other => ClientError::Orchestrator(other.into()),
    }
  }
}

impl From<QueueError> for ClientError {
  fn from(e: QueueError) -> Self {
    ClientError::Orchestrator(e.into())
  }
}
