use async_trait::async_trait;
use legend_workflow::{FailureKind, StepName};

/// What a collaborator knows about the attempt it is serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityContext {
  pub run_id: String,
  pub step: StepName,
  pub attempt: u32,
  /// Same for every attempt of this step in this run. Side effects keyed by
  /// it are overwritten on retry instead of duplicated.
  pub idempotency_key: String,
}

/// Errors reported by collaborators.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
  #[error("network error: {message}")]
  Network { message: String },

  #[error("rate limited")]
  RateLimited,

  /// The input can never succeed.
  #[error("invalid input: {message}")]
  InvalidInput { message: String },

  #[error("{message}")]
  NonRetryable { message: String },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("{message}")]
  Other { message: String },
}

impl CollaboratorError {
  pub fn invalid_input(message: impl Into<String>) -> Self {
    Self::InvalidInput {
      message: message.into(),
    }
  }
}

/// Decides whether a collaborator error is worth retrying.
pub trait FailureClassifier: Send + Sync {
  fn classify(&self, error: &CollaboratorError) -> FailureKind;
}

/// Network, rate-limit, I/O and unknown errors are retryable; invalid input
/// and explicit non-retryable errors are fatal.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
  fn classify(&self, error: &CollaboratorError) -> FailureKind {
    match error {
      CollaboratorError::InvalidInput { .. } | CollaboratorError::NonRetryable { .. } => {
        FailureKind::Fatal
      }
      CollaboratorError::Network { .. }
      | CollaboratorError::RateLimited
      | CollaboratorError::Io(_)
      | CollaboratorError::Other { .. } => FailureKind::Retryable,
    }
  }
}

/// An external operation behind a step.
#[async_trait]
pub trait ActivityCollaborator: Send + Sync {
  /// Name used to bind the collaborator in configuration.
  fn name(&self) -> &str;

  async fn invoke(
    &self,
    ctx: &ActivityContext,
    input: serde_json::Value,
  ) -> Result<serde_json::Value, CollaboratorError>;

  /// Override the executor's classifier for this collaborator's errors.
  fn classify(&self, _error: &CollaboratorError) -> Option<FailureKind> {
    None
  }
}
