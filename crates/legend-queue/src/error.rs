/// Errors from queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
  /// The lease was acked, abandoned, or expired and reclaimed.
  #[error("lease not found: {token}")]
  LeaseNotFound { token: String },

  #[error("task queue lock poisoned")]
  Poisoned,
}
