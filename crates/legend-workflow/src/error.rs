use crate::machine::WorkflowFailure;

/// A history that cannot be replayed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
  #[error("run '{run_id}' has no history")]
  Empty { run_id: String },

  #[error("run '{run_id}': expected sequence {expected}, found {found}")]
  SequenceGap {
    run_id: String,
    expected: u64,
    found: u64,
  },

  #[error("run '{run_id}': history contains a record of run '{found}'")]
  ForeignRecord { run_id: String, found: String },

  #[error("run '{run_id}': unexpected {event} at sequence {sequence}: {message}")]
  UnexpectedEvent {
    run_id: String,
    sequence: u64,
    event: &'static str,
    message: String,
  },

  #[error(
    "run '{run_id}': recorded {recorded} at sequence {sequence}, replay decided {decided}"
  )]
  NonDeterministic {
    run_id: String,
    sequence: u64,
    recorded: String,
    decided: String,
  },
}

impl ReplayError {
  pub fn run_id(&self) -> &str {
    match self {
      ReplayError::Empty { run_id }
      | ReplayError::SequenceGap { run_id, .. }
      | ReplayError::ForeignRecord { run_id, .. }
      | ReplayError::UnexpectedEvent { run_id, .. }
      | ReplayError::NonDeterministic { run_id, .. } => run_id,
    }
  }

  /// The terminal failure reported for a run whose history does not replay.
  pub fn to_failure(&self) -> WorkflowFailure {
    WorkflowFailure::HistoryCorruption {
      message: self.to_string(),
    }
  }
}
