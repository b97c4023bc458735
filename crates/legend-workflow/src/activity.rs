//! Activity invocation types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::step::StepName;

/// How a failed attempt should be treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
  Retryable,
  Fatal,
}

/// Why a single activity attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityError {
  /// The collaborator reported an error.
  #[error("{collaborator}: {message}")]
  Collaborator {
    collaborator: String,
    message: String,
  },

  /// The attempt did not finish before its deadline and was abandoned.
  #[error("activity exceeded its {timeout_ms}ms deadline")]
  TimeoutExceeded { timeout_ms: u64 },
}

impl ActivityError {
  pub fn collaborator(collaborator: impl Into<String>, message: impl Into<String>) -> Self {
    Self::Collaborator {
      collaborator: collaborator.into(),
      message: message.into(),
    }
  }

  pub fn is_timeout(&self) -> bool {
    matches!(self, Self::TimeoutExceeded { .. })
  }
}

/// Outcome of one activity attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActivityOutcome {
  Pending,
  Succeeded { output: serde_json::Value },
  FailedRetryable { cause: ActivityError },
  FailedFatal { cause: ActivityError },
}

impl ActivityOutcome {
  pub fn is_pending(&self) -> bool {
    matches!(self, Self::Pending)
  }

  /// The failure kind, for failed outcomes.
  pub fn failure_kind(&self) -> Option<FailureKind> {
    match self {
      Self::FailedRetryable { .. } => Some(FailureKind::Retryable),
      Self::FailedFatal { .. } => Some(FailureKind::Fatal),
      Self::Pending | Self::Succeeded { .. } => None,
    }
  }
}

/// One attempt at running a step.
///
/// Identity is `(run_id, step, attempt)`. Once an outcome is recorded the
/// invocation no longer changes; a retry is a new invocation with the next
/// attempt number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInvocation {
  pub run_id: String,
  pub step: StepName,
  /// 1-based attempt number.
  pub attempt: u32,
  pub input: serde_json::Value,
  pub timeout_ms: u64,
  outcome: ActivityOutcome,
}

impl ActivityInvocation {
  pub fn new(
    run_id: impl Into<String>,
    step: StepName,
    attempt: u32,
    input: serde_json::Value,
    timeout: Duration,
  ) -> Self {
    Self {
      run_id: run_id.into(),
      step,
      attempt,
      input,
      timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
      outcome: ActivityOutcome::Pending,
    }
  }

  /// Unique key of this invocation.
  pub fn key(&self) -> String {
    format!("{}:{}:{}", self.run_id, self.step, self.attempt)
  }

  /// Attempt-independent key for side effects of this step.
  ///
  /// Every attempt of the same step in the same run shares it, so writes keyed
  /// by it overwrite instead of piling up.
  pub fn idempotency_key(&self) -> String {
    format!("{}-{}", self.run_id, self.step)
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }

  pub fn outcome(&self) -> &ActivityOutcome {
    &self.outcome
  }

  /// Record the outcome.
  ///
  /// Returns the rejected outcome if one was already recorded.
  pub fn record(&mut self, outcome: ActivityOutcome) -> Result<(), ActivityOutcome> {
    if !self.outcome.is_pending() {
      return Err(outcome);
    }
    self.outcome = outcome;
    Ok(())
  }
}
