use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::retry::{RetryBackoff, RetryPolicyConfig};

/// Per-step execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
  /// Per-attempt deadline.
  pub timeout_ms: u64,
  #[serde(default)]
  pub retry: RetryPolicyConfig,
  /// Name of the collaborator that performs this step.
  pub collaborator: String,
}

impl StepConfig {
  /// Scene analysis is expected to be fast: short deadline, a few quick retries.
  pub fn analyze_default() -> Self {
    Self {
      timeout_ms: 30_000,
      retry: RetryPolicyConfig {
        backoff: RetryBackoff::Exponential,
        initial_delay_ms: 1_000,
        multiplier: 2.0,
        max_delay_ms: 10_000,
        max_attempts: 3,
        max_elapsed_ms: None,
        retry_timeouts: true,
      },
      collaborator: "scene-analyzer".to_string(),
    }
  }

  /// The remix step may call a slow external agent: long deadline, fewer and slower retries.
  pub fn transform_default() -> Self {
    Self {
      timeout_ms: 120_000,
      retry: RetryPolicyConfig {
        backoff: RetryBackoff::Exponential,
        initial_delay_ms: 10_000,
        multiplier: 3.0,
        max_delay_ms: 60_000,
        max_attempts: 2,
        max_elapsed_ms: None,
        retry_timeouts: true,
      },
      collaborator: "remix-manifest".to_string(),
    }
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }

  pub(crate) fn validate(&self, field: &str) -> Result<(), ConfigError> {
    if self.timeout_ms == 0 {
      return Err(ConfigError::invalid(
        format!("{field}.timeout_ms"),
        "must be greater than zero",
      ));
    }
    if self.collaborator.trim().is_empty() {
      return Err(ConfigError::invalid(
        format!("{field}.collaborator"),
        "must name a collaborator",
      ));
    }
    self.retry.validate(&format!("{field}.retry"))
  }
}
