use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryBackoff {
  Constant,
  Linear,
  Exponential,
}

/// Retry limits and backoff shape for one step (or for infrastructure calls).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
  pub backoff: RetryBackoff,
  pub initial_delay_ms: u64,
  pub multiplier: f64,
  pub max_delay_ms: u64,
  /// Total attempts including the first one.
  pub max_attempts: u32,
  /// Wall-time ceiling measured from the step being scheduled.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_elapsed_ms: Option<u64>,
  /// When false, a timed out attempt is treated as fatal.
  pub retry_timeouts: bool,
}

impl Default for RetryPolicyConfig {
  fn default() -> Self {
    Self {
      backoff: RetryBackoff::Exponential,
      initial_delay_ms: 1_000,
      multiplier: 2.0,
      max_delay_ms: 30_000,
      max_attempts: 3,
      max_elapsed_ms: None,
      retry_timeouts: true,
    }
  }
}

impl RetryPolicyConfig {
  pub fn initial_delay(&self) -> Duration {
    Duration::from_millis(self.initial_delay_ms)
  }

  pub fn max_delay(&self) -> Duration {
    Duration::from_millis(self.max_delay_ms)
  }

  pub fn max_elapsed(&self) -> Option<Duration> {
    self.max_elapsed_ms.map(Duration::from_millis)
  }

  pub(crate) fn validate(&self, field: &str) -> Result<(), ConfigError> {
    if self.max_attempts == 0 {
      return Err(ConfigError::invalid(
        format!("{field}.max_attempts"),
        "must be at least 1",
      ));
    }
    if !self.multiplier.is_finite() || self.multiplier < 1.0 {
      return Err(ConfigError::invalid(
        format!("{field}.multiplier"),
        "must be a finite number >= 1.0",
      ));
    }
    if self.max_delay_ms < self.initial_delay_ms {
      return Err(ConfigError::invalid(
        format!("{field}.max_delay_ms"),
        "must not be smaller than initial_delay_ms",
      ));
    }
    Ok(())
  }
}
