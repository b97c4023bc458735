//! Retry policy.
//!
//! [`RetryPolicy::decide`] is a pure function of the attempt count, the time
//! elapsed since the step was scheduled, and the failure kind. Callers take
//! both numbers from recorded history so that the decision can be recomputed
//! at any time with the same result.

use std::time::Duration;

use legend_config::{RetryBackoff, RetryPolicyConfig};

use crate::activity::{ActivityError, FailureKind};

/// Whether to try again, and after how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
  pub retry: bool,
  pub backoff_delay: Duration,
}

impl RetryDecision {
  pub fn retry_after(delay: Duration) -> Self {
    Self {
      retry: true,
      backoff_delay: delay,
    }
  }

  pub fn give_up() -> Self {
    Self {
      retry: false,
      backoff_delay: Duration::ZERO,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
  backoff: RetryBackoff,
  initial_delay: Duration,
  multiplier: f64,
  max_delay: Duration,
  max_attempts: u32,
  max_elapsed: Option<Duration>,
  retry_timeouts: bool,
}

impl From<&RetryPolicyConfig> for RetryPolicy {
  fn from(config: &RetryPolicyConfig) -> Self {
    Self {
      backoff: config.backoff,
      initial_delay: config.initial_delay(),
      multiplier: config.multiplier,
      max_delay: config.max_delay(),
      max_attempts: config.max_attempts,
      max_elapsed: config.max_elapsed(),
      retry_timeouts: config.retry_timeouts,
    }
  }
}

impl RetryPolicy {
  pub fn max_attempts(&self) -> u32 {
    self.max_attempts
  }

  /// Delay before the attempt that follows attempt number `attempt`.
  pub fn backoff_delay(&self, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let initial_ms = self.initial_delay.as_millis() as f64;
    let raw_ms = match self.backoff {
      RetryBackoff::Constant => initial_ms,
      RetryBackoff::Linear => initial_ms * f64::from(attempt),
      RetryBackoff::Exponential => {
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        initial_ms * self.multiplier.powi(exponent)
      }
    };

    let cap_ms = self.max_delay.as_millis() as f64;
    let ms = if raw_ms.is_finite() {
      raw_ms.min(cap_ms)
    } else {
      cap_ms
    };
    Duration::from_millis(ms as u64)
  }

  /// Apply policy overrides to the kind a failure was reported with.
  pub fn classify(&self, error: &ActivityError, reported: FailureKind) -> FailureKind {
    if error.is_timeout() && !self.retry_timeouts {
      return FailureKind::Fatal;
    }
    reported
  }

  /// Decide whether attempt number `attempt`, which failed with `kind`,
  /// `elapsed` after the step was scheduled, should be retried.
  ///
  /// Stops when the attempt limit is reached or when the next attempt would
  /// start at or past the elapsed-time ceiling, whichever comes first.
  pub fn decide(&self, attempt: u32, elapsed: Duration, kind: FailureKind) -> RetryDecision {
    if kind == FailureKind::Fatal {
      return RetryDecision::give_up();
    }
    if attempt >= self.max_attempts {
      return RetryDecision::give_up();
    }

    let delay = self.backoff_delay(attempt);
    if let Some(max_elapsed) = self.max_elapsed {
      if elapsed.saturating_add(delay) >= max_elapsed {
        return RetryDecision::give_up();
      }
    }

    RetryDecision::retry_after(delay)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn policy(backoff: RetryBackoff) -> RetryPolicy {
    RetryPolicy::from(&RetryPolicyConfig {
      backoff,
      initial_delay_ms: 100,
      multiplier: 2.0,
      max_delay_ms: 1_000,
      max_attempts: 5,
      max_elapsed_ms: None,
      retry_timeouts: true,
    })
  }

  #[test]
  fn test_exponential_backoff_is_capped() {
    let policy = policy(RetryBackoff::Exponential);
    let delays: Vec<u128> = (1..=6)
      .map(|attempt| policy.backoff_delay(attempt).as_millis())
      .collect();
    assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
  }

  #[test]
  fn test_linear_and_constant_backoff() {
    let linear = policy(RetryBackoff::Linear);
    assert_eq!(linear.backoff_delay(3), Duration::from_millis(300));

    let constant = policy(RetryBackoff::Constant);
    assert_eq!(constant.backoff_delay(4), Duration::from_millis(100));
  }

  #[test]
  fn test_huge_attempt_does_not_overflow() {
    let policy = policy(RetryBackoff::Exponential);
    assert_eq!(policy.backoff_delay(u32::MAX), Duration::from_millis(1_000));
  }

  #[test]
  fn test_fatal_never_retries() {
    let policy = policy(RetryBackoff::Exponential);
    assert_eq!(
      policy.decide(1, Duration::ZERO, FailureKind::Fatal),
      RetryDecision::give_up()
    );
  }

  #[test]
  fn test_attempt_limit() {
    let policy = policy(RetryBackoff::Exponential);
    assert_eq!(
      policy.decide(4, Duration::ZERO, FailureKind::Retryable),
      RetryDecision::retry_after(Duration::from_millis(800))
    );
    assert!(
      !policy
        .decide(5, Duration::ZERO, FailureKind::Retryable)
        .retry
    );
  }

  #[test]
  fn test_elapsed_ceiling_stops_first() {
    let policy = RetryPolicy::from(&RetryPolicyConfig {
      backoff: RetryBackoff::Constant,
      initial_delay_ms: 100,
      multiplier: 1.0,
      max_delay_ms: 100,
      max_attempts: 10,
      max_elapsed_ms: Some(1_000),
      retry_timeouts: true,
    });

    assert!(
      policy
        .decide(2, Duration::from_millis(850), FailureKind::Retryable)
        .retry
    );
    assert!(
      !policy
        .decide(2, Duration::from_millis(900), FailureKind::Retryable)
        .retry
    );
  }

  #[test]
  fn test_timeouts_can_be_fatal() {
    let timeout = ActivityError::TimeoutExceeded { timeout_ms: 10 };
    let other = ActivityError::collaborator("scene-analyzer", "connection reset");

    let lenient = policy(RetryBackoff::Exponential);
    assert_eq!(
      lenient.classify(&timeout, FailureKind::Retryable),
      FailureKind::Retryable
    );

    let strict = RetryPolicy::from(&RetryPolicyConfig {
      retry_timeouts: false,
      ..RetryPolicyConfig::default()
    });
    assert_eq!(
      strict.classify(&timeout, FailureKind::Retryable),
      FailureKind::Fatal
    );
    assert_eq!(
      strict.classify(&other, FailureKind::Retryable),
      FailureKind::Retryable
    );
  }
}
