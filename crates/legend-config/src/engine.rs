use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::retry::{RetryBackoff, RetryPolicyConfig};
use crate::step::StepConfig;

/// Where workflow history is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
  /// Process-local history, lost on exit.
  Memory,
  /// SQLite database, e.g. `sqlite://legend.db?mode=rwc`.
  Sqlite { url: String },
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Workflow type name recorded on every run.
  pub workflow_type: String,
  /// Name of the task queue workers pull from.
  pub task_queue: String,
  /// Number of concurrent worker loops.
  pub workers: usize,
  /// How long a claimed work item stays invisible to other workers.
  pub lease_ms: u64,
  /// Idle delay between queue polls.
  pub poll_interval_ms: u64,
  /// Backoff used when the store or queue is unavailable.
  pub infra_retry: RetryPolicyConfig,
  /// Directory the manifest writer puts its output in.
  pub output_dir: PathBuf,
  /// Text file consulted for timing notes. Built-in guidance when unset.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub style_guide: Option<PathBuf>,
  /// Terminal runs older than this are archived by the retention sweep.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub retention_ms: Option<u64>,
  pub store: StoreConfig,
  pub analyze: StepConfig,
  pub transform: StepConfig,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      workflow_type: "legend_engine".to_string(),
      task_queue: "chaplin-production-queue".to_string(),
      workers: 4,
      lease_ms: 30_000,
      poll_interval_ms: 50,
      infra_retry: RetryPolicyConfig {
        backoff: RetryBackoff::Exponential,
        initial_delay_ms: 100,
        multiplier: 2.0,
        max_delay_ms: 5_000,
        max_attempts: u32::MAX,
        max_elapsed_ms: None,
        retry_timeouts: true,
      },
      output_dir: PathBuf::from("manifests"),
      style_guide: None,
      retention_ms: None,
      store: StoreConfig::Memory,
      analyze: StepConfig::analyze_default(),
      transform: StepConfig::transform_default(),
    }
  }
}

impl EngineConfig {
  /// Parse and validate a JSON document.
  pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
    let config: Self = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
  }

  /// Read, parse and validate a JSON config file.
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_json_str(&content)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.workflow_type.trim().is_empty() {
      return Err(ConfigError::invalid("workflow_type", "must not be empty"));
    }
    if self.task_queue.trim().is_empty() {
      return Err(ConfigError::invalid("task_queue", "must not be empty"));
    }
    if self.workers == 0 {
      return Err(ConfigError::invalid("workers", "must be at least 1"));
    }
    if self.lease_ms == 0 {
      return Err(ConfigError::invalid("lease_ms", "must be greater than zero"));
    }
    if self.poll_interval_ms == 0 {
      return Err(ConfigError::invalid(
        "poll_interval_ms",
        "must be greater than zero",
      ));
    }
    if let StoreConfig::Sqlite { url } = &self.store {
      if url.trim().is_empty() {
        return Err(ConfigError::invalid("store.url", "must not be empty"));
      }
    }
    self.infra_retry.validate("infra_retry")?;
    self.analyze.validate("analyze")?;
    self.transform.validate("transform")
  }

  pub fn lease(&self) -> Duration {
    Duration::from_millis(self.lease_ms)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms)
  }

  pub fn retention(&self) -> Option<Duration> {
    self.retention_ms.map(Duration::from_millis)
  }
}

#[cfg(test)]
mod tests {
  use std::io::Write;

  use super::*;

  #[test]
  fn test_defaults_are_valid() {
    let config = EngineConfig::default();
    config.validate().unwrap();

    assert_eq!(config.task_queue, "chaplin-production-queue");
    assert_eq!(config.analyze.timeout_ms, 30_000);
    assert_eq!(config.transform.timeout_ms, 120_000);
    assert!(config.transform.retry.max_attempts < config.analyze.retry.max_attempts);
  }

  #[test]
  fn test_partial_document_keeps_defaults() {
    let config = EngineConfig::from_json_str(
      r#"{
        "workers": 2,
        "transform": {
          "timeout_ms": 500,
          "collaborator": "remix-manifest",
          "retry": { "max_attempts": 5 }
        }
      }"#,
    )
    .unwrap();

    assert_eq!(config.workers, 2);
    assert_eq!(config.transform.timeout_ms, 500);
    assert_eq!(config.transform.retry.max_attempts, 5);
    // retry fields not named fall back to the generic defaults
    assert_eq!(config.transform.retry.initial_delay_ms, 1_000);
    assert_eq!(config.analyze, StepConfig::analyze_default());
    assert_eq!(config.store, StoreConfig::Memory);
  }

  #[test]
  fn test_sqlite_store_config() {
    let config = EngineConfig::from_json_str(
      r#"{ "store": { "kind": "sqlite", "url": "sqlite://legend.db?mode=rwc" } }"#,
    )
    .unwrap();

    assert_eq!(
      config.store,
      StoreConfig::Sqlite {
        url: "sqlite://legend.db?mode=rwc".to_string()
      }
    );
  }

  #[test]
  fn test_rejects_zero_attempts() {
    let err = EngineConfig::from_json_str(
      r#"{ "analyze": { "timeout_ms": 10, "collaborator": "scene-analyzer", "retry": { "max_attempts": 0 } } }"#,
    )
    .unwrap_err();

    match err {
      ConfigError::Invalid { field, .. } => assert_eq!(field, "analyze.retry.max_attempts"),
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn test_rejects_shrinking_multiplier() {
    let mut config = EngineConfig::default();
    config.transform.retry.multiplier = 0.5;

    assert!(matches!(
      config.validate(),
      Err(ConfigError::Invalid { .. })
    ));
  }

  #[test]
  fn test_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{ "task_queue": "night-shift" }}"#).unwrap();

    let config = EngineConfig::from_file(file.path()).unwrap();
    assert_eq!(config.task_queue, "night-shift");
  }

  #[test]
  fn test_missing_file() {
    let err = EngineConfig::from_file("/definitely/not/here.json").unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
  }
}
