//! Legend Store
//!
//! This crate provides durable, append-only storage for run histories.
//! Each run is a sequence of [`EventRecord`]s numbered from 1 without gaps.
//!
//! The [`Store`] trait defines operations for:
//! - Appending an event, conditional on the caller's last seen sequence
//! - Reading a run's full history
//! - Quarantining runs whose history does not replay
//! - Archiving finished runs
//!
//! The sequence check on [`Store::append`] is what keeps a single writer per
//! run: two workers that read the same history race to append, and the loser
//! gets [`Error::Conflict`] instead of forking the history.

mod memory;
mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use legend_config::StoreConfig;
use legend_workflow::{EventRecord, HistoryEvent};
use serde::{Deserialize, Serialize};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested run was not found.
  #[error("run not found: {0}")]
  NotFound(String),

  /// Another writer appended first.
  #[error("run '{run_id}': expected last sequence {expected}, store has {actual}")]
  Conflict {
    run_id: String,
    expected: u64,
    actual: u64,
  },

  /// A stored record could not be decoded.
  #[error("run '{run_id}': record {sequence} is unreadable: {message}")]
  Corrupt {
    run_id: String,
    sequence: u64,
    message: String,
  },

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("migration error: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),
}

impl Error {
  pub fn is_conflict(&self) -> bool {
    matches!(self, Error::Conflict { .. })
  }
}

/// A stored run, as listed by [`Store::list_runs`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
  pub run_id: String,
  pub last_sequence: u64,
  pub started_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// Storage trait for run histories.
#[async_trait]
pub trait Store: Send + Sync {
  /// Append `event` to a run.
  ///
  /// `expected_sequence` is the sequence of the last record the caller has
  /// seen, 0 for a new run. The new record gets `expected_sequence + 1`.
  async fn append(
    &self,
    run_id: &str,
    expected_sequence: u64,
    event: HistoryEvent,
  ) -> Result<EventRecord, Error>;

  /// Read a run's history in sequence order.
  async fn read_history(&self, run_id: &str) -> Result<Vec<EventRecord>, Error>;

  /// List runs that have not been archived.
  async fn list_runs(&self) -> Result<Vec<RunSummary>, Error>;

  /// Mark a run as quarantined. Its history stays readable.
  async fn quarantine(&self, run_id: &str, reason: &str) -> Result<(), Error>;

  /// The quarantine reason, if the run is quarantined.
  async fn quarantine_reason(&self, run_id: &str) -> Result<Option<String>, Error>;

  /// Move a run's history out of the active set.
  async fn archive(&self, run_id: &str) -> Result<(), Error>;

  /// Read the history of an archived run.
  async fn read_archived(&self, run_id: &str) -> Result<Vec<EventRecord>, Error>;
}

/// Open the store described by `config`.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn Store>, Error> {
  match config {
    StoreConfig::Memory => Ok(Arc::new(InMemoryStore::new())),
    StoreConfig::Sqlite { url } => {
      let store = SqliteStore::connect(url).await?;
      Ok(Arc::new(store))
    }
  }
}
