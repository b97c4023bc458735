use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use legend_workflow::{EventRecord, HistoryEvent};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{debug, info, warn};

use crate::{Error, RunSummary, Store};

/// SQLite-based store implementation.
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open `url`, creating the database if needed, and run migrations.
  pub async fn connect(url: &str) -> Result<Self, Error> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    // Every connection to `:memory:` opens its own database.
    let max_connections = if url.contains(":memory:") { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
      .max_connections(max_connections)
      .connect_with(options)
      .await?;

    let store = Self::new(pool);
    store.migrate().await?;
    debug!(url, max_connections, "sqlite_store_opened");
    Ok(store)
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(&self.pool).await
  }
}

fn decode(
  run_id: &str,
  sequence: i64,
  recorded_at: DateTime<Utc>,
  event: &str,
) -> Result<EventRecord, Error> {
  let sequence = sequence as u64;
  let event: HistoryEvent = serde_json::from_str(event).map_err(|e| Error::Corrupt {
    run_id: run_id.to_string(),
    sequence,
    message: e.to_string(),
  })?;
  Ok(EventRecord::new(run_id, sequence, recorded_at, event))
}

#[async_trait]
impl Store for SqliteStore {
  async fn append(
    &self,
    run_id: &str,
    expected_sequence: u64,
    event: HistoryEvent,
  ) -> Result<EventRecord, Error> {
    let payload = serde_json::to_string(&event)?;
    let mut tx = self.pool.begin().await?;

    let actual: i64 = sqlx::query_scalar(
      r#"
            SELECT COALESCE(MAX(sequence), 0)
            FROM run_history
            WHERE run_id = ?
            "#,
    )
    .bind(run_id)
    .fetch_one(&mut *tx)
    .await?;
    let actual = actual as u64;

    if actual != expected_sequence {
      return Err(Error::Conflict {
        run_id: run_id.to_string(),
        expected: expected_sequence,
        actual,
      });
    }

    let sequence = actual + 1;
    let recorded_at = Utc::now();
    let inserted = sqlx::query(
      r#"
            INSERT INTO run_history (run_id, sequence, recorded_at, event)
            VALUES (?, ?, ?, ?)
            "#,
    )
    .bind(run_id)
    .bind(sequence as i64)
    .bind(recorded_at)
    .bind(&payload)
    .execute(&mut *tx)
    .await;

    match inserted {
      Ok(_) => {}
      Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
        return Err(Error::Conflict {
          run_id: run_id.to_string(),
          expected: expected_sequence,
          actual: sequence,
        });
      }
      Err(e) => return Err(e.into()),
    }

    tx.commit().await?;
    Ok(EventRecord::new(run_id, sequence, recorded_at, event))
  }

  async fn read_history(&self, run_id: &str) -> Result<Vec<EventRecord>, Error> {
    let rows: Vec<(i64, DateTime<Utc>, String)> = sqlx::query_as(
      r#"
            SELECT sequence, recorded_at, event
            FROM run_history
            WHERE run_id = ?
            ORDER BY sequence ASC
            "#,
    )
    .bind(run_id)
    .fetch_all(&self.pool)
    .await?;

    if rows.is_empty() {
      return Err(Error::NotFound(run_id.to_string()));
    }

    rows
      .into_iter()
      .map(|(sequence, recorded_at, event)| decode(run_id, sequence, recorded_at, &event))
      .collect()
  }

  async fn list_runs(&self) -> Result<Vec<RunSummary>, Error> {
    let rows: Vec<(String, i64, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
      r#"
            SELECT run_id, MAX(sequence), MIN(recorded_at), MAX(recorded_at)
            FROM run_history
            GROUP BY run_id
            ORDER BY MIN(recorded_at) ASC, run_id ASC
            "#,
    )
    .fetch_all(&self.pool)
    .await?;

    Ok(
      rows
        .into_iter()
        .map(
          |(run_id, last_sequence, started_at, updated_at)| RunSummary {
            run_id,
            last_sequence: last_sequence as u64,
            started_at,
            updated_at,
          },
        )
        .collect(),
    )
  }

  async fn quarantine(&self, run_id: &str, reason: &str) -> Result<(), Error> {
    let exists: Option<i64> =
      sqlx::query_scalar("SELECT 1 FROM run_history WHERE run_id = ? LIMIT 1")
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
    if exists.is_none() {
      return Err(Error::NotFound(run_id.to_string()));
    }

    sqlx::query(
      r#"
            INSERT OR REPLACE INTO quarantined_runs (run_id, reason, quarantined_at)
            VALUES (?, ?, ?)
            "#,
    )
    .bind(run_id)
    .bind(reason)
    .bind(Utc::now())
    .execute(&self.pool)
    .await?;

    warn!(run_id, reason, "run_quarantined");
    Ok(())
  }

  async fn quarantine_reason(&self, run_id: &str) -> Result<Option<String>, Error> {
    let reason = sqlx::query_scalar("SELECT reason FROM quarantined_runs WHERE run_id = ?")
      .bind(run_id)
      .fetch_optional(&self.pool)
      .await?;
    Ok(reason)
  }

  async fn archive(&self, run_id: &str) -> Result<(), Error> {
    let history = self.read_history(run_id).await?;
    let payload = serde_json::to_string(&history)?;

    let mut tx = self.pool.begin().await?;
    sqlx::query(
      r#"
            INSERT OR REPLACE INTO archived_runs (run_id, history, archived_at)
            VALUES (?, ?, ?)
            "#,
    )
    .bind(run_id)
    .bind(&payload)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM run_history WHERE run_id = ?")
      .bind(run_id)
      .execute(&mut *tx)
      .await?;

    tx.commit().await?;
    info!(run_id, events = history.len(), "run_archived");
    Ok(())
  }

  async fn read_archived(&self, run_id: &str) -> Result<Vec<EventRecord>, Error> {
    let payload: Option<String> =
      sqlx::query_scalar("SELECT history FROM archived_runs WHERE run_id = ?")
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
    let payload = payload.ok_or_else(|| Error::NotFound(run_id.to_string()))?;

    serde_json::from_str(&payload).map_err(|e| Error::Corrupt {
      run_id: run_id.to_string(),
      sequence: 0,
      message: e.to_string(),
    })
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  async fn store() -> SqliteStore {
    SqliteStore::connect("sqlite::memory:").await.unwrap()
  }

  fn started() -> HistoryEvent {
    HistoryEvent::WorkflowStarted {
      workflow_type: "legend_engine".to_string(),
      input: json!("scene-42"),
    }
  }

  #[tokio::test]
  async fn test_append_and_read_history() {
    let store = store().await;

    store.append("run-1", 0, started()).await.unwrap();
    store
      .append("run-1", 1, HistoryEvent::CancelRequested)
      .await
      .unwrap();

    let history = store.read_history("run-1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].event, started());
    assert_eq!(history[1].sequence, 2);
    assert_eq!(history[1].event, HistoryEvent::CancelRequested);
  }

  #[tokio::test]
  async fn test_conflicting_append() {
    let store = store().await;
    store.append("run-1", 0, started()).await.unwrap();

    let err = store
      .append("run-1", 0, HistoryEvent::CancelRequested)
      .await
      .unwrap_err();
    assert!(matches!(
      err,
      Error::Conflict {
        expected: 0,
        actual: 1,
        ..
      }
    ));
    assert_eq!(store.read_history("run-1").await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_missing_run() {
    let store = store().await;
    assert!(matches!(
      store.read_history("nope").await,
      Err(Error::NotFound(_))
    ));
  }

  #[tokio::test]
  async fn test_unreadable_record_is_corrupt() {
    let store = store().await;
    store.append("run-1", 0, started()).await.unwrap();

    sqlx::query("UPDATE run_history SET event = '{\"event\":\"bogus\"}' WHERE run_id = 'run-1'")
      .execute(&store.pool)
      .await
      .unwrap();

    assert!(matches!(
      store.read_history("run-1").await,
      Err(Error::Corrupt { sequence: 1, .. })
    ));
  }

  #[tokio::test]
  async fn test_quarantine_and_archive() {
    let store = store().await;
    store.append("run-1", 0, started()).await.unwrap();
    store.append("run-2", 0, started()).await.unwrap();

    store.quarantine("run-2", "sequence gap").await.unwrap();
    assert_eq!(
      store.quarantine_reason("run-2").await.unwrap().as_deref(),
      Some("sequence gap")
    );
    assert_eq!(store.quarantine_reason("run-1").await.unwrap(), None);

    store.archive("run-1").await.unwrap();
    let runs: Vec<String> = store
      .list_runs()
      .await
      .unwrap()
      .into_iter()
      .map(|r| r.run_id)
      .collect();
    assert_eq!(runs, vec!["run-2".to_string()]);

    let archived = store.read_archived("run-1").await.unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].event, started());
  }
}
