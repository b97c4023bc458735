use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use legend_workflow::{EventRecord, HistoryEvent};
use tracing::{info, warn};

use crate::{Error, RunSummary, Store};

#[derive(Default)]
struct State {
  runs: HashMap<String, Vec<EventRecord>>,
  quarantined: HashMap<String, String>,
  archived: HashMap<String, Vec<EventRecord>>,
}

/// Process-local store. History is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStore {
  state: Mutex<State>,
}

impl InMemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

#[async_trait]
impl Store for InMemoryStore {
  async fn append(
    &self,
    run_id: &str,
    expected_sequence: u64,
    event: HistoryEvent,
  ) -> Result<EventRecord, Error> {
    let mut state = self.lock();
    let history = state.runs.entry(run_id.to_string()).or_default();

    let actual = history.last().map_or(0, |r| r.sequence);
    if actual != expected_sequence {
      if history.is_empty() {
        state.runs.remove(run_id);
      }
      return Err(Error::Conflict {
        run_id: run_id.to_string(),
        expected: expected_sequence,
        actual,
      });
    }

    let record = EventRecord::new(run_id, actual + 1, Utc::now(), event);
    history.push(record.clone());
    Ok(record)
  }

  async fn read_history(&self, run_id: &str) -> Result<Vec<EventRecord>, Error> {
    self
      .lock()
      .runs
      .get(run_id)
      .cloned()
      .ok_or_else(|| Error::NotFound(run_id.to_string()))
  }

  async fn list_runs(&self) -> Result<Vec<RunSummary>, Error> {
    let state = self.lock();
    let mut runs: Vec<RunSummary> = state
      .runs
      .iter()
      .filter_map(|(run_id, history)| {
        let first = history.first()?;
        let last = history.last()?;
        Some(RunSummary {
          run_id: run_id.clone(),
          last_sequence: last.sequence,
          started_at: first.recorded_at,
          updated_at: last.recorded_at,
        })
      })
      .collect();
    runs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.run_id.cmp(&b.run_id)));
    Ok(runs)
  }

  async fn quarantine(&self, run_id: &str, reason: &str) -> Result<(), Error> {
    let mut state = self.lock();
    if !state.runs.contains_key(run_id) {
      return Err(Error::NotFound(run_id.to_string()));
    }
    state
      .quarantined
      .insert(run_id.to_string(), reason.to_string());
    warn!(run_id, reason, "run_quarantined");
    Ok(())
  }

  async fn quarantine_reason(&self, run_id: &str) -> Result<Option<String>, Error> {
    Ok(self.lock().quarantined.get(run_id).cloned())
  }

  async fn archive(&self, run_id: &str) -> Result<(), Error> {
    let mut state = self.lock();
    let history = state
      .runs
      .remove(run_id)
      .ok_or_else(|| Error::NotFound(run_id.to_string()))?;
    info!(run_id, events = history.len(), "run_archived");
    state.archived.insert(run_id.to_string(), history);
    Ok(())
  }

  async fn read_archived(&self, run_id: &str) -> Result<Vec<EventRecord>, Error> {
    self
      .lock()
      .archived
      .get(run_id)
      .cloned()
      .ok_or_else(|| Error::NotFound(run_id.to_string()))
  }
}
