//! Client side of the orchestrator: submit runs, wait on results, cancel.

use std::sync::Arc;
use std::time::Duration;

use legend_queue::{EnqueueOptions, TaskQueue, WorkItem};
use legend_store::Store;
use legend_workflow::{
  EventRecord, HistoryEvent, RunStatus, WorkflowDefinition, WorkflowFailure, WorkflowState,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::enqueue;
use crate::error::ClientError;
use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};

/// Result status as seen by a caller waiting on a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
  Completed,
  Failed,
  /// Still running when the wait ran out.
  Pending,
}

/// A run's result, or its progress when it has not finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
  pub run_id: String,
  pub status: ResultStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub output: Option<serde_json::Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<WorkflowFailure>,
}

impl RunResult {
  fn from_state(state: &WorkflowState) -> Self {
    let status = match state.status() {
      RunStatus::Completed => ResultStatus::Completed,
      RunStatus::Failed => ResultStatus::Failed,
      RunStatus::Created | RunStatus::Running => ResultStatus::Pending,
    };
    Self {
      run_id: state.run_id().to_string(),
      status,
      output: state.output().cloned(),
      error: state.failure().cloned(),
    }
  }

  fn failed(run_id: &str, failure: WorkflowFailure) -> Self {
    Self {
      run_id: run_id.to_string(),
      status: ResultStatus::Failed,
      output: None,
      error: Some(failure),
    }
  }

  pub fn is_finished(&self) -> bool {
    self.status != ResultStatus::Pending
  }
}

/// Submits and inspects runs. Cheap to clone.
#[derive(Clone)]
pub struct OrchestratorClient {
  store: Arc<dyn Store>,
  queue: Arc<dyn TaskQueue>,
  definition: Arc<WorkflowDefinition>,
  notifier: Arc<dyn ExecutionNotifier>,
  poll_interval: Duration,
}

impl OrchestratorClient {
  pub fn new(
    store: Arc<dyn Store>,
    queue: Arc<dyn TaskQueue>,
    definition: Arc<WorkflowDefinition>,
    poll_interval: Duration,
  ) -> Self {
    Self {
      store,
      queue,
      definition,
      notifier: Arc::new(NoopNotifier),
      poll_interval,
    }
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  /// Start a run for `scene_id` under a fresh run id.
  #[instrument(name = "submit", skip(self))]
  pub async fn submit(&self, scene_id: &str) -> Result<WorkflowHandle, ClientError> {
    if scene_id.trim().is_empty() {
      return Err(ClientError::InvalidSceneId);
    }

    let run_id = uuid::Uuid::new_v4().to_string();
    let record = self
      .store
      .append(
        &run_id,
        0,
        HistoryEvent::WorkflowStarted {
          workflow_type: self.definition.workflow_type.clone(),
          input: json!(scene_id),
        },
      )
      .await?;
    enqueue(
      self.queue.as_ref(),
      WorkItem::advance(&run_id, record.sequence),
      EnqueueOptions::new(),
    )
    .await?;

    info!(run_id = %run_id, queue = self.queue.name(), "workflow_submitted");
    self.notifier.notify(ExecutionEvent::RunSubmitted {
      run_id: run_id.clone(),
      scene_id: scene_id.to_string(),
    });

    Ok(self.handle(run_id))
  }

  /// A handle to an existing run.
  pub fn handle(&self, run_id: impl Into<String>) -> WorkflowHandle {
    WorkflowHandle {
      client: self.clone(),
      run_id: run_id.into(),
    }
  }

  /// Wait up to `wait` for the run to finish.
  ///
  /// Returns a [`ResultStatus::Pending`] result when it is still going at the
  /// deadline; the run itself is unaffected.
  pub async fn get_result(&self, run_id: &str, wait: Duration) -> Result<RunResult, ClientError> {
    let deadline = Instant::now() + wait;
    loop {
      let result = self.peek(run_id).await?;
      let now = Instant::now();
      if result.is_finished() || now >= deadline {
        return Ok(result);
      }
      tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
    }
  }

  async fn peek(&self, run_id: &str) -> Result<RunResult, ClientError> {
    if let Some(reason) = self.store.quarantine_reason(run_id).await? {
      return Ok(RunResult::failed(
        run_id,
        WorkflowFailure::HistoryCorruption { message: reason },
      ));
    }

    let history = match self.read_any(run_id).await {
      Ok(history) => history,
      Err(e @ legend_store::Error::Corrupt { .. }) => {
        return Ok(RunResult::failed(
          run_id,
          WorkflowFailure::HistoryCorruption {
            message: e.to_string(),
          },
        ));
      }
      Err(e) => return Err(e.into()),
    };
    match WorkflowState::replay(run_id, &history) {
      Ok(state) => Ok(RunResult::from_state(&state)),
      Err(e) => Ok(RunResult::failed(run_id, e.to_failure())),
    }
  }

  /// Request cancellation.
  ///
  /// A step that is already executing finishes; the run fails with
  /// [`WorkflowFailure::Cancelled`] instead of scheduling more work. A
  /// finished run is left alone.
  #[instrument(name = "cancel", skip(self))]
  pub async fn cancel(&self, run_id: &str) -> Result<(), ClientError> {
    loop {
      let history = match self.store.read_history(run_id).await {
        Ok(history) => history,
        Err(e @ legend_store::Error::Corrupt { .. }) => {
          warn!(error = %e, "cancel_unreadable");
          return Ok(());
        }
        Err(e) => return Err(e.into()),
      };
      let state = match WorkflowState::replay(run_id, &history) {
        Ok(state) => state,
        Err(e) => {
          warn!(error = %e, "cancel_unreplayable");
          return Ok(());
        }
      };
      if state.status().is_terminal() || state.cancel_requested() {
        return Ok(());
      }

      match self
        .store
        .append(run_id, state.last_sequence(), HistoryEvent::CancelRequested)
        .await
      {
        Ok(record) => {
          enqueue(
            self.queue.as_ref(),
            WorkItem::advance(run_id, record.sequence),
            EnqueueOptions::new(),
          )
          .await?;
          info!("cancel_requested");
          self.notifier.notify(ExecutionEvent::CancelRequested {
            run_id: run_id.to_string(),
          });
          return Ok(());
        }
        Err(e) if e.is_conflict() => continue,
        Err(e) => return Err(e.into()),
      }
    }
  }

  /// The run's history, from the active store or the archive.
  pub async fn history(&self, run_id: &str) -> Result<Vec<EventRecord>, ClientError> {
    Ok(self.read_any(run_id).await?)
  }

  async fn read_any(&self, run_id: &str) -> Result<Vec<EventRecord>, legend_store::Error> {
    match self.store.read_history(run_id).await {
      Err(legend_store::Error::NotFound(_)) => self.store.read_archived(run_id).await,
      other => other,
    }
  }
}

/// Handle to one run.
#[derive(Clone)]
pub struct WorkflowHandle {
  client: OrchestratorClient,
  run_id: String,
}

impl WorkflowHandle {
  pub fn run_id(&self) -> &str {
    &self.run_id
  }

  pub async fn result(&self, wait: Duration) -> Result<RunResult, ClientError> {
    self.client.get_result(&self.run_id, wait).await
  }

  pub async fn cancel(&self) -> Result<(), ClientError> {
    self.client.cancel(&self.run_id).await
  }

  pub async fn history(&self) -> Result<Vec<EventRecord>, ClientError> {
    self.client.history(&self.run_id).await
  }
}
