use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use legend_activity::ActivityExecutor;
use legend_config::EngineConfig;
use legend_queue::{EnqueueOptions, InMemoryTaskQueue, TaskQueue, WorkItem};
use legend_store::Store;
use legend_workflow::{WorkflowDefinition, WorkflowState};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::OrchestratorClient;
use crate::enqueue;
use crate::error::OrchestratorError;
use crate::events::{ExecutionNotifier, NoopNotifier};
use crate::worker::Worker;

/// Wires the store, queue and executor together for one engine.
pub struct Orchestrator {
  config: EngineConfig,
  store: Arc<dyn Store>,
  queue: Arc<dyn TaskQueue>,
  executor: Arc<ActivityExecutor>,
  definition: Arc<WorkflowDefinition>,
  notifier: Arc<dyn ExecutionNotifier>,
}

impl Orchestrator {
  pub fn new(
    config: EngineConfig,
    store: Arc<dyn Store>,
    queue: Arc<dyn TaskQueue>,
    executor: ActivityExecutor,
  ) -> Self {
    Self {
      definition: Arc::new(WorkflowDefinition::from_config(&config)),
      config,
      store,
      queue,
      executor: Arc::new(executor),
      notifier: Arc::new(NoopNotifier),
    }
  }

  /// Build everything from configuration: the configured store, an
  /// in-process queue and the built-in collaborators.
  pub async fn from_config(config: EngineConfig) -> Result<Self, OrchestratorError> {
    let store = legend_store::connect(&config.store).await?;
    let queue = Arc::new(InMemoryTaskQueue::new(config.task_queue.clone()));
    let executor = ActivityExecutor::from_config(&config)?;
    Ok(Self::new(config, store, queue, executor))
  }

  pub fn with_notifier(mut self, notifier: impl ExecutionNotifier + 'static) -> Self {
    self.notifier = Arc::new(notifier);
    self
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  pub fn client(&self) -> OrchestratorClient {
    OrchestratorClient::new(
      self.store.clone(),
      self.queue.clone(),
      self.definition.clone(),
      self.config.poll_interval(),
    )
    .with_notifier(self.notifier.clone())
  }

  pub fn worker(&self, id: impl Into<String>) -> Worker {
    Worker::new(
      id,
      &self.config,
      self.store.clone(),
      self.queue.clone(),
      self.executor.clone(),
    )
    .with_notifier(self.notifier.clone())
  }

  /// Run the configured number of workers until `cancel` fires.
  ///
  /// Unfinished runs found in the store are re-enqueued first.
  pub async fn run(&self, cancel: CancellationToken) {
    if let Err(e) = self.recover().await {
      error!(error = %e, "recovery_failed");
    }

    let workers: Vec<Worker> = (0..self.config.workers)
      .map(|i| self.worker(format!("worker-{i}")))
      .collect();
    info!(
      workers = workers.len(),
      queue = self.queue.name(),
      "orchestrator_started"
    );

    join_all(workers.iter().map(|worker| worker.run(cancel.clone()))).await;

    info!("orchestrator_stopped");
  }

  /// Enqueue an advance for every run whose history does not end in a
  /// terminal event.
  ///
  /// Queued items do not survive a restart; history does. Runs that cannot
  /// be read are enqueued too and the worker quarantines them. Returns how
  /// many runs were enqueued.
  pub async fn recover(&self) -> Result<usize, OrchestratorError> {
    let mut recovered = 0;

    for summary in self.store.list_runs().await? {
      let run_id = summary.run_id.as_str();
      if self.store.quarantine_reason(run_id).await?.is_some() {
        continue;
      }
      match self.store.read_history(run_id).await {
        Ok(history) => {
          if history.last().is_some_and(|record| record.event.is_terminal()) {
            continue;
          }
        }
        Err(legend_store::Error::NotFound(_)) => continue,
        Err(e @ legend_store::Error::Corrupt { .. }) => {
          warn!(run_id = %run_id, error = %e, "recovering_unreadable_run");
        }
        Err(e) => return Err(e.into()),
      }

      enqueue(
        self.queue.as_ref(),
        WorkItem::advance(run_id, summary.last_sequence),
        EnqueueOptions::new(),
      )
      .await?;
      debug!(run_id = %run_id, last_sequence = summary.last_sequence, "run_recovered");
      recovered += 1;
    }

    if recovered > 0 {
      info!(recovered, "runs_recovered");
    }
    Ok(recovered)
  }

  /// Archive terminal runs that finished longer ago than the retention
  /// period. Returns how many were archived; zero when retention is off.
  pub async fn sweep_retention(&self) -> Result<usize, OrchestratorError> {
    let Some(retention) = self.config.retention() else {
      return Ok(0);
    };
    let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
    let now = Utc::now();
    let mut archived = 0;

    for summary in self.store.list_runs().await? {
      let history = match self.store.read_history(&summary.run_id).await {
        Ok(history) => history,
        Err(e @ legend_store::Error::Corrupt { .. }) => {
          warn!(run_id = %summary.run_id, error = %e, "retention_skip_unreadable");
          continue;
        }
        Err(e) => return Err(e.into()),
      };
      let state = match WorkflowState::replay(&summary.run_id, &history) {
        Ok(state) => state,
        Err(e) => {
          warn!(run_id = %summary.run_id, error = %e, "retention_skip_unreplayable");
          continue;
        }
      };
      let Some(finished_at) = state.finished_at() else {
        continue;
      };
      if now - finished_at >= retention {
        self.store.archive(&summary.run_id).await?;
        archived += 1;
      }
    }

    if archived > 0 {
      info!(archived, "retention_sweep");
    }
    Ok(archived)
  }
}
