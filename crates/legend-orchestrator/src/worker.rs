//! Queue worker.
//!
//! A worker claims one item at a time and handles it against the run's
//! recorded history:
//!
//! ```text
//!   claim ──▶ advance ──▶ replay ──▶ decide ──▶ append ──▶ enqueue activity
//!     │
//!     └────▶ activity ─▶ replay ──▶ execute ──▶ append outcome
//!                                                  │
//!                            ┌─────────────────────┼──────────────────┐
//!                       completed              retryable            give up
//!                     enqueue advance    enqueue attempt + 1    append StepFailed
//!                                          after backoff         enqueue advance
//! ```
//!
//! Every write is an append at the sequence the worker replayed, so two
//! workers racing on the same run cannot both commit. The loser requeues its
//! item and re-reads the history on redelivery. Items are acked only after
//! their effects are durable; a crash between the two leaves an item that is
//! redelivered and recognised as already handled.

use std::sync::Arc;
use std::time::Duration;

use legend_activity::ActivityExecutor;
use legend_config::EngineConfig;
use legend_queue::{EnqueueOptions, Lease, QueueError, TaskQueue, WorkItem, WorkKind};
use legend_store::Store;
use legend_workflow::{
  ActivityInvocation, ActivityOutcome, Decision, EventRecord, FollowUp,
  HistoryEvent, ReplayError, RetryPolicy, StepName, WorkflowDefinition, WorkflowState,
  verify_history,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::enqueue;
use crate::error::OrchestratorError;
use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};

/// What happened to a claimed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
  /// Nothing was claimable.
  Idle,
  /// Handled and acked.
  Completed,
  /// Lost an append race; the item goes back on the queue.
  Requeued,
  /// The lease ran out before the ack. The item will be redelivered.
  LeaseLost,
}

/// Pulls work items and advances runs.
pub struct Worker {
  id: String,
  store: Arc<dyn Store>,
  queue: Arc<dyn TaskQueue>,
  executor: Arc<ActivityExecutor>,
  definition: Arc<WorkflowDefinition>,
  notifier: Arc<dyn ExecutionNotifier>,
  lease: Duration,
  poll_interval: Duration,
  infra_retry: RetryPolicy,
}

impl Worker {
  pub fn new(
    id: impl Into<String>,
    config: &EngineConfig,
    store: Arc<dyn Store>,
    queue: Arc<dyn TaskQueue>,
    executor: Arc<ActivityExecutor>,
  ) -> Self {
    Self {
      id: id.into(),
      store,
      queue,
      executor,
      definition: Arc::new(WorkflowDefinition::from_config(config)),
      notifier: Arc::new(NoopNotifier),
      lease: config.lease(),
      poll_interval: config.poll_interval(),
      infra_retry: RetryPolicy::from(&config.infra_retry),
    }
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  /// Process items until `cancel` fires.
  ///
  /// An item being handled when cancellation arrives is finished first.
  /// Store and queue failures back off with the infrastructure retry policy
  /// and never stop the loop.
  pub async fn run(&self, cancel: CancellationToken) {
    info!(worker_id = %self.id, queue = self.queue.name(), "worker_started");
    let mut failures: u32 = 0;

    while !cancel.is_cancelled() {
      let pause = match self.process_next().await {
        Ok(ProcessOutcome::Idle) => {
          failures = 0;
          self.poll_interval
        }
        Ok(_) => {
          failures = 0;
          continue;
        }
        Err(e) => {
          failures = failures.saturating_add(1);
          let delay = self.infra_retry.backoff_delay(failures);
          error!(
            worker_id = %self.id,
            error = %e,
            failures,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "worker_error"
          );
          delay
        }
      };

      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = tokio::time::sleep(pause) => {}
      }
    }

    info!(worker_id = %self.id, "worker_stopped");
  }

  /// Claim and handle at most one item.
  pub async fn process_next(&self) -> Result<ProcessOutcome, OrchestratorError> {
    let Some(lease) = self.queue.claim(&self.id, self.lease).await? else {
      return Ok(ProcessOutcome::Idle);
    };

    match self.handle(&lease).await {
      Ok(()) => match self.queue.ack(&lease.token).await {
        Ok(()) => Ok(ProcessOutcome::Completed),
        Err(QueueError::LeaseNotFound { .. }) => {
          warn!(item_id = %lease.item.item_id, run_id = %lease.item.run_id, "lease_lost");
          Ok(ProcessOutcome::LeaseLost)
        }
        Err(e) => Err(e.into()),
      },
      Err(e) if e.is_conflict() => {
        debug!(item_id = %lease.item.item_id, run_id = %lease.item.run_id, "append_conflict");
        self.release(&lease, Duration::ZERO).await;
        Ok(ProcessOutcome::Requeued)
      }
      Err(e) => {
        let delay = self
          .infra_retry
          .backoff_delay(lease.item.delivery_count.max(1));
        self.release(&lease, delay).await;
        Err(e)
      }
    }
  }

  async fn release(&self, lease: &Lease, delay: Duration) {
    if let Err(e) = self.queue.abandon(&lease.token, delay).await {
      warn!(item_id = %lease.item.item_id, error = %e, "abandon_failed");
    }
  }

  #[instrument(
    name = "work_item",
    skip(self, lease),
    fields(
      worker_id = %self.id,
      run_id = %lease.item.run_id,
      kind = ?lease.item.kind,
      delivery = lease.item.delivery_count,
    )
  )]
  async fn handle(&self, lease: &Lease) -> Result<(), OrchestratorError> {
    let item = &lease.item;
    let Some(state) = self.load(&item.run_id).await? else {
      return Ok(());
    };

    match item.kind {
      WorkKind::Advance => self.advance(item, state).await,
      WorkKind::Activity => self.run_activity(lease, state).await,
    }
  }

  /// Replay the run. `None` when there is nothing to act on: the run is
  /// quarantined, gone, or its history just failed to decode or replay.
  async fn load(&self, run_id: &str) -> Result<Option<WorkflowState>, OrchestratorError> {
    if let Some(reason) = self.store.quarantine_reason(run_id).await? {
      debug!(reason = %reason, "run_quarantined");
      return Ok(None);
    }

    let history = match self.store.read_history(run_id).await {
      Ok(history) => history,
      Err(legend_store::Error::NotFound(_)) => {
        warn!("run_not_found");
        return Ok(None);
      }
      Err(e @ legend_store::Error::Corrupt { .. }) => {
        self.quarantine(run_id, e.to_string()).await?;
        return Ok(None);
      }
      Err(e) => return Err(e.into()),
    };

    match verify_history(run_id, &history) {
      Ok(state) => Ok(Some(state)),
      Err(e) => {
        self.quarantine_replay(&e).await?;
        Ok(None)
      }
    }
  }

  async fn quarantine_replay(&self, err: &ReplayError) -> Result<(), OrchestratorError> {
    self.quarantine(err.run_id(), err.to_string()).await
  }

  async fn quarantine(&self, run_id: &str, reason: String) -> Result<(), OrchestratorError> {
    error!(run_id = %run_id, error = %reason, "history_corrupt");
    self.store.quarantine(run_id, &reason).await?;
    self.notifier.notify(ExecutionEvent::RunQuarantined {
      run_id: run_id.to_string(),
      reason,
    });
    Ok(())
  }

  async fn advance(&self, item: &WorkItem, state: WorkflowState) -> Result<(), OrchestratorError> {
    let after = item.payload["after_sequence"].as_u64().unwrap_or(0);
    if state.last_sequence() < after {
      warn!(
        after_sequence = after,
        last_sequence = state.last_sequence(),
        "advance_ahead_of_history"
      );
    }

    let decision = state.decide();
    debug!(decision = %decision, "decided");

    let run_id = state.run_id();
    match decision {
      Decision::AwaitActivity { step, attempt } => {
        let waiting_on_retry = state
          .step(step)
          .is_some_and(|record| record.last_failure().is_some());
        if state.cancel_requested() && waiting_on_retry {
          return self.follow_up(&state, step).await;
        }

        // The attempt's item may have been lost between the append that
        // scheduled it and its enqueue. Re-enqueuing is deduplicated.
        let input = state
          .step(step)
          .map(|record| record.input.clone())
          .unwrap_or_default();
        let options = self.attempt_options(&state, step, attempt);
        enqueue(
          self.queue.as_ref(),
          WorkItem::activity(run_id, step, attempt, input),
          options,
        )
        .await
      }
      Decision::Terminal => {
        debug!("run_terminal");
        Ok(())
      }
      decision => {
        let Some(event) = decision.event(&self.definition) else {
          return Ok(());
        };
        self
          .store
          .append(run_id, state.last_sequence(), event)
          .await?;
        self.committed(run_id, decision).await
      }
    }
  }

  /// Carry out the side effects of a committed decision.
  async fn committed(&self, run_id: &str, decision: Decision) -> Result<(), OrchestratorError> {
    match decision {
      Decision::Schedule { step, input } => {
        enqueue(
          self.queue.as_ref(),
          WorkItem::activity(run_id, step, 1, input),
          EnqueueOptions::new(),
        )
        .await?;
        info!(%step, "step_scheduled");
        self.notifier.notify(ExecutionEvent::StepScheduled {
          run_id: run_id.to_string(),
          step,
        });
      }
      Decision::Complete { .. } => {
        info!("workflow_completed");
        self.notifier.notify(ExecutionEvent::RunCompleted {
          run_id: run_id.to_string(),
        });
      }
      Decision::Fail { failure } => {
        warn!(reason = %failure, "workflow_failed");
        self.notifier.notify(ExecutionEvent::RunFailed {
          run_id: run_id.to_string(),
          error: failure.to_string(),
        });
      }
      Decision::AwaitActivity { .. } | Decision::Terminal => {}
    }
    Ok(())
  }

  /// Delay for re-enqueuing `attempt`: the backoff it was first queued with.
  fn attempt_options(&self, state: &WorkflowState, step: StepName, attempt: u32) -> EnqueueOptions {
    match state.retry_follow_up(&self.definition.step(step).retry) {
      Some(FollowUp::Retry {
        attempt: next,
        delay,
        ..
      }) if next == attempt => EnqueueOptions::new().with_delay(delay),
      _ => EnqueueOptions::new(),
    }
  }

  async fn run_activity(&self, lease: &Lease, state: WorkflowState) -> Result<(), OrchestratorError> {
    let item = &lease.item;
    let run_id = state.run_id().to_string();
    let step = item.step.ok_or_else(|| OrchestratorError::InvalidWorkItem {
      item_id: item.item_id.clone(),
      message: "activity item without a step".to_string(),
    })?;

    let Some(current) = state.in_flight().filter(|record| record.step == step) else {
      // Already resolved. Make sure the run was advanced past it.
      info!(%step, attempt = item.attempt, "activity_suppressed");
      return self.ensure_advance(&state).await;
    };

    let expected = current.next_attempt();
    if item.attempt < expected {
      info!(%step, attempt = item.attempt, expected, "attempt_already_recorded");
      return self.follow_up(&state, step).await;
    }
    if item.attempt > expected {
      warn!(%step, attempt = item.attempt, expected, "attempt_out_of_order");
      return Ok(());
    }
    if state.cancel_requested() && current.last_failure().is_some() {
      info!(%step, attempt = item.attempt, "retry_cancelled");
      return self.follow_up(&state, step).await;
    }

    let mut invocation = ActivityInvocation::new(
      &run_id,
      step,
      item.attempt,
      current.input.clone(),
      Duration::from_millis(current.timeout_ms),
    );
    debug!(key = %invocation.key(), "attempt_started");
    self.notifier.notify(ExecutionEvent::AttemptStarted {
      run_id: run_id.clone(),
      step,
      attempt: item.attempt,
    });

    let outcome = self.execute(&lease.token, &invocation).await;
    let event = match (&outcome, outcome.failure_kind()) {
      (ActivityOutcome::Succeeded { output }, _) => HistoryEvent::StepCompleted {
        step,
        attempt: item.attempt,
        output: output.clone(),
      },
      (
        ActivityOutcome::FailedRetryable { cause } | ActivityOutcome::FailedFatal { cause },
        Some(kind),
      ) => HistoryEvent::AttemptFailed {
        step,
        attempt: item.attempt,
        error: cause.clone(),
        kind,
      },
      _ => {
        return Err(OrchestratorError::InvalidWorkItem {
          item_id: item.item_id.clone(),
          message: "activity returned without an outcome".to_string(),
        });
      }
    };
    invocation
      .record(outcome)
      .map_err(|_| OrchestratorError::InvalidWorkItem {
        item_id: item.item_id.clone(),
        message: "outcome recorded twice".to_string(),
      })?;

    let Some((state, record)) = self.append_outcome(state, step, item.attempt, event).await? else {
      return Ok(());
    };

    match &record.event {
      HistoryEvent::StepCompleted { .. } => {
        enqueue(
          self.queue.as_ref(),
          WorkItem::advance(&run_id, record.sequence),
          EnqueueOptions::new(),
        )
        .await?;
        self
          .notifier
          .notify(ExecutionEvent::StepCompleted { run_id, step });
        Ok(())
      }
      HistoryEvent::AttemptFailed { error, .. } => {
        self.notifier.notify(ExecutionEvent::AttemptFailed {
          run_id,
          step,
          attempt: item.attempt,
          error: error.to_string(),
        });
        self.follow_up(&state, step).await
      }
      _ => Ok(()),
    }
  }

  /// Run the attempt while keeping the item's lease alive.
  async fn execute(&self, token: &str, invocation: &ActivityInvocation) -> ActivityOutcome {
    let execution = self.executor.execute(invocation);
    tokio::pin!(execution);

    let keep_alive = async {
      let mut ticker = tokio::time::interval((self.lease / 2).max(Duration::from_millis(1)));
      ticker.tick().await;
      loop {
        ticker.tick().await;
        if let Err(e) = self.queue.renew(token, self.lease).await {
          warn!(error = %e, "lease_renew_failed");
          return;
        }
      }
    };

    tokio::select! {
      outcome = &mut execution => return outcome,
      _ = keep_alive => {}
    }
    execution.await
  }

  /// Append an attempt's outcome. A concurrent append (a cancel request,
  /// usually) is rebased over as long as the attempt is still the one the run
  /// is waiting for.
  async fn append_outcome(
    &self,
    mut state: WorkflowState,
    step: StepName,
    attempt: u32,
    event: HistoryEvent,
  ) -> Result<Option<(WorkflowState, EventRecord)>, OrchestratorError> {
    let run_id = state.run_id().to_string();
    loop {
      match self
        .store
        .append(&run_id, state.last_sequence(), event.clone())
        .await
      {
        Ok(record) => {
          if let Err(e) = state.apply(&record) {
            self.quarantine_replay(&e).await?;
            return Ok(None);
          }
          return Ok(Some((state, record)));
        }
        Err(e) if e.is_conflict() => {
          let Some(latest) = self.load(&run_id).await? else {
            return Ok(None);
          };
          let still_waiting = latest
            .in_flight()
            .is_some_and(|record| record.step == step && record.next_attempt() == attempt);
          if !still_waiting {
            info!(%step, attempt, "outcome_superseded");
            return Ok(None);
          }
          debug!(%step, attempt, "outcome_rebased");
          state = latest;
        }
        Err(e) => return Err(e.into()),
      }
    }
  }

  /// Retry or give up on the in-flight step's latest failure.
  async fn follow_up(&self, state: &WorkflowState, step: StepName) -> Result<(), OrchestratorError> {
    let run_id = state.run_id();
    let policy = &self.definition.step(step).retry;

    match state.retry_follow_up(policy) {
      None => Ok(()),
      Some(FollowUp::Retry {
        step,
        attempt,
        delay,
      }) => {
        let input = state
          .step(step)
          .map(|record| record.input.clone())
          .unwrap_or_default();
        enqueue(
          self.queue.as_ref(),
          WorkItem::activity(run_id, step, attempt, input),
          EnqueueOptions::new().with_delay(delay),
        )
        .await?;
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        info!(%step, attempt, delay_ms, "retry_scheduled");
        self.notifier.notify(ExecutionEvent::RetryScheduled {
          run_id: run_id.to_string(),
          step,
          attempt,
          delay_ms,
        });
        Ok(())
      }
      Some(give_up @ FollowUp::GiveUp { .. }) => {
        let Some(event) = give_up.event() else {
          return Ok(());
        };
        let record = self
          .store
          .append(run_id, state.last_sequence(), event)
          .await?;
        if let FollowUp::GiveUp { failure, .. } = &give_up {
          warn!(%step, reason = %failure, "step_failed");
          self.notifier.notify(ExecutionEvent::StepFailed {
            run_id: run_id.to_string(),
            step,
            error: failure.to_string(),
          });
        }
        enqueue(
          self.queue.as_ref(),
          WorkItem::advance(run_id, record.sequence),
          EnqueueOptions::new(),
        )
        .await
      }
    }
  }

  async fn ensure_advance(&self, state: &WorkflowState) -> Result<(), OrchestratorError> {
    if state.status().is_terminal() {
      return Ok(());
    }
    enqueue(
      self.queue.as_ref(),
      WorkItem::advance(state.run_id(), state.last_sequence()),
      EnqueueOptions::new(),
    )
    .await
  }
}
