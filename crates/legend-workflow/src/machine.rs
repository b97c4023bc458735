//! Workflow state machine.
//!
//! ```text
//!   Created ──► Running(analyze) ──► Running(transform) ──► Completed
//!                     │                      │
//!                     └──────────┬───────────┘
//!                                ▼
//!                             Failed
//! ```
//!
//! [`WorkflowState`] is rebuilt from a run's history by folding
//! [`WorkflowState::apply`] over its records. [`WorkflowState::decide`] then
//! says what the run needs next. Neither reads a clock or touches storage.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::activity::{ActivityError, FailureKind};
use crate::definition::WorkflowDefinition;
use crate::error::ReplayError;
use crate::event::{EventRecord, HistoryEvent};
use crate::retry::RetryPolicy;
use crate::step::StepName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
  Created,
  Running,
  Completed,
  Failed,
}

impl RunStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, RunStatus::Completed | RunStatus::Failed)
  }
}

impl fmt::Display for RunStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      RunStatus::Created => "created",
      RunStatus::Running => "running",
      RunStatus::Completed => "completed",
      RunStatus::Failed => "failed",
    };
    f.write_str(name)
  }
}

/// Why a run ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum WorkflowFailure {
  #[error("step '{step}' failed: {error}")]
  ActivityFatal { step: StepName, error: ActivityError },

  #[error("step '{step}' gave up after {attempts} attempt(s): {last_error}")]
  RetryBudgetExhausted {
    step: StepName,
    attempts: u32,
    last_error: ActivityError,
  },

  #[error("run was cancelled")]
  Cancelled,

  #[error("history is corrupt: {message}")]
  HistoryCorruption { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepProgress {
  InFlight,
  Completed {
    attempt: u32,
    output: serde_json::Value,
  },
  Failed {
    attempt: u32,
    failure: WorkflowFailure,
  },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
  pub attempt: u32,
  pub error: ActivityError,
  pub kind: FailureKind,
  pub failed_at: DateTime<Utc>,
}

/// A scheduled step and everything recorded about it since.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
  pub step: StepName,
  pub input: serde_json::Value,
  pub timeout_ms: u64,
  pub scheduled_at: DateTime<Utc>,
  pub failed_attempts: Vec<AttemptRecord>,
  pub progress: StepProgress,
}

impl StepRecord {
  pub fn is_in_flight(&self) -> bool {
    matches!(self.progress, StepProgress::InFlight)
  }

  /// The attempt number that would run next.
  pub fn next_attempt(&self) -> u32 {
    self.failed_attempts.last().map_or(1, |a| a.attempt + 1)
  }

  pub fn last_failure(&self) -> Option<&AttemptRecord> {
    self.failed_attempts.last()
  }

  pub fn output(&self) -> Option<&serde_json::Value> {
    match &self.progress {
      StepProgress::Completed { output, .. } => Some(output),
      _ => None,
    }
  }
}

/// What a run needs next.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
  /// Schedule `step` with `input`.
  Schedule {
    step: StepName,
    input: serde_json::Value,
  },
  /// A step is in flight; wait for attempt `attempt` to report.
  AwaitActivity { step: StepName, attempt: u32 },
  Complete { output: serde_json::Value },
  Fail { failure: WorkflowFailure },
  /// The run already finished.
  Terminal,
}

impl Decision {
  /// The history event that commits this decision, if it has one.
  pub fn event(&self, definition: &WorkflowDefinition) -> Option<HistoryEvent> {
    match self {
      Decision::Schedule { step, input } => Some(HistoryEvent::StepScheduled {
        step: *step,
        input: input.clone(),
        timeout_ms: definition.step(*step).timeout_ms(),
      }),
      Decision::Complete { output } => Some(HistoryEvent::WorkflowCompleted {
        output: output.clone(),
      }),
      Decision::Fail { failure } => Some(HistoryEvent::WorkflowFailed {
        failure: failure.clone(),
      }),
      Decision::AwaitActivity { .. } | Decision::Terminal => None,
    }
  }

  /// Whether `event` commits this decision.
  ///
  /// Timeouts are configuration, so a redeployed timeout does not break the
  /// replay of a scheduled step.
  pub fn produces(&self, event: &HistoryEvent) -> bool {
    match (self, event) {
      (
        Decision::Schedule { step, input },
        HistoryEvent::StepScheduled {
          step: recorded_step,
          input: recorded_input,
          ..
        },
      ) => step == recorded_step && input == recorded_input,
      (Decision::Complete { output }, HistoryEvent::WorkflowCompleted { output: recorded }) => {
        output == recorded
      }
      (Decision::Fail { failure }, HistoryEvent::WorkflowFailed { failure: recorded }) => {
        failure == recorded
      }
      _ => false,
    }
  }
}

impl fmt::Display for Decision {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Decision::Schedule { step, .. } => write!(f, "schedule({step})"),
      Decision::AwaitActivity { step, attempt } => write!(f, "await({step}#{attempt})"),
      Decision::Complete { .. } => f.write_str("complete"),
      Decision::Fail { failure } => write!(f, "fail({failure})"),
      Decision::Terminal => f.write_str("terminal"),
    }
  }
}

/// What happens to a step after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FollowUp {
  Retry {
    step: StepName,
    attempt: u32,
    delay: Duration,
  },
  GiveUp {
    step: StepName,
    attempt: u32,
    failure: WorkflowFailure,
  },
}

impl FollowUp {
  /// The history event that commits this follow-up, if it has one.
  pub fn event(&self) -> Option<HistoryEvent> {
    match self {
      FollowUp::Retry { .. } => None,
      FollowUp::GiveUp {
        step,
        attempt,
        failure,
      } => Some(HistoryEvent::StepFailed {
        step: *step,
        attempt: *attempt,
        failure: failure.clone(),
      }),
    }
  }
}

/// A run, as rebuilt from its history.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowState {
  run_id: String,
  workflow_type: String,
  input: serde_json::Value,
  status: RunStatus,
  steps: Vec<StepRecord>,
  cancel_requested: bool,
  output: Option<serde_json::Value>,
  failure: Option<WorkflowFailure>,
  last_sequence: u64,
  started_at: DateTime<Utc>,
  finished_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
  /// Start from the first record of a history, which must be
  /// `WorkflowStarted` at sequence 1.
  pub fn start(run_id: &str, record: &EventRecord) -> Result<Self, ReplayError> {
    if record.run_id != run_id {
      return Err(ReplayError::ForeignRecord {
        run_id: run_id.to_string(),
        found: record.run_id.clone(),
      });
    }
    if record.sequence != 1 {
      return Err(ReplayError::SequenceGap {
        run_id: run_id.to_string(),
        expected: 1,
        found: record.sequence,
      });
    }

    let HistoryEvent::WorkflowStarted {
      workflow_type,
      input,
    } = &record.event
    else {
      return Err(ReplayError::UnexpectedEvent {
        run_id: run_id.to_string(),
        sequence: record.sequence,
        event: record.event.name(),
        message: "history must begin with workflow_started".to_string(),
      });
    };

    Ok(Self {
      run_id: run_id.to_string(),
      workflow_type: workflow_type.clone(),
      input: input.clone(),
      status: RunStatus::Created,
      steps: Vec::new(),
      cancel_requested: false,
      output: None,
      failure: None,
      last_sequence: record.sequence,
      started_at: record.recorded_at,
      finished_at: None,
    })
  }

  /// Rebuild a run from its records without checking decisions.
  pub fn replay(run_id: &str, records: &[EventRecord]) -> Result<Self, ReplayError> {
    let (first, rest) = records.split_first().ok_or_else(|| ReplayError::Empty {
      run_id: run_id.to_string(),
    })?;

    let mut state = Self::start(run_id, first)?;
    for record in rest {
      state.apply(record)?;
    }
    Ok(state)
  }

  /// Fold one record into the state.
  ///
  /// Rejects records out of sequence, records of another run, and events
  /// that cannot follow the current state.
  pub fn apply(&mut self, record: &EventRecord) -> Result<(), ReplayError> {
    self.check_position(record)?;

    if self.status.is_terminal() {
      return Err(self.unexpected(record, "run already finished"));
    }

    match &record.event {
      HistoryEvent::WorkflowStarted { .. } => {
        return Err(self.unexpected(record, "run already started"));
      }
      HistoryEvent::StepScheduled {
        step,
        input,
        timeout_ms,
      } => {
        if let Some(current) = self.in_flight() {
          let message = format!("step '{}' still in flight", current.step);
          return Err(self.unexpected(record, &message));
        }
        if self.next_schedulable() != Some(*step) {
          let message = format!("step '{step}' is out of order");
          return Err(self.unexpected(record, &message));
        }
        self.steps.push(StepRecord {
          step: *step,
          input: input.clone(),
          timeout_ms: *timeout_ms,
          scheduled_at: record.recorded_at,
          failed_attempts: Vec::new(),
          progress: StepProgress::InFlight,
        });
        self.status = RunStatus::Running;
      }
      HistoryEvent::AttemptFailed {
        step,
        attempt,
        error,
        kind,
      } => {
        let current = self.reporting_step(record, *step, *attempt)?;
        current.failed_attempts.push(AttemptRecord {
          attempt: *attempt,
          error: error.clone(),
          kind: *kind,
          failed_at: record.recorded_at,
        });
      }
      HistoryEvent::StepCompleted {
        step,
        attempt,
        output,
      } => {
        let current = self.reporting_step(record, *step, *attempt)?;
        current.progress = StepProgress::Completed {
          attempt: *attempt,
          output: output.clone(),
        };
      }
      HistoryEvent::StepFailed {
        step,
        attempt,
        failure,
      } => {
        let last_failed = self
          .in_flight()
          .filter(|current| current.step == *step)
          .and_then(StepRecord::last_failure)
          .map(|a| a.attempt);
        if last_failed != Some(*attempt) {
          let message = format!("step '{step}' attempt {attempt} has no recorded failure");
          return Err(self.unexpected(record, &message));
        }
        if let Some(current) = self.steps.last_mut() {
          current.progress = StepProgress::Failed {
            attempt: *attempt,
            failure: failure.clone(),
          };
        }
      }
      HistoryEvent::CancelRequested => {
        self.cancel_requested = true;
      }
      HistoryEvent::WorkflowCompleted { output } => {
        self.status = RunStatus::Completed;
        self.output = Some(output.clone());
        self.finished_at = Some(record.recorded_at);
      }
      HistoryEvent::WorkflowFailed { failure } => {
        self.status = RunStatus::Failed;
        self.failure = Some(failure.clone());
        self.finished_at = Some(record.recorded_at);
      }
    }

    self.last_sequence = record.sequence;
    Ok(())
  }

  /// Decide what the run needs next.
  pub fn decide(&self) -> Decision {
    if self.status.is_terminal() {
      return Decision::Terminal;
    }

    let Some(last) = self.steps.last() else {
      if self.cancel_requested {
        return Decision::Fail {
          failure: WorkflowFailure::Cancelled,
        };
      }
      return Decision::Schedule {
        step: StepName::first(),
        input: self.input.clone(),
      };
    };

    match &last.progress {
      StepProgress::InFlight => Decision::AwaitActivity {
        step: last.step,
        attempt: last.next_attempt(),
      },
      StepProgress::Failed { failure, .. } => Decision::Fail {
        failure: failure.clone(),
      },
      StepProgress::Completed { output, .. } => match last.step.next() {
        None => Decision::Complete {
          output: output.clone(),
        },
        Some(_) if self.cancel_requested => Decision::Fail {
          failure: WorkflowFailure::Cancelled,
        },
        Some(next) => Decision::Schedule {
          step: next,
          input: output.clone(),
        },
      },
    }
  }

  /// What follows the latest failed attempt of the in-flight step.
  ///
  /// `None` when no step is in flight or its current attempt has not failed.
  /// Elapsed time runs from the step's `StepScheduled` record to the
  /// failure's record, so the answer never changes for the same history.
  pub fn retry_follow_up(&self, policy: &RetryPolicy) -> Option<FollowUp> {
    let current = self.in_flight()?;
    let last = current.last_failure()?;
    let step = current.step;

    let give_up = |failure| FollowUp::GiveUp {
      step,
      attempt: last.attempt,
      failure,
    };

    if policy.classify(&last.error, last.kind) == FailureKind::Fatal {
      return Some(give_up(WorkflowFailure::ActivityFatal {
        step,
        error: last.error.clone(),
      }));
    }
    if self.cancel_requested {
      return Some(give_up(WorkflowFailure::Cancelled));
    }

    let elapsed = (last.failed_at - current.scheduled_at)
      .to_std()
      .unwrap_or(Duration::ZERO);
    let decision = policy.decide(last.attempt, elapsed, FailureKind::Retryable);
    if decision.retry {
      Some(FollowUp::Retry {
        step,
        attempt: last.attempt + 1,
        delay: decision.backoff_delay,
      })
    } else {
      Some(give_up(WorkflowFailure::RetryBudgetExhausted {
        step,
        attempts: last.attempt,
        last_error: last.error.clone(),
      }))
    }
  }

  pub fn run_id(&self) -> &str {
    &self.run_id
  }

  pub fn workflow_type(&self) -> &str {
    &self.workflow_type
  }

  pub fn input(&self) -> &serde_json::Value {
    &self.input
  }

  pub fn status(&self) -> RunStatus {
    self.status
  }

  pub fn steps(&self) -> &[StepRecord] {
    &self.steps
  }

  pub fn step(&self, name: StepName) -> Option<&StepRecord> {
    self.steps.iter().find(|r| r.step == name)
  }

  /// Steps in the order they were scheduled.
  pub fn scheduled_steps(&self) -> Vec<StepName> {
    self.steps.iter().map(|r| r.step).collect()
  }

  /// The step pointer: the last scheduled step.
  pub fn current_step(&self) -> Option<StepName> {
    self.steps.last().map(|r| r.step)
  }

  pub fn in_flight(&self) -> Option<&StepRecord> {
    self.steps.last().filter(|r| r.is_in_flight())
  }

  pub fn cancel_requested(&self) -> bool {
    self.cancel_requested
  }

  pub fn output(&self) -> Option<&serde_json::Value> {
    self.output.as_ref()
  }

  pub fn failure(&self) -> Option<&WorkflowFailure> {
    self.failure.as_ref()
  }

  pub fn last_sequence(&self) -> u64 {
    self.last_sequence
  }

  pub fn started_at(&self) -> DateTime<Utc> {
    self.started_at
  }

  pub fn finished_at(&self) -> Option<DateTime<Utc>> {
    self.finished_at
  }

  fn next_schedulable(&self) -> Option<StepName> {
    match self.steps.last() {
      None => Some(StepName::first()),
      Some(last) => match last.progress {
        StepProgress::Completed { .. } => last.step.next(),
        StepProgress::InFlight | StepProgress::Failed { .. } => None,
      },
    }
  }

  fn check_position(&self, record: &EventRecord) -> Result<(), ReplayError> {
    if record.run_id != self.run_id {
      return Err(ReplayError::ForeignRecord {
        run_id: self.run_id.clone(),
        found: record.run_id.clone(),
      });
    }
    let expected = self.last_sequence + 1;
    if record.sequence != expected {
      return Err(ReplayError::SequenceGap {
        run_id: self.run_id.clone(),
        expected,
        found: record.sequence,
      });
    }
    Ok(())
  }

  /// The in-flight step, if `step` is it and `attempt` is its current attempt.
  fn reporting_step(
    &mut self,
    record: &EventRecord,
    step: StepName,
    attempt: u32,
  ) -> Result<&mut StepRecord, ReplayError> {
    let expected = self
      .in_flight()
      .filter(|current| current.step == step)
      .map(StepRecord::next_attempt);
    if expected != Some(attempt) {
      let message = format!("step '{step}' attempt {attempt} is not in flight");
      return Err(self.unexpected(record, &message));
    }
    self
      .steps
      .last_mut()
      .ok_or_else(|| ReplayError::UnexpectedEvent {
        run_id: record.run_id.clone(),
        sequence: record.sequence,
        event: record.event.name(),
        message: "no step scheduled".to_string(),
      })
  }

  fn unexpected(&self, record: &EventRecord, message: &str) -> ReplayError {
    ReplayError::UnexpectedEvent {
      run_id: self.run_id.clone(),
      sequence: record.sequence,
      event: record.event.name(),
      message: message.to_string(),
    }
  }
}

/// Replay a history and check that every recorded decision is the one the
/// machine makes on the history before it.
pub fn verify_history(run_id: &str, records: &[EventRecord]) -> Result<WorkflowState, ReplayError> {
  let (first, rest) = records.split_first().ok_or_else(|| ReplayError::Empty {
    run_id: run_id.to_string(),
  })?;

  let mut state = WorkflowState::start(run_id, first)?;
  for record in rest {
    state.check_position(record)?;
    if record.event.is_decision() {
      let decision = state.decide();
      if !decision.produces(&record.event) {
        return Err(ReplayError::NonDeterministic {
          run_id: run_id.to_string(),
          sequence: record.sequence,
          recorded: describe(&record.event),
          decided: decision.to_string(),
        });
      }
    }
    state.apply(record)?;
  }
  Ok(state)
}

fn describe(event: &HistoryEvent) -> String {
  match event {
    HistoryEvent::StepScheduled { step, .. } => format!("{}({step})", event.name()),
    HistoryEvent::WorkflowFailed { failure } => format!("{}({failure})", event.name()),
    other => other.name().to_string(),
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeDelta;
  use legend_config::{EngineConfig, RetryBackoff, RetryPolicyConfig};
  use serde_json::json;

  use super::*;

  const RUN: &str = "run-1";

  struct History {
    records: Vec<EventRecord>,
    origin: DateTime<Utc>,
  }

  impl History {
    fn started() -> Self {
      let origin = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
      let mut history = Self {
        records: Vec::new(),
        origin,
      };
      history.push_at(
        0,
        HistoryEvent::WorkflowStarted {
          workflow_type: "legend_engine".to_string(),
          input: json!("scene-42"),
        },
      );
      history
    }

    fn push(&mut self, event: HistoryEvent) {
      let secs = self.records.len() as i64;
      self.push_at(secs, event);
    }

    fn push_at(&mut self, secs: i64, event: HistoryEvent) {
      let sequence = self.records.len() as u64 + 1;
      let recorded_at = self.origin + TimeDelta::seconds(secs);
      self
        .records
        .push(EventRecord::new(RUN, sequence, recorded_at, event));
    }

    fn state(&self) -> WorkflowState {
      verify_history(RUN, &self.records).unwrap()
    }

    /// Decide on the current history and record the decision.
    fn commit(&mut self, definition: &WorkflowDefinition) -> Decision {
      let decision = self.state().decide();
      if let Some(event) = decision.event(definition) {
        self.push(event);
      }
      decision
    }
  }

  fn definition() -> WorkflowDefinition {
    WorkflowDefinition::from_config(&EngineConfig::default())
  }

  fn analysis() -> serde_json::Value {
    json!({"scene_id": "scene-42", "potential_gag": "The Slip"})
  }

  fn timeout() -> ActivityError {
    ActivityError::TimeoutExceeded {
      timeout_ms: 120_000,
    }
  }

  fn retryable_failure(step: StepName, attempt: u32) -> HistoryEvent {
    HistoryEvent::AttemptFailed {
      step,
      attempt,
      error: timeout(),
      kind: FailureKind::Retryable,
    }
  }

  fn analyzed(definition: &WorkflowDefinition) -> History {
    let mut history = History::started();
    history.commit(definition);
    history.push(HistoryEvent::StepCompleted {
      step: StepName::Analyze,
      attempt: 1,
      output: analysis(),
    });
    history
  }

  #[test]
  fn test_new_run_schedules_analyze() {
    let history = History::started();
    let state = history.state();

    assert_eq!(state.status(), RunStatus::Created);
    assert_eq!(state.current_step(), None);
    assert_eq!(
      state.decide(),
      Decision::Schedule {
        step: StepName::Analyze,
        input: json!("scene-42"),
      }
    );
  }

  #[test]
  fn test_happy_path() {
    let definition = definition();
    let mut history = analyzed(&definition);

    let decision = history.commit(&definition);
    assert_eq!(
      decision,
      Decision::Schedule {
        step: StepName::Transform,
        input: analysis(),
      }
    );
    assert_eq!(history.state().status(), RunStatus::Running);

    history.push(HistoryEvent::StepCompleted {
      step: StepName::Transform,
      attempt: 1,
      output: json!("Remix manifest generated successfully."),
    });
    assert_eq!(
      history.commit(&definition),
      Decision::Complete {
        output: json!("Remix manifest generated successfully."),
      }
    );

    let state = history.state();
    assert_eq!(state.status(), RunStatus::Completed);
    assert_eq!(
      state.scheduled_steps(),
      vec![StepName::Analyze, StepName::Transform]
    );
    assert_eq!(state.decide(), Decision::Terminal);
    assert!(state.finished_at().is_some());
  }

  #[test]
  fn test_scheduled_timeout_comes_from_definition() {
    let definition = definition();
    let mut history = History::started();
    history.commit(&definition);

    let record = history.state();
    assert_eq!(record.step(StepName::Analyze).unwrap().timeout_ms, 30_000);
  }

  #[test]
  fn test_replaying_every_prefix_reproduces_recorded_decisions() {
    let definition = definition();
    let mut history = analyzed(&definition);
    history.commit(&definition);
    history.push(retryable_failure(StepName::Transform, 1));
    history.push(HistoryEvent::StepCompleted {
      step: StepName::Transform,
      attempt: 2,
      output: json!("done"),
    });
    history.commit(&definition);

    for (index, record) in history.records.iter().enumerate().skip(1) {
      if !record.event.is_decision() {
        continue;
      }
      let prefix = WorkflowState::replay(RUN, &history.records[..index]).unwrap();
      let replayed = prefix.decide().event(&definition).unwrap();
      assert_eq!(replayed, record.event);
    }

    let first = WorkflowState::replay(RUN, &history.records).unwrap();
    let second = WorkflowState::replay(RUN, &history.records).unwrap();
    assert_eq!(first, second);
  }

  #[test]
  fn test_awaits_current_attempt() {
    let definition = definition();
    let mut history = History::started();
    history.commit(&definition);
    assert_eq!(
      history.state().decide(),
      Decision::AwaitActivity {
        step: StepName::Analyze,
        attempt: 1,
      }
    );

    history.push(retryable_failure(StepName::Analyze, 1));
    assert_eq!(
      history.state().decide(),
      Decision::AwaitActivity {
        step: StepName::Analyze,
        attempt: 2,
      }
    );
  }

  #[test]
  fn test_follow_up_retries_then_gives_up() {
    let definition = definition();
    let policy = &definition.step(StepName::Analyze).retry;
    let mut history = History::started();
    history.commit(&definition);

    assert_eq!(history.state().retry_follow_up(policy), None);

    history.push(retryable_failure(StepName::Analyze, 1));
    assert_eq!(
      history.state().retry_follow_up(policy),
      Some(FollowUp::Retry {
        step: StepName::Analyze,
        attempt: 2,
        delay: Duration::from_secs(1),
      })
    );

    history.push(retryable_failure(StepName::Analyze, 2));
    assert_eq!(
      history.state().retry_follow_up(policy),
      Some(FollowUp::Retry {
        step: StepName::Analyze,
        attempt: 3,
        delay: Duration::from_secs(2),
      })
    );

    history.push(retryable_failure(StepName::Analyze, 3));
    let follow_up = history.state().retry_follow_up(policy).unwrap();
    let expected = WorkflowFailure::RetryBudgetExhausted {
      step: StepName::Analyze,
      attempts: 3,
      last_error: timeout(),
    };
    assert_eq!(
      follow_up,
      FollowUp::GiveUp {
        step: StepName::Analyze,
        attempt: 3,
        failure: expected.clone(),
      }
    );

    history.push(follow_up.event().unwrap());
    assert_eq!(
      history.commit(&definition),
      Decision::Fail { failure: expected }
    );
    assert_eq!(history.state().status(), RunStatus::Failed);
    assert_eq!(history.state().scheduled_steps(), vec![StepName::Analyze]);
  }

  #[test]
  fn test_fatal_failure_gives_up_immediately() {
    let definition = definition();
    let policy = &definition.step(StepName::Analyze).retry;
    let mut history = History::started();
    history.commit(&definition);

    let error = ActivityError::collaborator("scene-analyzer", "scene not found");
    history.push(HistoryEvent::AttemptFailed {
      step: StepName::Analyze,
      attempt: 1,
      error: error.clone(),
      kind: FailureKind::Fatal,
    });

    assert_eq!(
      history.state().retry_follow_up(policy),
      Some(FollowUp::GiveUp {
        step: StepName::Analyze,
        attempt: 1,
        failure: WorkflowFailure::ActivityFatal {
          step: StepName::Analyze,
          error,
        },
      })
    );
  }

  #[test]
  fn test_elapsed_ceiling_uses_recorded_timestamps() {
    let mut config = EngineConfig::default();
    config.analyze.retry = RetryPolicyConfig {
      backoff: RetryBackoff::Constant,
      initial_delay_ms: 1_000,
      multiplier: 1.0,
      max_delay_ms: 1_000,
      max_attempts: 10,
      max_elapsed_ms: Some(10_000),
      retry_timeouts: true,
    };
    let definition = WorkflowDefinition::from_config(&config);
    let policy = &definition.step(StepName::Analyze).retry;

    let mut history = History::started();
    history.commit(&definition);
    history.push_at(10, retryable_failure(StepName::Analyze, 1));

    assert!(matches!(
      history.state().retry_follow_up(policy),
      Some(FollowUp::GiveUp {
        failure: WorkflowFailure::RetryBudgetExhausted { attempts: 1, .. },
        ..
      })
    ));
  }

  #[test]
  fn test_cancel_before_start() {
    let definition = definition();
    let mut history = History::started();
    history.push(HistoryEvent::CancelRequested);

    assert_eq!(
      history.commit(&definition),
      Decision::Fail {
        failure: WorkflowFailure::Cancelled,
      }
    );
    assert!(history.state().scheduled_steps().is_empty());
  }

  #[test]
  fn test_cancel_after_analyze_skips_transform() {
    let definition = definition();
    let mut history = analyzed(&definition);
    history.push(HistoryEvent::CancelRequested);

    assert_eq!(
      history.commit(&definition),
      Decision::Fail {
        failure: WorkflowFailure::Cancelled,
      }
    );
    let state = history.state();
    assert_eq!(state.scheduled_steps(), vec![StepName::Analyze]);
    assert_eq!(state.step(StepName::Analyze).unwrap().output(), Some(&analysis()));
  }

  #[test]
  fn test_cancel_waits_for_in_flight_step() {
    let definition = definition();
    let mut history = History::started();
    history.commit(&definition);
    history.push(HistoryEvent::CancelRequested);

    assert_eq!(
      history.state().decide(),
      Decision::AwaitActivity {
        step: StepName::Analyze,
        attempt: 1,
      }
    );

    history.push(retryable_failure(StepName::Analyze, 1));
    let policy = &definition.step(StepName::Analyze).retry;
    assert_eq!(
      history.state().retry_follow_up(policy),
      Some(FollowUp::GiveUp {
        step: StepName::Analyze,
        attempt: 1,
        failure: WorkflowFailure::Cancelled,
      })
    );
  }

  #[test]
  fn test_cancel_after_last_step_still_completes() {
    let definition = definition();
    let mut history = analyzed(&definition);
    history.commit(&definition);
    history.push(HistoryEvent::StepCompleted {
      step: StepName::Transform,
      attempt: 1,
      output: json!("done"),
    });
    history.push(HistoryEvent::CancelRequested);

    assert_eq!(
      history.commit(&definition),
      Decision::Complete {
        output: json!("done"),
      }
    );
  }

  #[test]
  fn test_verify_rejects_skipped_step() {
    let mut history = History::started();
    history.push(HistoryEvent::StepScheduled {
      step: StepName::Transform,
      input: json!("scene-42"),
      timeout_ms: 120_000,
    });

    let err = verify_history(RUN, &history.records).unwrap_err();
    assert!(matches!(
      err,
      ReplayError::NonDeterministic { sequence: 2, .. }
    ));

    let err = WorkflowState::replay(RUN, &history.records).unwrap_err();
    assert!(matches!(err, ReplayError::UnexpectedEvent { sequence: 2, .. }));
  }

  #[test]
  fn test_verify_rejects_tampered_input() {
    let mut history = History::started();
    history.push(HistoryEvent::StepScheduled {
      step: StepName::Analyze,
      input: json!("scene-43"),
      timeout_ms: 30_000,
    });

    assert!(matches!(
      verify_history(RUN, &history.records),
      Err(ReplayError::NonDeterministic { .. })
    ));
  }

  #[test]
  fn test_verify_ignores_changed_timeout() {
    let mut history = History::started();
    history.push(HistoryEvent::StepScheduled {
      step: StepName::Analyze,
      input: json!("scene-42"),
      timeout_ms: 5,
    });

    assert!(verify_history(RUN, &history.records).is_ok());
  }

  #[test]
  fn test_rejects_broken_sequences() {
    assert_eq!(
      verify_history(RUN, &[]),
      Err(ReplayError::Empty {
        run_id: RUN.to_string(),
      })
    );

    let mut history = History::started();
    history.push(HistoryEvent::CancelRequested);
    history.records[1].sequence = 3;
    assert_eq!(
      WorkflowState::replay(RUN, &history.records),
      Err(ReplayError::SequenceGap {
        run_id: RUN.to_string(),
        expected: 2,
        found: 3,
      })
    );

    let history = History::started();
    assert!(matches!(
      WorkflowState::replay("run-2", &history.records),
      Err(ReplayError::ForeignRecord { .. })
    ));
  }

  #[test]
  fn test_rejects_report_for_wrong_attempt() {
    let definition = definition();
    let mut history = History::started();
    history.commit(&definition);
    history.push(HistoryEvent::StepCompleted {
      step: StepName::Analyze,
      attempt: 2,
      output: analysis(),
    });

    assert!(matches!(
      WorkflowState::replay(RUN, &history.records),
      Err(ReplayError::UnexpectedEvent { sequence: 3, .. })
    ));
  }

  #[test]
  fn test_rejects_events_after_terminal() {
    let definition = definition();
    let mut history = History::started();
    history.push(HistoryEvent::CancelRequested);
    history.commit(&definition);
    history.push(HistoryEvent::CancelRequested);

    assert!(matches!(
      WorkflowState::replay(RUN, &history.records),
      Err(ReplayError::UnexpectedEvent { sequence: 4, .. })
    ));
  }

  #[test]
  fn test_failure_converts_to_history_corruption() {
    let err = ReplayError::Empty {
      run_id: RUN.to_string(),
    };
    assert_eq!(err.run_id(), RUN);
    assert!(matches!(
      err.to_failure(),
      WorkflowFailure::HistoryCorruption { .. }
    ));
  }
}
