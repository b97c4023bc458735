use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::activity::{ActivityError, FailureKind};
use crate::machine::WorkflowFailure;
use crate::step::StepName;

/// A durable fact about a run.
///
/// `StepScheduled`, `WorkflowCompleted` and `WorkflowFailed` are decisions of
/// the state machine and must replay identically. The rest record things that
/// happened outside the machine: a submission, an activity result, or a
/// cancellation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HistoryEvent {
  WorkflowStarted {
    workflow_type: String,
    input: serde_json::Value,
  },
  StepScheduled {
    step: StepName,
    input: serde_json::Value,
    timeout_ms: u64,
  },
  /// One attempt failed. Whether it is retried is derived from the history
  /// that ends with this event.
  AttemptFailed {
    step: StepName,
    attempt: u32,
    error: ActivityError,
    kind: FailureKind,
  },
  StepCompleted {
    step: StepName,
    attempt: u32,
    output: serde_json::Value,
  },
  StepFailed {
    step: StepName,
    attempt: u32,
    failure: WorkflowFailure,
  },
  CancelRequested,
  WorkflowCompleted {
    output: serde_json::Value,
  },
  WorkflowFailed {
    failure: WorkflowFailure,
  },
}

impl HistoryEvent {
  pub fn name(&self) -> &'static str {
    match self {
      HistoryEvent::WorkflowStarted { .. } => "workflow_started",
      HistoryEvent::StepScheduled { .. } => "step_scheduled",
      HistoryEvent::AttemptFailed { .. } => "attempt_failed",
      HistoryEvent::StepCompleted { .. } => "step_completed",
      HistoryEvent::StepFailed { .. } => "step_failed",
      HistoryEvent::CancelRequested => "cancel_requested",
      HistoryEvent::WorkflowCompleted { .. } => "workflow_completed",
      HistoryEvent::WorkflowFailed { .. } => "workflow_failed",
    }
  }

  /// Whether the event was authored by the state machine.
  pub fn is_decision(&self) -> bool {
    matches!(
      self,
      HistoryEvent::StepScheduled { .. }
        | HistoryEvent::WorkflowCompleted { .. }
        | HistoryEvent::WorkflowFailed { .. }
    )
  }

  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      HistoryEvent::WorkflowCompleted { .. } | HistoryEvent::WorkflowFailed { .. }
    )
  }
}

/// A history event as stored: run, position and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
  pub run_id: String,
  /// 1-based and contiguous within a run.
  pub sequence: u64,
  pub recorded_at: DateTime<Utc>,
  pub event: HistoryEvent,
}

impl EventRecord {
  pub fn new(
    run_id: impl Into<String>,
    sequence: u64,
    recorded_at: DateTime<Utc>,
    event: HistoryEvent,
  ) -> Self {
    Self {
      run_id: run_id.into(),
      sequence,
      recorded_at,
      event,
    }
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn test_event_wire_format() {
    let event = HistoryEvent::StepScheduled {
      step: StepName::Analyze,
      input: json!("scene-42"),
      timeout_ms: 30_000,
    };
    assert_eq!(
      serde_json::to_value(&event).unwrap(),
      json!({
        "event": "step_scheduled",
        "step": "analyze",
        "input": "scene-42",
        "timeout_ms": 30000
      })
    );

    let cancel: HistoryEvent = serde_json::from_value(json!({"event": "cancel_requested"})).unwrap();
    assert_eq!(cancel, HistoryEvent::CancelRequested);
  }

  #[test]
  fn test_decision_events() {
    assert!(
      HistoryEvent::WorkflowCompleted { output: json!(null) }.is_decision()
    );
    assert!(!HistoryEvent::CancelRequested.is_decision());
    assert!(
      !HistoryEvent::StepCompleted {
        step: StepName::Analyze,
        attempt: 1,
        output: json!({}),
      }
      .is_decision()
    );
  }
}
