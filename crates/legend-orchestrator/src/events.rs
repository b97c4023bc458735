//! Execution events and notifiers for observability.
//!
//! Events are emitted as runs progress so consumers can watch them, stream
//! them to a UI, or collect them in tests. They are not the durable record;
//! that is the run's history in the store.

use legend_workflow::StepName;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted while runs are processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionEvent {
  /// A client submitted a run.
  RunSubmitted { run_id: String, scene_id: String },

  /// A step was scheduled.
  StepScheduled { run_id: String, step: StepName },

  /// An attempt is about to run.
  AttemptStarted {
    run_id: String,
    step: StepName,
    attempt: u32,
  },

  /// An attempt failed.
  AttemptFailed {
    run_id: String,
    step: StepName,
    attempt: u32,
    error: String,
  },

  /// The next attempt was queued after a backoff delay.
  RetryScheduled {
    run_id: String,
    step: StepName,
    attempt: u32,
    delay_ms: u64,
  },

  StepCompleted { run_id: String, step: StepName },

  StepFailed {
    run_id: String,
    step: StepName,
    error: String,
  },

  CancelRequested { run_id: String },

  RunCompleted { run_id: String },

  RunFailed { run_id: String, error: String },

  /// The run's history did not replay and it was set aside.
  RunQuarantined { run_id: String, reason: String },
}

/// Trait for receiving execution events.
///
/// Workers and clients call `notify` for each event; implementations decide
/// what to do with them.
pub trait ExecutionNotifier: Send + Sync {
  fn notify(&self, event: ExecutionEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {}
}

/// Sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // Receiver may have been dropped
    let _ = self.sender.send(event);
  }
}
