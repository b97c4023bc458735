//! Legend Workflow
//!
//! This crate provides the workflow model for Legend: the two step
//! definitions, the durable history events, the retry policy, and the state
//! machine that turns a recorded history into the next scheduling decision.
//!
//! Key properties:
//! - The state machine is pure. It reads no clock and performs no I/O; every
//!   decision is a function of the recorded history alone.
//! - Replaying a history reproduces the decisions that were recorded in it
//!   (see [`verify_history`]). A history that does not replay is corrupt.
//! - Retries belong to the activity layer. The machine schedules each step
//!   exactly once and only sees the step's final outcome.

mod activity;
mod definition;
mod error;
mod event;
mod machine;
mod retry;
mod step;

pub use activity::{ActivityError, ActivityInvocation, ActivityOutcome, FailureKind};
pub use definition::{StepDefinition, WorkflowDefinition};
pub use error::ReplayError;
pub use event::{EventRecord, HistoryEvent};
pub use machine::{
  AttemptRecord, Decision, FollowUp, RunStatus, StepProgress, StepRecord, WorkflowFailure,
  WorkflowState, verify_history,
};
pub use retry::{RetryDecision, RetryPolicy};
pub use step::StepName;
