//! Legend Orchestrator
//!
//! Runs the analyze → transform workflow on top of the store, the queue and
//! the activity executor.
//!
//! - [`OrchestratorClient`] records `WorkflowStarted` and enqueues the first
//!   advance; it also waits on results and requests cancellation.
//! - [`Worker`] claims items and either advances a run (replay, decide,
//!   append) or executes one activity attempt and records its outcome.
//! - [`Orchestrator`] builds both from an [`EngineConfig`], re-enqueues
//!   unfinished runs found in the store and runs the worker pool.
//!
//! All run state lives in the append-only history. Workers keep nothing
//! between items, so any worker can pick up any run.

mod client;
mod error;
mod events;
mod orchestrator;
mod worker;

use legend_queue::{EnqueueOptions, EnqueueResult, TaskQueue, WorkItem};

pub use client::{OrchestratorClient, ResultStatus, RunResult, WorkflowHandle};
pub use error::{ClientError, OrchestratorError};
pub use events::{ChannelNotifier, ExecutionEvent, ExecutionNotifier, NoopNotifier};
pub use legend_config::EngineConfig;
pub use orchestrator::Orchestrator;
pub use worker::{ProcessOutcome, Worker};

/// Enqueue, treating a deduplicated item as already queued.
pub(crate) async fn enqueue(
  queue: &dyn TaskQueue,
  item: WorkItem,
  options: EnqueueOptions,
) -> Result<(), OrchestratorError> {
  match queue.enqueue(item, options).await? {
    EnqueueResult::Enqueued { .. } | EnqueueResult::Deduplicated { .. } => Ok(()),
    EnqueueResult::QueueFull => Err(OrchestratorError::QueueFull {
      queue: queue.name().to_string(),
    }),
  }
}
