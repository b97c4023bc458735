//! Legend Queue
//!
//! This crate provides the named work queue that connects clients and
//! workers:
//!
//! - [`TaskQueue`]: enqueue, claim under a lease, ack, abandon, renew
//! - [`WorkItem`]: serializable unit of work (advance a run, or run one
//!   activity attempt)
//! - [`InMemoryTaskQueue`]: process-local implementation
//!
//! Delivery is at least once. A claimed item stays invisible until its lease
//! runs out; if it is not acked by then it becomes claimable again with
//! `delivery_count + 1`. Handlers make redelivery harmless by checking the
//! run's history before acting.

mod error;
mod item;
mod memory;

use std::time::Duration;

use async_trait::async_trait;

pub use error::QueueError;
pub use item::{WorkItem, WorkKind};
pub use memory::InMemoryTaskQueue;

/// Options for [`TaskQueue::enqueue`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
  /// Keep the item invisible for this long.
  pub delay: Option<Duration>,
}

impl EnqueueOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }
}

/// Result of enqueuing an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
  Enqueued { item_id: String },
  /// An item with the same idempotency key is pending or leased.
  Deduplicated { existing_item_id: String },
  /// Queue is at capacity.
  QueueFull,
}

impl EnqueueResult {
  pub fn is_enqueued(&self) -> bool {
    matches!(self, Self::Enqueued { .. })
  }

  /// Whether the item is now in the queue, either newly or already.
  pub fn is_accepted(&self) -> bool {
    !matches!(self, Self::QueueFull)
  }
}

/// A claimed item. Only the holder of `token` can ack, abandon or renew it.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
  pub token: String,
  pub item: WorkItem,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
  /// Claimable now.
  pub ready: usize,
  /// Waiting out an enqueue or abandon delay.
  pub delayed: usize,
  pub leased: usize,
}

impl QueueDepth {
  pub fn total(&self) -> usize {
    self.ready + self.delayed + self.leased
  }
}

/// Named queue of work items.
#[async_trait]
pub trait TaskQueue: Send + Sync {
  fn name(&self) -> &str;

  /// Add an item. Deduplicated by [`WorkItem::idempotency_key`] until the
  /// earlier item is acked.
  async fn enqueue(
    &self,
    item: WorkItem,
    options: EnqueueOptions,
  ) -> Result<EnqueueResult, QueueError>;

  /// Claim the oldest visible item for `lease`. Expired leases are
  /// reclaimed first.
  async fn claim(&self, worker_id: &str, lease: Duration) -> Result<Option<Lease>, QueueError>;

  /// Remove a claimed item for good.
  async fn ack(&self, token: &str) -> Result<(), QueueError>;

  /// Give a claimed item back, visible again after `delay`.
  async fn abandon(&self, token: &str, delay: Duration) -> Result<(), QueueError>;

  /// Push the lease deadline to `extend_for` from now.
  async fn renew(&self, token: &str, extend_for: Duration) -> Result<(), QueueError>;

  async fn depth(&self) -> Result<QueueDepth, QueueError>;
}
