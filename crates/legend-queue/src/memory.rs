//! In-memory task queue.
//!
//! Visibility and lease deadlines use [`tokio::time::Instant`], so tests
//! running on a paused clock control expiry exactly.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tracing::warn;

use crate::{EnqueueOptions, EnqueueResult, Lease, QueueDepth, QueueError, TaskQueue, WorkItem};

#[derive(Debug)]
struct PendingEntry {
  item: WorkItem,
  visible_at: Instant,
}

#[derive(Debug)]
struct LeasedEntry {
  item: WorkItem,
  worker_id: String,
  expires_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
  /// In enqueue order.
  pending: Vec<PendingEntry>,
  leased: HashMap<String, LeasedEntry>,
  /// Idempotency key to item id, held until ack.
  keys: HashMap<String, String>,
}

impl QueueState {
  fn reclaim_expired(&mut self, now: Instant) {
    let expired: Vec<String> = self
      .leased
      .iter()
      .filter(|(_, entry)| entry.expires_at <= now)
      .map(|(token, _)| token.clone())
      .collect();

    for token in expired {
      if let Some(entry) = self.leased.remove(&token) {
        warn!(
          item_id = %entry.item.item_id,
          run_id = %entry.item.run_id,
          worker_id = %entry.worker_id,
          delivery_count = entry.item.delivery_count,
          "lease_expired"
        );
        let mut item = entry.item;
        item.lease_deadline = None;
        self.pending.push(PendingEntry {
          item,
          visible_at: now,
        });
      }
    }
  }
}

fn poison_err<T>(_: PoisonError<T>) -> QueueError {
  QueueError::Poisoned
}

/// Process-local [`TaskQueue`].
#[derive(Debug)]
pub struct InMemoryTaskQueue {
  name: String,
  state: RwLock<QueueState>,
  /// Maximum number of pending plus leased items.
  max_capacity: Option<usize>,
}

impl InMemoryTaskQueue {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      state: RwLock::new(QueueState::default()),
      max_capacity: None,
    }
  }

  pub fn with_capacity(name: impl Into<String>, max_capacity: usize) -> Self {
    Self {
      max_capacity: Some(max_capacity),
      ..Self::new(name)
    }
  }

  fn remove_leased(state: &mut QueueState, token: &str) -> Result<LeasedEntry, QueueError> {
    state
      .leased
      .remove(token)
      .ok_or_else(|| QueueError::LeaseNotFound {
        token: token.to_string(),
      })
  }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
  fn name(&self) -> &str {
    &self.name
  }

  async fn enqueue(
    &self,
    item: WorkItem,
    options: EnqueueOptions,
  ) -> Result<EnqueueResult, QueueError> {
    let mut state = self.state.write().map_err(poison_err)?;

    if let Some(existing) = state.keys.get(&item.idempotency_key) {
      return Ok(EnqueueResult::Deduplicated {
        existing_item_id: existing.clone(),
      });
    }

    if let Some(max) = self.max_capacity {
      if state.pending.len() + state.leased.len() >= max {
        return Ok(EnqueueResult::QueueFull);
      }
    }

    let item_id = item.item_id.clone();
    state
      .keys
      .insert(item.idempotency_key.clone(), item_id.clone());
    state.pending.push(PendingEntry {
      item,
      visible_at: Instant::now() + options.delay.unwrap_or_default(),
    });

    Ok(EnqueueResult::Enqueued { item_id })
  }

  async fn claim(&self, worker_id: &str, lease: Duration) -> Result<Option<Lease>, QueueError> {
    let mut state = self.state.write().map_err(poison_err)?;
    let now = Instant::now();
    state.reclaim_expired(now);

    // Oldest visible entry; reclaimed entries went to the back.
    let Some(index) = state.pending.iter().position(|e| e.visible_at <= now) else {
      return Ok(None);
    };

    let mut item = state.pending.remove(index).item;
    item.delivery_count += 1;
    item.lease_deadline = chrono::Duration::from_std(lease)
      .ok()
      .and_then(|lease| Utc::now().checked_add_signed(lease));

    let token = uuid::Uuid::new_v4().to_string();
    state.leased.insert(
      token.clone(),
      LeasedEntry {
        item: item.clone(),
        worker_id: worker_id.to_string(),
        expires_at: now + lease,
      },
    );

    Ok(Some(Lease { token, item }))
  }

  async fn ack(&self, token: &str) -> Result<(), QueueError> {
    let mut state = self.state.write().map_err(poison_err)?;
    let entry = Self::remove_leased(&mut state, token)?;
    state.keys.remove(&entry.item.idempotency_key);
    Ok(())
  }

  async fn abandon(&self, token: &str, delay: Duration) -> Result<(), QueueError> {
    let mut state = self.state.write().map_err(poison_err)?;
    let entry = Self::remove_leased(&mut state, token)?;
    let mut item = entry.item;
    item.lease_deadline = None;
    state.pending.push(PendingEntry {
      item,
      visible_at: Instant::now() + delay,
    });
    Ok(())
  }

  async fn renew(&self, token: &str, extend_for: Duration) -> Result<(), QueueError> {
    let mut state = self.state.write().map_err(poison_err)?;
    let now = Instant::now();
    let entry = state
      .leased
      .get_mut(token)
      .filter(|entry| entry.expires_at > now)
      .ok_or_else(|| QueueError::LeaseNotFound {
        token: token.to_string(),
      })?;

    entry.expires_at = now + extend_for;
    entry.item.lease_deadline = chrono::Duration::from_std(extend_for)
      .ok()
      .and_then(|extend| Utc::now().checked_add_signed(extend));
    Ok(())
  }

  async fn depth(&self) -> Result<QueueDepth, QueueError> {
    let state = self.state.read().map_err(poison_err)?;
    let now = Instant::now();
    let ready = state
      .pending
      .iter()
      .filter(|e| e.visible_at <= now)
      .count();
    // Expired leases count as ready; the next claim reclaims them.
    let expired = state
      .leased
      .values()
      .filter(|e| e.expires_at <= now)
      .count();

    Ok(QueueDepth {
      ready: ready + expired,
      delayed: state.pending.len() - ready,
      leased: state.leased.len() - expired,
    })
  }
}

#[cfg(test)]
mod tests {
  use legend_workflow::StepName;
  use serde_json::json;

  use super::*;

  const LEASE: Duration = Duration::from_secs(30);

  fn activity(attempt: u32) -> WorkItem {
    WorkItem::activity("run-1", StepName::Analyze, attempt, json!("scene-42"))
  }

  #[tokio::test(start_paused = true)]
  async fn test_claim_in_enqueue_order_and_ack() {
    let queue = InMemoryTaskQueue::new("chaplin-production-queue");
    queue
      .enqueue(WorkItem::advance("run-1", 1), EnqueueOptions::new())
      .await
      .unwrap();
    queue
      .enqueue(activity(1), EnqueueOptions::new())
      .await
      .unwrap();

    let first = queue.claim("w1", LEASE).await.unwrap().unwrap();
    assert_eq!(first.item.idempotency_key, "run-1:advance:1");
    assert_eq!(first.item.delivery_count, 1);
    assert!(first.item.lease_deadline.is_some());

    let second = queue.claim("w2", LEASE).await.unwrap().unwrap();
    assert_eq!(second.item.idempotency_key, "run-1:analyze:1");
    assert!(queue.claim("w3", LEASE).await.unwrap().is_none());

    queue.ack(&first.token).await.unwrap();
    queue.ack(&second.token).await.unwrap();
    assert_eq!(queue.depth().await.unwrap().total(), 0);
    assert!(matches!(
      queue.ack(&first.token).await,
      Err(QueueError::LeaseNotFound { .. })
    ));
  }

  #[tokio::test(start_paused = true)]
  async fn test_deduplicates_until_ack() {
    let queue = InMemoryTaskQueue::new("q");

    let first = queue
      .enqueue(activity(1), EnqueueOptions::new())
      .await
      .unwrap();
    let item_id = match first {
      EnqueueResult::Enqueued { item_id } => item_id,
      other => panic!("expected Enqueued, got {other:?}"),
    };

    let duplicate = queue
      .enqueue(activity(1), EnqueueOptions::new())
      .await
      .unwrap();
    assert_eq!(
      duplicate,
      EnqueueResult::Deduplicated {
        existing_item_id: item_id,
      }
    );
    assert!(duplicate.is_accepted());

    let lease = queue.claim("w1", LEASE).await.unwrap().unwrap();
    let while_leased = queue
      .enqueue(activity(1), EnqueueOptions::new())
      .await
      .unwrap();
    assert!(!while_leased.is_enqueued());

    queue.ack(&lease.token).await.unwrap();
    let after_ack = queue
      .enqueue(activity(1), EnqueueOptions::new())
      .await
      .unwrap();
    assert!(after_ack.is_enqueued());

    let next_attempt = queue
      .enqueue(activity(2), EnqueueOptions::new())
      .await
      .unwrap();
    assert!(next_attempt.is_enqueued());
  }

  #[tokio::test(start_paused = true)]
  async fn test_delayed_item_becomes_visible() {
    let queue = InMemoryTaskQueue::new("q");
    queue
      .enqueue(
        activity(2),
        EnqueueOptions::new().with_delay(Duration::from_secs(10)),
      )
      .await
      .unwrap();

    assert!(queue.claim("w1", LEASE).await.unwrap().is_none());
    assert_eq!(queue.depth().await.unwrap().delayed, 1);

    tokio::time::advance(Duration::from_secs(10)).await;
    assert_eq!(queue.depth().await.unwrap().ready, 1);
    assert!(queue.claim("w1", LEASE).await.unwrap().is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_expired_lease_is_redelivered() {
    let queue = InMemoryTaskQueue::new("q");
    queue
      .enqueue(activity(1), EnqueueOptions::new())
      .await
      .unwrap();

    let first = queue.claim("w1", LEASE).await.unwrap().unwrap();
    tokio::time::advance(LEASE).await;

    let second = queue.claim("w2", LEASE).await.unwrap().unwrap();
    assert_eq!(second.item.item_id, first.item.item_id);
    assert_eq!(second.item.delivery_count, 2);

    assert!(matches!(
      queue.ack(&first.token).await,
      Err(QueueError::LeaseNotFound { .. })
    ));
    queue.ack(&second.token).await.unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn test_renew_keeps_lease() {
    let queue = InMemoryTaskQueue::new("q");
    queue
      .enqueue(activity(1), EnqueueOptions::new())
      .await
      .unwrap();
    let lease = queue.claim("w1", LEASE).await.unwrap().unwrap();

    tokio::time::advance(Duration::from_secs(20)).await;
    queue.renew(&lease.token, LEASE).await.unwrap();
    tokio::time::advance(Duration::from_secs(20)).await;

    assert!(queue.claim("w2", LEASE).await.unwrap().is_none());
    assert_eq!(queue.depth().await.unwrap().leased, 1);
    queue.ack(&lease.token).await.unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn test_abandon_with_delay() {
    let queue = InMemoryTaskQueue::new("q");
    queue
      .enqueue(activity(1), EnqueueOptions::new())
      .await
      .unwrap();
    let lease = queue.claim("w1", LEASE).await.unwrap().unwrap();

    queue
      .abandon(&lease.token, Duration::from_secs(5))
      .await
      .unwrap();
    assert!(queue.claim("w1", LEASE).await.unwrap().is_none());

    tokio::time::advance(Duration::from_secs(5)).await;
    let again = queue.claim("w1", LEASE).await.unwrap().unwrap();
    assert_eq!(again.item.delivery_count, 2);
    assert!(matches!(
      queue.renew(&lease.token, LEASE).await,
      Err(QueueError::LeaseNotFound { .. })
    ));
  }

  #[tokio::test(start_paused = true)]
  async fn test_capacity_limit() {
    let queue = InMemoryTaskQueue::with_capacity("q", 2);
    for attempt in 1..=2 {
      let result = queue
        .enqueue(activity(attempt), EnqueueOptions::new())
        .await
        .unwrap();
      assert!(result.is_enqueued());
    }

    let full = queue
      .enqueue(activity(3), EnqueueOptions::new())
      .await
      .unwrap();
    assert_eq!(full, EnqueueResult::QueueFull);
    assert!(!full.is_accepted());
  }
}
