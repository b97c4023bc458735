use chrono::{DateTime, Utc};
use legend_workflow::StepName;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
  /// Run the state machine for a run and commit its decision.
  Advance,
  /// Execute one attempt of a step.
  Activity,
}

/// A unit of work as carried by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
  pub item_id: String,
  pub run_id: String,
  pub kind: WorkKind,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub step: Option<StepName>,
  /// Attempt number for activity items, 0 for advance items.
  pub attempt: u32,
  pub payload: serde_json::Value,
  pub idempotency_key: String,
  pub enqueued_at: DateTime<Utc>,
  pub lease_deadline: Option<DateTime<Utc>>,
  /// How many times the item has been claimed.
  pub delivery_count: u32,
}

impl WorkItem {
  fn new(
    run_id: &str,
    kind: WorkKind,
    step: Option<StepName>,
    attempt: u32,
    payload: serde_json::Value,
    idempotency_key: String,
  ) -> Self {
    Self {
      item_id: uuid::Uuid::new_v4().to_string(),
      run_id: run_id.to_string(),
      kind,
      step,
      attempt,
      payload,
      idempotency_key,
      enqueued_at: Utc::now(),
      lease_deadline: None,
      delivery_count: 0,
    }
  }

  /// Ask a worker to advance `run_id` once its history has reached
  /// `after_sequence`.
  pub fn advance(run_id: &str, after_sequence: u64) -> Self {
    Self::new(
      run_id,
      WorkKind::Advance,
      None,
      0,
      serde_json::json!({ "after_sequence": after_sequence }),
      format!("{run_id}:advance:{after_sequence}"),
    )
  }

  /// Ask a worker to run attempt `attempt` of `step` on `input`.
  pub fn activity(run_id: &str, step: StepName, attempt: u32, input: serde_json::Value) -> Self {
    Self::new(
      run_id,
      WorkKind::Activity,
      Some(step),
      attempt,
      input,
      format!("{run_id}:{step}:{attempt}"),
    )
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn test_idempotency_keys() {
    assert_eq!(WorkItem::advance("r1", 3).idempotency_key, "r1:advance:3");
    assert_eq!(
      WorkItem::activity("r1", StepName::Transform, 2, json!({})).idempotency_key,
      "r1:transform:2"
    );
    assert_ne!(
      WorkItem::advance("r1", 3).item_id,
      WorkItem::advance("r1", 3).item_id
    );
  }

  #[test]
  fn test_wire_contract() {
    let item = WorkItem::activity("r1", StepName::Analyze, 1, json!("scene-42"));
    let value = serde_json::to_value(&item).unwrap();

    assert_eq!(value["run_id"], "r1");
    assert_eq!(value["kind"], "activity");
    assert_eq!(value["step"], "analyze");
    assert_eq!(value["attempt"], 1);
    assert_eq!(value["payload"], "scene-42");
    assert!(value["lease_deadline"].is_null());

    let decoded: WorkItem = serde_json::from_value(value).unwrap();
    assert_eq!(decoded, item);
  }
}
