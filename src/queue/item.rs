use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The closed set of mutations that can be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
  CreateBooking,
  UpdateBooking,
  PaymentAttempt,
}

impl ActionKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ActionKind::CreateBooking => "create_booking",
      ActionKind::UpdateBooking => "update_booking",
      ActionKind::PaymentAttempt => "payment_attempt",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "create_booking" => Some(ActionKind::CreateBooking),
      "update_booking" => Some(ActionKind::UpdateBooking),
      "payment_attempt" => Some(ActionKind::PaymentAttempt),
      _ => None,
    }
  }
}

impl fmt::Display for ActionKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
  /// Waiting for the next drain
  Pending,
  /// Exhausted retries or rejected by the server; needs the user
  Failed,
}

impl ItemStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      ItemStatus::Pending => "pending",
      ItemStatus::Failed => "failed",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "pending" => Some(ItemStatus::Pending),
      "failed" => Some(ItemStatus::Failed),
      _ => None,
    }
  }
}

/// One pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncItem {
  pub id: String,
  pub action: ActionKind,
  /// Opaque to the queue
  pub payload: Value,
  pub timestamp: DateTime<Utc>,
  pub retry_count: u32,
  pub max_retries: u32,
  pub status: ItemStatus,
  pub last_error: Option<String>,
  /// Enqueue order
  #[serde(skip)]
  pub seq: i64,
  /// Earliest time of the next attempt after a transient failure
  #[serde(skip)]
  pub next_attempt_at: Option<DateTime<Utc>>,
}

impl SyncItem {
  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.next_attempt_at.map_or(true, |at| at <= now)
  }
}

/// State changes the UI subscribes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
  Enqueued {
    id: String,
    action: ActionKind,
  },
  Retrying {
    id: String,
    action: ActionKind,
    retry_count: u32,
    error: String,
  },
  Succeeded {
    id: String,
    action: ActionKind,
  },
  FailedPermanently {
    id: String,
    action: ActionKind,
    reason: String,
  },
}

impl QueueEvent {
  pub fn id(&self) -> &str {
    match self {
      QueueEvent::Enqueued { id, .. }
      | QueueEvent::Retrying { id, .. }
      | QueueEvent::Succeeded { id, .. }
      | QueueEvent::FailedPermanently { id, .. } => id,
    }
  }
}
