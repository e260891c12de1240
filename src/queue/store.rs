//! SQLite persistence for the mutation queue.

use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::item::{ActionKind, ItemStatus, SyncItem};
use super::QueueError;
use crate::db::Database;

/// Schema for the sync queue.
const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    action TEXT NOT NULL,
    payload TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    last_error TEXT,
    next_attempt_ms INTEGER
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_pending
    ON sync_queue(status, action, seq);
"#;

const ITEM_COLUMNS: &str =
  "seq, id, action, payload, timestamp, retry_count, max_retries, status, last_error, next_attempt_ms";

/// Backoff exponent cap, keeps the shift well inside i64.
const MAX_BACKOFF_SHIFT: i64 = 16;

pub struct SqliteQueueStore {
  conn: Mutex<Connection>,
}

impl SqliteQueueStore {
  pub fn open(path: &Path) -> color_eyre::Result<Self> {
    let db = Database::open(path, QUEUE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(db.into_conn()),
    })
  }

  pub fn open_in_memory() -> color_eyre::Result<Self> {
    let db = Database::open_in_memory(QUEUE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(db.into_conn()),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, QueueError> {
    self
      .conn
      .lock()
      .map_err(|e| QueueError::Store(format!("Lock poisoned: {}", e)))
  }

  /// Persist a new item and return it with its sequence number.
  pub fn insert(
    &self,
    id: &str,
    action: ActionKind,
    payload: &Value,
    max_retries: u32,
    timestamp: DateTime<Utc>,
  ) -> Result<SyncItem, QueueError> {
    let payload_json = serde_json::to_string(payload)?;
    let conn = self.lock()?;
    let sql = format!(
      "INSERT INTO sync_queue (id, action, payload, timestamp, max_retries)
       VALUES (?, ?, ?, ?, ?)
       RETURNING {}",
      ITEM_COLUMNS
    );
    let item = conn.query_row(
      &sql,
      params![
        id,
        action.as_str(),
        payload_json,
        timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
        max_retries,
      ],
      read_item,
    )??;
    Ok(item)
  }

  /// Highest sequence number currently stored.
  pub fn max_seq(&self) -> Result<Option<i64>, QueueError> {
    let conn = self.lock()?;
    let seq = conn.query_row("SELECT MAX(seq) FROM sync_queue", [], |row| row.get(0))?;
    Ok(seq)
  }

  /// Pending items up to and including `max_seq`, in enqueue order.
  pub fn pending_up_to(&self, max_seq: i64) -> Result<Vec<SyncItem>, QueueError> {
    let conn = self.lock()?;
    let sql = format!(
      "SELECT {} FROM sync_queue WHERE status = 'pending' AND seq <= ? ORDER BY seq",
      ITEM_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
      .query_map(params![max_seq], read_item)?
      .collect::<Result<Vec<_>, _>>()?;
    items.into_iter().collect()
  }

  pub fn list(&self) -> Result<Vec<SyncItem>, QueueError> {
    let conn = self.lock()?;
    let sql = format!("SELECT {} FROM sync_queue ORDER BY seq", ITEM_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
      .query_map([], read_item)?
      .collect::<Result<Vec<_>, _>>()?;
    items.into_iter().collect()
  }

  pub fn get(&self, id: &str) -> Result<Option<SyncItem>, QueueError> {
    let conn = self.lock()?;
    let sql = format!("SELECT {} FROM sync_queue WHERE id = ?", ITEM_COLUMNS);
    conn
      .query_row(&sql, params![id], read_item)
      .optional()?
      .transpose()
  }

  pub fn count(&self, status: ItemStatus) -> Result<usize, QueueError> {
    let conn = self.lock()?;
    let n: i64 = conn.query_row(
      "SELECT COUNT(*) FROM sync_queue WHERE status = ?",
      params![status.as_str()],
      |row| row.get(0),
    )?;
    Ok(n.max(0) as usize)
  }

  /// Remove an acknowledged item. Returns false if it was already gone.
  pub fn delete(&self, id: &str) -> Result<bool, QueueError> {
    let conn = self.lock()?;
    Ok(conn.execute("DELETE FROM sync_queue WHERE id = ?", params![id])? > 0)
  }

  /// Remove an item only if it has failed permanently.
  pub fn delete_failed(&self, id: &str) -> Result<bool, QueueError> {
    let conn = self.lock()?;
    Ok(
      conn.execute(
        "DELETE FROM sync_queue WHERE id = ? AND status = 'failed'",
        params![id],
      )? > 0,
    )
  }

  /// Count one transient failure.
  ///
  /// A single statement increments the retry count, flips the item to
  /// failed once the budget is spent and schedules the next attempt with
  /// exponential backoff, so concurrent callers cannot lose an update.
  pub fn record_failure(
    &self,
    id: &str,
    error: &str,
    backoff: Duration,
    now: DateTime<Utc>,
  ) -> Result<Option<SyncItem>, QueueError> {
    let conn = self.lock()?;
    let sql = format!(
      "UPDATE sync_queue SET
         retry_count = retry_count + 1,
         status = CASE WHEN retry_count + 1 >= max_retries THEN 'failed' ELSE 'pending' END,
         last_error = ?2,
         next_attempt_ms = ?3 + (?4 << MIN(retry_count, ?5))
       WHERE id = ?1 AND status = 'pending'
       RETURNING {}",
      ITEM_COLUMNS
    );
    conn
      .query_row(
        &sql,
        params![
          id,
          error,
          now.timestamp_millis(),
          backoff.num_milliseconds().max(0),
          MAX_BACKOFF_SHIFT
        ],
        read_item,
      )
      .optional()?
      .transpose()
  }

  /// Mark an item failed without consuming retry budget.
  pub fn mark_failed(&self, id: &str, reason: &str) -> Result<Option<SyncItem>, QueueError> {
    let conn = self.lock()?;
    let sql = format!(
      "UPDATE sync_queue SET status = 'failed', last_error = ?2 WHERE id = ?1 RETURNING {}",
      ITEM_COLUMNS
    );
    conn
      .query_row(&sql, params![id, reason], read_item)
      .optional()?
      .transpose()
  }

  /// Put a failed item back in line with a fresh retry budget.
  pub fn reset(&self, id: &str) -> Result<Option<SyncItem>, QueueError> {
    let conn = self.lock()?;
    let sql = format!(
      "UPDATE sync_queue SET status = 'pending', retry_count = 0, last_error = NULL,
         next_attempt_ms = NULL
       WHERE id = ?1 AND status = 'failed'
       RETURNING {}",
      ITEM_COLUMNS
    );
    conn
      .query_row(&sql, params![id], read_item)
      .optional()?
      .transpose()
  }
}

/// Map a row to an item. Decoding problems surface as the inner error so a
/// single corrupt row does not look like a SQLite failure.
fn read_item(row: &Row<'_>) -> rusqlite::Result<Result<SyncItem, QueueError>> {
  let seq: i64 = row.get(0)?;
  let id: String = row.get(1)?;
  let action: String = row.get(2)?;
  let payload: String = row.get(3)?;
  let timestamp: String = row.get(4)?;
  let retry_count: u32 = row.get(5)?;
  let max_retries: u32 = row.get(6)?;
  let status: String = row.get(7)?;
  let last_error: Option<String> = row.get(8)?;
  let next_attempt_ms: Option<i64> = row.get(9)?;

  Ok(decode_item(
    seq,
    id,
    &action,
    &payload,
    &timestamp,
    retry_count,
    max_retries,
    &status,
    last_error,
    next_attempt_ms,
  ))
}

#[allow(clippy::too_many_arguments)]
fn decode_item(
  seq: i64,
  id: String,
  action: &str,
  payload: &str,
  timestamp: &str,
  retry_count: u32,
  max_retries: u32,
  status: &str,
  last_error: Option<String>,
  next_attempt_ms: Option<i64>,
) -> Result<SyncItem, QueueError> {
  let action = ActionKind::parse(action)
    .ok_or_else(|| QueueError::Store(format!("Unknown action {:?} for item {}", action, id)))?;
  let status = ItemStatus::parse(status)
    .ok_or_else(|| QueueError::Store(format!("Unknown status {:?} for item {}", status, id)))?;
  let payload: Value = serde_json::from_str(payload)?;
  let timestamp = DateTime::parse_from_rfc3339(timestamp)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| QueueError::Store(format!("Failed to parse datetime '{}': {}", timestamp, e)))?;
  let next_attempt_at = next_attempt_ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single());

  Ok(SyncItem {
    id,
    action,
    payload,
    timestamp,
    retry_count,
    max_retries,
    status,
    last_error,
    seq,
    next_attempt_at,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn insert(store: &SqliteQueueStore, id: &str, action: ActionKind, max_retries: u32) -> SyncItem {
    store
      .insert(id, action, &json!({"id": id}), max_retries, Utc::now())
      .unwrap()
  }

  #[test]
  fn test_insert_assigns_increasing_seq() {
    let store = SqliteQueueStore::open_in_memory().unwrap();
    let a = insert(&store, "a", ActionKind::CreateBooking, 3);
    let b = insert(&store, "b", ActionKind::CreateBooking, 3);
    assert!(b.seq > a.seq);
    assert_eq!(a.status, ItemStatus::Pending);
    assert_eq!(a.retry_count, 0);
    assert_eq!(store.max_seq().unwrap(), Some(b.seq));
  }

  #[test]
  fn test_pending_snapshot_bound() {
    let store = SqliteQueueStore::open_in_memory().unwrap();
    let a = insert(&store, "a", ActionKind::CreateBooking, 3);
    insert(&store, "b", ActionKind::PaymentAttempt, 3);
    let ids: Vec<String> = store
      .pending_up_to(a.seq)
      .unwrap()
      .into_iter()
      .map(|i| i.id)
      .collect();
    assert_eq!(ids, vec!["a".to_string()]);
  }

  #[test]
  fn test_record_failure_increments_and_fails_at_budget() {
    let store = SqliteQueueStore::open_in_memory().unwrap();
    insert(&store, "a", ActionKind::UpdateBooking, 2);
    let now = Utc::now();

    let first = store
      .record_failure("a", "timeout", Duration::seconds(2), now)
      .unwrap()
      .unwrap();
    assert_eq!(first.retry_count, 1);
    assert_eq!(first.status, ItemStatus::Pending);
    let delay = first.next_attempt_at.unwrap() - now;
    assert!(delay >= Duration::milliseconds(1_999) && delay <= Duration::milliseconds(2_001));

    let second = store
      .record_failure("a", "timeout", Duration::seconds(2), now)
      .unwrap()
      .unwrap();
    assert_eq!(second.retry_count, 2);
    assert_eq!(second.status, ItemStatus::Failed);
    assert_eq!(second.last_error.as_deref(), Some("timeout"));

    // Failed items are no longer counted against
    assert!(store
      .record_failure("a", "timeout", Duration::seconds(2), now)
      .unwrap()
      .is_none());
  }

  #[test]
  fn test_backoff_doubles() {
    let store = SqliteQueueStore::open_in_memory().unwrap();
    insert(&store, "a", ActionKind::UpdateBooking, 10);
    let now = Utc::now();
    store.record_failure("a", "x", Duration::seconds(1), now).unwrap();
    let second = store
      .record_failure("a", "x", Duration::seconds(1), now)
      .unwrap()
      .unwrap();
    let delay = second.next_attempt_at.unwrap() - now;
    assert!(delay >= Duration::milliseconds(1_999) && delay <= Duration::milliseconds(2_001));
  }

  #[test]
  fn test_mark_failed_keeps_retry_count() {
    let store = SqliteQueueStore::open_in_memory().unwrap();
    insert(&store, "a", ActionKind::PaymentAttempt, 3);
    let item = store.mark_failed("a", "card declined").unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Failed);
    assert_eq!(item.retry_count, 0);
    assert_eq!(store.count(ItemStatus::Failed).unwrap(), 1);
    assert_eq!(store.count(ItemStatus::Pending).unwrap(), 0);
  }

  #[test]
  fn test_reset_and_delete_failed() {
    let store = SqliteQueueStore::open_in_memory().unwrap();
    insert(&store, "a", ActionKind::PaymentAttempt, 3);
    insert(&store, "b", ActionKind::PaymentAttempt, 3);

    // Only failed items can be reset or dismissed
    assert!(store.reset("a").unwrap().is_none());
    assert!(!store.delete_failed("a").unwrap());

    store.mark_failed("a", "rejected").unwrap();
    let reset = store.reset("a").unwrap().unwrap();
    assert_eq!(reset.status, ItemStatus::Pending);
    assert!(reset.last_error.is_none());

    store.mark_failed("b", "rejected").unwrap();
    assert!(store.delete_failed("b").unwrap());
    assert!(store.get("b").unwrap().is_none());
    assert_eq!(store.list().unwrap().len(), 1);
  }
}
