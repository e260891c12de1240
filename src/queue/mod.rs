//! Durable queue of writes made while offline.
//!
//! Items are persisted before `enqueue` returns and replayed in enqueue
//! order per action kind. Kinds drain concurrently; a stuck booking update
//! never holds back a payment attempt.

mod item;
mod replay;
mod store;

pub use item::{ActionKind, ItemStatus, QueueEvent, SyncItem};
pub use replay::{HttpReplayer, MutationEnvelope, ReplayError, Replayer};
pub use store::SqliteQueueStore;

use chrono::{Duration, Utc};
use futures::future::join_all;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::config::QueueConfig;

/// Base backoff is capped at one day.
const MAX_BACKOFF_SECS: u64 = 24 * 60 * 60;

#[derive(Error, Debug)]
pub enum QueueError {
  #[error("Sync queue storage is unavailable")]
  StoreUnavailable,

  #[error("Sync queue storage error: {0}")]
  Store(String),

  #[error("No matching queued item: {0}")]
  NotFound(String),

  #[error("Failed to serialize payload: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for QueueError {
  fn from(e: rusqlite::Error) -> Self {
    QueueError::Store(e.to_string())
  }
}

/// What a drain pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Acknowledged and removed
  pub succeeded: usize,
  /// Failed transiently, still pending
  pub retrying: usize,
  /// Marked failed in this pass
  pub failed: usize,
  /// Left for a later pass without an attempt
  pub deferred: usize,
}

impl DrainReport {
  pub fn attempted(&self) -> usize {
    self.succeeded + self.retrying + self.failed
  }

  fn merge(&mut self, other: DrainReport) {
    self.succeeded += other.succeeded;
    self.retrying += other.retrying;
    self.failed += other.failed;
    self.deferred += other.deferred;
  }
}

struct Inner {
  store: Option<SqliteQueueStore>,
  replayer: Arc<dyn Replayer>,
  events: broadcast::Sender<QueueEvent>,
  drain_lock: Mutex<()>,
  max_retries: u32,
  backoff: Duration,
}

/// Handle to the mutation queue. Clones share the same queue.
#[derive(Clone)]
pub struct MutationQueue {
  inner: Arc<Inner>,
}

impl MutationQueue {
  pub fn new(store: SqliteQueueStore, replayer: Arc<dyn Replayer>, config: &QueueConfig) -> Self {
    Self::build(Some(store), replayer, config)
  }

  /// A queue without storage. Writes cannot be queued and are surfaced to
  /// the caller as failures instead.
  pub fn unavailable(replayer: Arc<dyn Replayer>, config: &QueueConfig) -> Self {
    Self::build(None, replayer, config)
  }

  /// Open the queue database, degrading to [`MutationQueue::unavailable`]
  /// if it cannot be opened.
  pub fn open(path: &Path, replayer: Arc<dyn Replayer>, config: &QueueConfig) -> Self {
    match SqliteQueueStore::open(path) {
      Ok(store) => Self::new(store, replayer, config),
      Err(e) => {
        warn!(path = %path.display(), error = %e, "sync queue unavailable, writes will not be queued");
        Self::unavailable(replayer, config)
      }
    }
  }

  fn build(store: Option<SqliteQueueStore>, replayer: Arc<dyn Replayer>, config: &QueueConfig) -> Self {
    let (events, _) = broadcast::channel(256);
    Self {
      inner: Arc::new(Inner {
        store,
        replayer,
        events,
        drain_lock: Mutex::new(()),
        max_retries: config.max_retries.max(1),
        backoff: Duration::seconds(config.retry_backoff_secs.min(MAX_BACKOFF_SECS) as i64),
      }),
    }
  }

  pub fn is_persistent(&self) -> bool {
    self.inner.store.is_some()
  }

  pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
    self.inner.events.subscribe()
  }

  fn store(&self) -> Result<&SqliteQueueStore, QueueError> {
    self.inner.store.as_ref().ok_or(QueueError::StoreUnavailable)
  }

  fn emit(&self, event: QueueEvent) {
    let _ = self.inner.events.send(event);
  }

  /// Persist a mutation and return its id.
  pub fn enqueue(&self, action: ActionKind, payload: Value) -> Result<String, QueueError> {
    let store = self.store()?;
    let id = uuid::Uuid::now_v7().to_string();
    store.insert(&id, action, &payload, self.inner.max_retries, Utc::now())?;
    info!(id = %id, action = %action, "mutation queued");
    self.emit(QueueEvent::Enqueued {
      id: id.clone(),
      action,
    });
    Ok(id)
  }

  /// Replay everything pending at the start of the pass.
  ///
  /// Passes never overlap: a caller arriving during a pass waits for it and
  /// then runs its own.
  pub async fn drain(&self) -> Result<DrainReport, QueueError> {
    let Some(store) = self.inner.store.as_ref() else {
      return Ok(DrainReport::default());
    };
    let _pass = self.inner.drain_lock.lock().await;

    let Some(max_seq) = store.max_seq()? else {
      return Ok(DrainReport::default());
    };

    let mut by_kind: BTreeMap<ActionKind, Vec<SyncItem>> = BTreeMap::new();
    for item in store.pending_up_to(max_seq)? {
      by_kind.entry(item.action).or_default().push(item);
    }
    if by_kind.is_empty() {
      return Ok(DrainReport::default());
    }

    let results = join_all(
      by_kind
        .into_values()
        .map(|items| self.drain_kind(store, items)),
    )
    .await;

    let mut report = DrainReport::default();
    for result in results {
      report.merge(result?);
    }
    if report.attempted() > 0 {
      info!(
        succeeded = report.succeeded,
        retrying = report.retrying,
        failed = report.failed,
        deferred = report.deferred,
        "sync queue drained"
      );
    }
    Ok(report)
  }

  /// Replay one kind's items strictly in order.
  async fn drain_kind(
    &self,
    store: &SqliteQueueStore,
    items: Vec<SyncItem>,
  ) -> Result<DrainReport, QueueError> {
    let mut report = DrainReport::default();
    let mut items = items.into_iter();

    while let Some(item) = items.next() {
      if !item.is_due(Utc::now()) {
        debug!(id = %item.id, action = %item.action, "head item backing off");
        report.deferred += 1 + items.len();
        break;
      }

      match self.inner.replayer.replay(&item).await {
        Ok(()) => {
          store.delete(&item.id)?;
          report.succeeded += 1;
          self.emit(QueueEvent::Succeeded {
            id: item.id,
            action: item.action,
          });
        }
        Err(ReplayError::Transient(error)) => {
          let Some(updated) =
            store.record_failure(&item.id, &error, self.inner.backoff, Utc::now())?
          else {
            // Removed while in flight
            continue;
          };

          if updated.status == ItemStatus::Failed {
            warn!(
              id = %updated.id,
              action = %updated.action,
              attempts = updated.retry_count,
              error = %error,
              "mutation failed permanently"
            );
            report.failed += 1;
            self.emit(QueueEvent::FailedPermanently {
              id: updated.id,
              action: updated.action,
              reason: format!("gave up after {} attempts: {}", updated.retry_count, error),
            });
          } else {
            debug!(id = %updated.id, retry_count = updated.retry_count, error = %error, "will retry");
            report.retrying += 1;
            report.deferred += items.len();
            self.emit(QueueEvent::Retrying {
              id: updated.id,
              action: updated.action,
              retry_count: updated.retry_count,
              error,
            });
            break;
          }
        }
        Err(ReplayError::Rejected(reason)) => {
          store.mark_failed(&item.id, &reason)?;
          warn!(id = %item.id, action = %item.action, reason = %reason, "mutation rejected");
          report.failed += 1;
          self.emit(QueueEvent::FailedPermanently {
            id: item.id,
            action: item.action,
            reason,
          });
        }
      }
    }

    Ok(report)
  }

  /// Every queued item, pending and failed, in enqueue order.
  pub fn list(&self) -> Result<Vec<SyncItem>, QueueError> {
    self.store()?.list()
  }

  pub fn pending_count(&self) -> Result<usize, QueueError> {
    self.store()?.count(ItemStatus::Pending)
  }

  pub fn failed(&self) -> Result<Vec<SyncItem>, QueueError> {
    Ok(
      self
        .list()?
        .into_iter()
        .filter(|item| item.status == ItemStatus::Failed)
        .collect(),
    )
  }

  /// Give a failed item a fresh retry budget.
  pub fn retry(&self, id: &str) -> Result<SyncItem, QueueError> {
    let item = self
      .store()?
      .reset(id)?
      .ok_or_else(|| QueueError::NotFound(format!("no failed item {}", id)))?;
    info!(id = %id, "failed mutation requeued");
    Ok(item)
  }

  /// Drop a failed item for good.
  pub fn dismiss(&self, id: &str) -> Result<(), QueueError> {
    if self.store()?.delete_failed(id)? {
      info!(id = %id, "failed mutation dismissed");
      Ok(())
    } else {
      Err(QueueError::NotFound(format!("no failed item {}", id)))
    }
  }
}
