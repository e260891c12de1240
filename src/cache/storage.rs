//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use super::partition::Partition;
use super::traits::CacheEntry;
use crate::db::Database;
use crate::net::{Headers, Response};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
  #[error("Storage quota exceeded writing to {partition}: need {needed} bytes, {available} available")]
  QuotaExceeded {
    partition: String,
    needed: u64,
    available: u64,
  },

  #[error("Cache storage error: {0}")]
  Backend(String),
}

impl From<rusqlite::Error> for StorageError {
  fn from(e: rusqlite::Error) -> Self {
    StorageError::Backend(e.to_string())
  }
}

/// Storage usage as reported by the quota API.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QuotaEstimate {
  pub used: u64,
  pub available: u64,
  pub percentage: f64,
}

impl QuotaEstimate {
  pub fn new(used: u64, quota: u64) -> Self {
    let percentage = if quota == 0 {
      100.0
    } else {
      used as f64 / quota as f64 * 100.0
    };
    Self {
      used,
      available: quota.saturating_sub(used),
      percentage,
    }
  }
}

/// Entry metadata without the body, for sweeps.
#[derive(Debug, Clone)]
pub struct EntryMeta {
  pub key: String,
  pub headers: Headers,
  pub cached_at: DateTime<Utc>,
  pub default_ttl_secs: Option<u64>,
}

/// Trait for cache storage backends.
///
/// Every method is atomic with respect to the others: an entry is never
/// observed half-written.
pub trait CacheStorage: Send + Sync {
  /// Register a partition name.
  fn ensure_partition(&self, name: &str) -> Result<(), StorageError>;

  /// Names of all partitions present in storage.
  fn partitions(&self) -> Result<Vec<String>, StorageError>;

  /// Remove a partition and all its entries. Returns the number of entries removed.
  fn drop_partition(&self, name: &str) -> Result<usize, StorageError>;

  fn get(&self, partition: &str, key: &str) -> Result<Option<CacheEntry>, StorageError>;

  /// Insert or replace an entry, then trim the partition to its maximum
  /// entry count, oldest insertions first.
  fn put(&self, partition: &Partition, entry: &CacheEntry) -> Result<(), StorageError>;

  fn list_meta(&self, partition: &str) -> Result<Vec<EntryMeta>, StorageError>;

  fn delete_keys(&self, partition: &str, keys: &[String]) -> Result<usize, StorageError>;

  /// Enforce the maximum entry count, oldest insertions first.
  fn trim(&self, partition: &Partition) -> Result<usize, StorageError>;

  /// Remove every entry of a partition, keeping the partition itself.
  fn clear(&self, partition: &str) -> Result<usize, StorageError>;

  fn estimate(&self) -> Result<QuotaEstimate, StorageError>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn ensure_partition(&self, _name: &str) -> Result<(), StorageError> {
    Ok(())
  }

  fn partitions(&self) -> Result<Vec<String>, StorageError> {
    Ok(Vec::new())
  }

  fn drop_partition(&self, _name: &str) -> Result<usize, StorageError> {
    Ok(0)
  }

  fn get(&self, _partition: &str, _key: &str) -> Result<Option<CacheEntry>, StorageError> {
    Ok(None) // Always miss
  }

  fn put(&self, _partition: &Partition, _entry: &CacheEntry) -> Result<(), StorageError> {
    Ok(()) // Discard
  }

  fn list_meta(&self, _partition: &str) -> Result<Vec<EntryMeta>, StorageError> {
    Ok(Vec::new())
  }

  fn delete_keys(&self, _partition: &str, _keys: &[String]) -> Result<usize, StorageError> {
    Ok(0)
  }

  fn trim(&self, _partition: &Partition) -> Result<usize, StorageError> {
    Ok(0)
  }

  fn clear(&self, _partition: &str) -> Result<usize, StorageError> {
    Ok(0)
  }

  fn estimate(&self) -> Result<QuotaEstimate, StorageError> {
    Ok(QuotaEstimate::new(0, u64::MAX))
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  quota_bytes: u64,
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cache_entries (
    partition TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    default_ttl_secs INTEGER,
    size INTEGER NOT NULL,
    PRIMARY KEY (partition, cache_key),
    FOREIGN KEY (partition) REFERENCES cache_partitions(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_age
    ON cache_entries(partition, cached_at);
"#;

impl SqliteStorage {
  /// Open cache storage at the given path.
  pub fn open(path: &Path, quota_bytes: u64) -> color_eyre::Result<Self> {
    let db = Database::open(path, CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(db.into_conn()),
      quota_bytes,
    })
  }

  /// Private in-memory storage.
  pub fn open_in_memory(quota_bytes: u64) -> color_eyre::Result<Self> {
    let db = Database::open_in_memory(CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(db.into_conn()),
      quota_bytes,
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
    self
      .conn
      .lock()
      .map_err(|e| StorageError::Backend(format!("Lock poisoned: {}", e)))
  }

  fn used_bytes(conn: &Connection) -> Result<u64, StorageError> {
    let used: i64 = conn.query_row(
      "SELECT COALESCE(SUM(size), 0) FROM cache_entries",
      [],
      |row| row.get(0),
    )?;
    Ok(used.max(0) as u64)
  }

  fn trim_locked(conn: &Connection, partition: &Partition) -> Result<usize, StorageError> {
    let removed = conn.execute(
      "DELETE FROM cache_entries WHERE partition = ?1 AND cache_key IN (
         SELECT cache_key FROM cache_entries WHERE partition = ?1
         ORDER BY cached_at DESC, rowid DESC
         LIMIT -1 OFFSET ?2
       )",
      params![partition.name, partition.limits.max_entries as i64],
    )?;
    Ok(removed)
  }
}

fn entry_size(entry: &CacheEntry, headers_json: &str) -> u64 {
  (entry.key.len() + entry.url.len() + headers_json.len() + entry.response.body.len()) as u64
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
  ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StorageError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StorageError::Backend(format!("Failed to parse datetime '{}': {}", s, e)))
}

fn parse_headers(s: &str) -> Result<Headers, StorageError> {
  serde_json::from_str(s)
    .map_err(|e| StorageError::Backend(format!("Failed to parse cached headers: {}", e)))
}

impl CacheStorage for SqliteStorage {
  fn ensure_partition(&self, name: &str) -> Result<(), StorageError> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR IGNORE INTO cache_partitions (name, created_at) VALUES (?, ?)",
      params![name, format_timestamp(&Utc::now())],
    )?;
    Ok(())
  }

  fn partitions(&self) -> Result<Vec<String>, StorageError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT name FROM cache_partitions ORDER BY name")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
  }

  fn drop_partition(&self, name: &str) -> Result<usize, StorageError> {
    let conn = self.lock()?;
    let tx = conn.unchecked_transaction()?;
    let removed = tx.execute("DELETE FROM cache_entries WHERE partition = ?", params![name])?;
    tx.execute("DELETE FROM cache_partitions WHERE name = ?", params![name])?;
    tx.commit()?;
    Ok(removed)
  }

  fn get(&self, partition: &str, key: &str) -> Result<Option<CacheEntry>, StorageError> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        "SELECT url, status, headers, body, cached_at, default_ttl_secs FROM cache_entries
         WHERE partition = ? AND cache_key = ?",
        params![partition, key],
        |row| {
          Ok((
            row.get::<_, String>(0)?,
            row.get::<_, u16>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Vec<u8>>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, Option<i64>>(5)?,
          ))
        },
      )
      .optional()?;

    match row {
      Some((url, status, headers, body, cached_at, ttl)) => Ok(Some(CacheEntry {
        key: key.to_string(),
        url,
        response: Response {
          status,
          headers: parse_headers(&headers)?,
          body,
        },
        cached_at: parse_timestamp(&cached_at)?,
        default_ttl_secs: ttl.map(|t| t.max(0) as u64),
      })),
      None => Ok(None),
    }
  }

  fn put(&self, partition: &Partition, entry: &CacheEntry) -> Result<(), StorageError> {
    let headers_json = serde_json::to_string(&entry.response.headers)
      .map_err(|e| StorageError::Backend(format!("Failed to serialize headers: {}", e)))?;
    let size = entry_size(entry, &headers_json);

    let conn = self.lock()?;
    let tx = conn.unchecked_transaction()?;

    let replaced: u64 = tx
      .query_row(
        "SELECT size FROM cache_entries WHERE partition = ? AND cache_key = ?",
        params![partition.name, entry.key],
        |row| row.get::<_, i64>(0),
      )
      .optional()?
      .map(|s| s.max(0) as u64)
      .unwrap_or(0);

    let used = Self::used_bytes(&tx)?;
    let available = self.quota_bytes.saturating_sub(used.saturating_sub(replaced));
    if size > available {
      return Err(StorageError::QuotaExceeded {
        partition: partition.name.clone(),
        needed: size,
        available,
      });
    }

    tx.execute(
      "INSERT OR IGNORE INTO cache_partitions (name, created_at) VALUES (?, ?)",
      params![partition.name, format_timestamp(&Utc::now())],
    )?;
    tx.execute(
      "INSERT OR REPLACE INTO cache_entries
         (partition, cache_key, url, status, headers, body, cached_at, default_ttl_secs, size)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        partition.name,
        entry.key,
        entry.url,
        entry.response.status,
        headers_json,
        entry.response.body,
        format_timestamp(&entry.cached_at),
        entry.default_ttl_secs.map(|t| i64::try_from(t).unwrap_or(i64::MAX)),
        size as i64,
      ],
    )?;
    Self::trim_locked(&tx, partition)?;
    tx.commit()?;

    Ok(())
  }

  fn list_meta(&self, partition: &str) -> Result<Vec<EntryMeta>, StorageError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT cache_key, headers, cached_at, default_ttl_secs FROM cache_entries
       WHERE partition = ? ORDER BY cached_at, rowid",
    )?;
    let rows = stmt
      .query_map(params![partition], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, Option<i64>>(3)?,
        ))
      })?
      .collect::<Result<Vec<_>, _>>()?;

    rows
      .into_iter()
      .map(|(key, headers, cached_at, ttl)| {
        Ok(EntryMeta {
          key,
          headers: parse_headers(&headers)?,
          cached_at: parse_timestamp(&cached_at)?,
          default_ttl_secs: ttl.map(|t| t.max(0) as u64),
        })
      })
      .collect()
  }

  fn delete_keys(&self, partition: &str, keys: &[String]) -> Result<usize, StorageError> {
    let conn = self.lock()?;
    let tx = conn.unchecked_transaction()?;
    let mut removed = 0;
    for key in keys {
      removed += tx.execute(
        "DELETE FROM cache_entries WHERE partition = ? AND cache_key = ?",
        params![partition, key],
      )?;
    }
    tx.commit()?;
    Ok(removed)
  }

  fn trim(&self, partition: &Partition) -> Result<usize, StorageError> {
    let conn = self.lock()?;
    Self::trim_locked(&conn, partition)
  }

  fn clear(&self, partition: &str) -> Result<usize, StorageError> {
    let conn = self.lock()?;
    let removed = conn.execute("DELETE FROM cache_entries WHERE partition = ?", params![partition])?;
    Ok(removed)
  }

  fn estimate(&self) -> Result<QuotaEstimate, StorageError> {
    let conn = self.lock()?;
    let used = Self::used_bytes(&conn)?;
    Ok(QuotaEstimate::new(used, self.quota_bytes))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::partition::{Category, PartitionLimits};
  use chrono::Duration;

  fn partition(max_entries: usize) -> Partition {
    Partition {
      name: "innkeep-api-v1".to_string(),
      category: Category::Api,
      limits: PartitionLimits {
        max_entries,
        max_age_secs: 3600,
        purge_on_quota_error: true,
      },
    }
  }

  fn entry(key: &str, body: &str, age_secs: i64) -> CacheEntry {
    CacheEntry {
      key: key.to_string(),
      url: format!("https://stay.example.com/{}", key),
      response: Response::new(200, body).with_header("content-type", "text/plain"),
      cached_at: Utc::now() - Duration::seconds(age_secs),
      default_ttl_secs: Some(60),
    }
  }

  #[test]
  fn test_put_get_roundtrip() {
    let storage = SqliteStorage::open_in_memory(1 << 20).unwrap();
    let p = partition(10);
    let e = entry("a", "hello", 0);
    storage.put(&p, &e).unwrap();

    let got = storage.get(&p.name, "a").unwrap().unwrap();
    assert_eq!(got.response, e.response);
    assert_eq!(got.default_ttl_secs, Some(60));
    assert!(storage.get(&p.name, "missing").unwrap().is_none());
    assert_eq!(storage.partitions().unwrap(), vec![p.name.clone()]);

    let mut long = entry("b", "forever", 0);
    long.default_ttl_secs = Some(u64::MAX);
    storage.put(&p, &long).unwrap();
    let got = storage.get(&p.name, "b").unwrap().unwrap();
    assert_eq!(got.default_ttl_secs, Some(i64::MAX as u64));
  }

  #[test]
  fn test_replace_is_single_entry() {
    let storage = SqliteStorage::open_in_memory(1 << 20).unwrap();
    let p = partition(10);
    storage.put(&p, &entry("a", "one", 0)).unwrap();
    storage.put(&p, &entry("a", "two", 0)).unwrap();

    assert_eq!(storage.list_meta(&p.name).unwrap().len(), 1);
    assert_eq!(storage.get(&p.name, "a").unwrap().unwrap().response.text(), "two");
  }

  #[test]
  fn test_put_trims_oldest_first() {
    let storage = SqliteStorage::open_in_memory(1 << 20).unwrap();
    let p = partition(2);
    storage.put(&p, &entry("old", "x", 30)).unwrap();
    storage.put(&p, &entry("mid", "x", 20)).unwrap();
    storage.put(&p, &entry("new", "x", 10)).unwrap();

    let keys: Vec<String> = storage
      .list_meta(&p.name)
      .unwrap()
      .into_iter()
      .map(|m| m.key)
      .collect();
    assert_eq!(keys, vec!["mid".to_string(), "new".to_string()]);
  }

  #[test]
  fn test_quota_exceeded() {
    let storage = SqliteStorage::open_in_memory(200).unwrap();
    let p = partition(10);
    storage.put(&p, &entry("a", "small", 0)).unwrap();

    let big = entry("b", &"x".repeat(500), 0);
    match storage.put(&p, &big) {
      Err(StorageError::QuotaExceeded { partition, .. }) => assert_eq!(partition, p.name),
      other => panic!("expected quota error, got {:?}", other),
    }
    // Nothing half-written
    assert!(storage.get(&p.name, "b").unwrap().is_none());
    assert!(storage.get(&p.name, "a").unwrap().is_some());
  }

  #[test]
  fn test_estimate_and_clear() {
    let storage = SqliteStorage::open_in_memory(10_000).unwrap();
    let p = partition(10);
    storage.put(&p, &entry("a", "hello", 0)).unwrap();

    let estimate = storage.estimate().unwrap();
    assert!(estimate.used > 0);
    assert_eq!(estimate.used + estimate.available, 10_000);
    assert!(estimate.percentage > 0.0 && estimate.percentage < 100.0);

    assert_eq!(storage.clear(&p.name).unwrap(), 1);
    assert_eq!(storage.estimate().unwrap().used, 0);
    // Clearing keeps the partition registered
    assert_eq!(storage.partitions().unwrap().len(), 1);
  }

  #[test]
  fn test_drop_partition() {
    let storage = SqliteStorage::open_in_memory(10_000).unwrap();
    let p = partition(10);
    storage.put(&p, &entry("a", "hello", 0)).unwrap();
    assert_eq!(storage.drop_partition(&p.name).unwrap(), 1);
    assert!(storage.partitions().unwrap().is_empty());
  }
}
