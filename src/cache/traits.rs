//! Core types for the caching system.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::net::Response;

/// Read policy applied to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
  NetworkOnly,
  CacheOnly,
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Strategy::CacheFirst => "cache-first",
      Strategy::NetworkFirst => "network-first",
      Strategy::StaleWhileRevalidate => "stale-while-revalidate",
      Strategy::NetworkOnly => "network-only",
      Strategy::CacheOnly => "cache-only",
    };
    f.write_str(s)
  }
}

/// A stored response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  /// Normalized request key
  pub key: String,
  /// Request URL, kept for inspection
  pub url: String,
  pub response: Response,
  /// When the entry was inserted
  pub cached_at: DateTime<Utc>,
  /// Route-assigned lifetime used when the response declares none
  pub default_ttl_secs: Option<u64>,
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  pub fn is_from_cache(&self) -> bool {
    self.source != CacheSource::Network
  }
}

/// Indicates where served data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, stale but served anyway (revalidating or as a fallback)
  CacheStale,
  /// Network unavailable, serving cached data
  Offline,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      CacheSource::Network => "network",
      CacheSource::CacheFresh => "cache-fresh",
      CacheSource::CacheStale => "cache-stale",
      CacheSource::Offline => "offline",
    }
  }
}
