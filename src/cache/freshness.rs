//! Freshness lifetime of cached responses.
//!
//! The same computation is used when serving an entry and when the sweep
//! decides whether to evict it.

use chrono::{DateTime, Duration, Utc};

use super::partition::PartitionLimits;
use super::storage::EntryMeta;
use super::traits::CacheEntry;
use crate::net::Headers;

/// Lifetime used when neither the response nor the route declares one.
pub const DEFAULT_LIFETIME_SECS: i64 = 5 * 60;

/// Upper bound for any lifetime, well inside what `Duration` can hold.
pub const MAX_LIFETIME_SECS: i64 = 100 * 365 * 24 * 60 * 60;

fn seconds(secs: i64) -> Duration {
  Duration::seconds(secs.clamp(0, MAX_LIFETIME_SECS))
}

fn unsigned_seconds(secs: u64) -> Duration {
  seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

/// Lifetime declared by response headers, if any.
///
/// `cache-control` wins over `expires`. `no-store` and `no-cache` declare a
/// zero lifetime: the entry may still serve as a stale fallback.
pub fn declared_lifetime(headers: &Headers, cached_at: DateTime<Utc>) -> Option<Duration> {
  if let Some(cc) = headers.get("cache-control") {
    let mut max_age = None;
    for directive in cc.split(',').map(|d| d.trim().to_ascii_lowercase()) {
      if directive == "no-store" || directive == "no-cache" {
        return Some(Duration::zero());
      }
      if let Some(value) = directive.strip_prefix("max-age=") {
        let value = value.trim_matches('"');
        // Digits too large for i64 still mean "a very long time"
        max_age = value.parse::<i64>().ok().or_else(|| {
          (!value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())).then_some(i64::MAX)
        });
      }
    }
    if let Some(secs) = max_age {
      return Some(seconds(secs));
    }
  }

  let expires = headers.get("expires").and_then(parse_http_date)?;
  let origin = headers
    .get("date")
    .and_then(parse_http_date)
    .unwrap_or(cached_at);
  Some((expires - origin).max(Duration::zero()))
}

fn compute(
  headers: &Headers,
  cached_at: DateTime<Utc>,
  default_ttl_secs: Option<u64>,
  limits: &PartitionLimits,
) -> Duration {
  let declared = declared_lifetime(headers, cached_at).unwrap_or_else(|| {
    default_ttl_secs
      .map(unsigned_seconds)
      .unwrap_or_else(|| seconds(DEFAULT_LIFETIME_SECS))
  });
  declared.min(unsigned_seconds(limits.max_age_secs))
}

/// Full lifetime of an entry in a partition.
pub fn lifetime(entry: &CacheEntry, limits: &PartitionLimits) -> Duration {
  compute(
    &entry.response.headers,
    entry.cached_at,
    entry.default_ttl_secs,
    limits,
  )
}

pub fn is_fresh(entry: &CacheEntry, limits: &PartitionLimits, now: DateTime<Utc>) -> bool {
  now - entry.cached_at < lifetime(entry, limits)
}

/// Same as [`is_fresh`], for body-less metadata read by the sweep.
pub fn meta_is_fresh(meta: &EntryMeta, limits: &PartitionLimits, now: DateTime<Utc>) -> bool {
  now - meta.cached_at < compute(&meta.headers, meta.cached_at, meta.default_ttl_secs, limits)
}

fn parse_http_date(s: &str) -> Option<DateTime<Utc>> {
  DateTime::parse_from_rfc2822(s.trim())
    .ok()
    .map(|dt| dt.with_timezone(&Utc))
}
