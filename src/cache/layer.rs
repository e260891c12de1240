//! Strategy engine: executes the read strategies against the cache
//! partitions and the network.

use chrono::Utc;
use futures::future::join_all;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::freshness::{is_fresh, meta_is_fresh};
use super::key::cache_key;
use super::partition::{Category, Partition, PartitionSet};
use super::routes::{RouteMatch, RouteTable};
use super::storage::{CacheStorage, QuotaEstimate, StorageError};
use super::traits::{CacheEntry, CacheResult, Strategy};
use crate::connectivity::Connectivity;
use crate::net::{FetchError, Method, Network, Request, Response};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
  #[error(transparent)]
  Network(#[from] FetchError),

  #[error("Not in cache")]
  CacheMiss,

  #[error(transparent)]
  Storage(#[from] StorageError),
}

/// Storage conditions the UI has to know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageAlert {
  /// A partition was cleared to make room.
  Purged { partition: String, removed: usize },
  /// A write could not be stored and the partition may not be cleared
  /// automatically.
  NeedsAttention { partition: String, reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
  pub expired: usize,
  pub trimmed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PrecacheReport {
  pub stored: Vec<String>,
  pub failed: Vec<(String, String)>,
}

impl PrecacheReport {
  pub fn is_complete(&self) -> bool {
    self.failed.is_empty()
  }
}

/// Executes read strategies.
///
/// Cloning is cheap and clones share storage, network and the set of
/// pending background revalidations.
#[derive(Clone)]
pub struct StrategyEngine {
  storage: Arc<dyn CacheStorage>,
  network: Arc<dyn Network>,
  partitions: Arc<PartitionSet>,
  routes: Arc<RouteTable>,
  connectivity: Connectivity,
  alerts: broadcast::Sender<StorageAlert>,
  revalidations: Arc<Mutex<Vec<JoinHandle<()>>>>,
  pressure_percent: f64,
}

impl StrategyEngine {
  pub fn new(
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    partitions: PartitionSet,
    routes: RouteTable,
    connectivity: Connectivity,
  ) -> Self {
    let (alerts, _) = broadcast::channel(64);
    Self {
      storage,
      network,
      partitions: Arc::new(partitions),
      routes: Arc::new(routes),
      connectivity,
      alerts,
      revalidations: Arc::new(Mutex::new(Vec::new())),
      pressure_percent: 90.0,
    }
  }

  /// Usage percentage above which pre-caching first frees space.
  pub fn with_pressure_percent(mut self, percent: f64) -> Self {
    self.pressure_percent = percent;
    self
  }

  pub fn partitions(&self) -> &PartitionSet {
    &self.partitions
  }

  pub fn subscribe_alerts(&self) -> broadcast::Receiver<StorageAlert> {
    self.alerts.subscribe()
  }

  pub fn classify(&self, request: &Request) -> RouteMatch {
    self.routes.classify(request)
  }

  /// Classify and execute in one step.
  pub async fn handle(&self, request: &Request) -> Result<CacheResult<Response>, EngineError> {
    let route = self.classify(request);
    self.execute(request, &route).await
  }

  /// Run the route's strategy for a request.
  pub async fn execute(
    &self,
    request: &Request,
    route: &RouteMatch,
  ) -> Result<CacheResult<Response>, EngineError> {
    let partition = match route.category {
      Some(category) => self.partitions.get(category),
      None => return self.network_only(request).await,
    };

    debug!(
      url = %request.url,
      route = route.name,
      strategy = %route.strategy,
      partition = %partition.name,
      "executing strategy"
    );

    let mut result = match route.strategy {
      Strategy::CacheFirst => self.cache_first(request, partition, route).await,
      Strategy::NetworkFirst => self.network_first(request, partition, route).await,
      Strategy::StaleWhileRevalidate => {
        self
          .stale_while_revalidate(request, partition, route)
          .await
      }
      Strategy::NetworkOnly => self.network_only(request).await,
      Strategy::CacheOnly => self.cache_only(request, partition),
    }?;

    // HEAD shares the GET entry but never carries its body
    if request.method == Method::Head {
      result.data.body.clear();
    }
    Ok(result)
  }

  /// Fetch a single entry without running any strategy.
  pub fn lookup(&self, category: Category, request: &Request) -> Option<CacheEntry> {
    self.read(self.partitions.get(category), &cache_key(request))
  }

  async fn cache_first(
    &self,
    request: &Request,
    partition: &Partition,
    route: &RouteMatch,
  ) -> Result<CacheResult<Response>, EngineError> {
    let key = cache_key(request);
    let cached = self.read(partition, &key);

    if let Some(entry) = &cached {
      if is_fresh(entry, &partition.limits, Utc::now()) {
        return Ok(CacheResult::from_cache(
          entry.response.clone(),
          entry.cached_at,
          false,
        ));
      }
    }

    match self.fetch_network(request).await {
      Ok(response) => {
        self.store_logged(partition, &key, request, &response, route.default_ttl_secs);
        Ok(CacheResult::from_network(response))
      }
      // Better stale than absent
      Err(e) => match cached {
        Some(entry) => Ok(self.fallback_result(entry, partition, &e)),
        None => Err(e.into()),
      },
    }
  }

  async fn network_first(
    &self,
    request: &Request,
    partition: &Partition,
    route: &RouteMatch,
  ) -> Result<CacheResult<Response>, EngineError> {
    let key = cache_key(request);

    match self.fetch_network(request).await {
      Ok(response) => {
        self.store_logged(partition, &key, request, &response, route.default_ttl_secs);
        Ok(CacheResult::from_network(response))
      }
      Err(e) => match self.read(partition, &key) {
        Some(entry) => Ok(self.fallback_result(entry, partition, &e)),
        None => Err(e.into()),
      },
    }
  }

  async fn stale_while_revalidate(
    &self,
    request: &Request,
    partition: &Partition,
    route: &RouteMatch,
  ) -> Result<CacheResult<Response>, EngineError> {
    let key = cache_key(request);

    match self.read(partition, &key) {
      Some(entry) => {
        if self.connectivity.is_online() {
          self.spawn_revalidation(request.clone(), partition.clone(), key, route.default_ttl_secs);
          let stale = !is_fresh(&entry, &partition.limits, Utc::now());
          Ok(CacheResult::from_cache(entry.response, entry.cached_at, stale))
        } else {
          Ok(CacheResult::offline(entry.response, entry.cached_at))
        }
      }
      None => {
        let response = self.fetch_network(request).await?;
        self.store_logged(partition, &key, request, &response, route.default_ttl_secs);
        Ok(CacheResult::from_network(response))
      }
    }
  }

  async fn network_only(&self, request: &Request) -> Result<CacheResult<Response>, EngineError> {
    let response = self.fetch_network(request).await?;
    Ok(CacheResult::from_network(response))
  }

  fn cache_only(
    &self,
    request: &Request,
    partition: &Partition,
  ) -> Result<CacheResult<Response>, EngineError> {
    match self.read(partition, &cache_key(request)) {
      Some(entry) => {
        let stale = !is_fresh(&entry, &partition.limits, Utc::now());
        Ok(CacheResult::from_cache(entry.response, entry.cached_at, stale))
      }
      None => Err(EngineError::CacheMiss),
    }
  }

  fn fallback_result(
    &self,
    entry: CacheEntry,
    partition: &Partition,
    error: &FetchError,
  ) -> CacheResult<Response> {
    debug!(url = %entry.url, error = %error, "network failed, serving cached entry");
    if *error == FetchError::Offline {
      CacheResult::offline(entry.response, entry.cached_at)
    } else {
      let stale = !is_fresh(&entry, &partition.limits, Utc::now());
      CacheResult::from_cache(entry.response, entry.cached_at, stale)
    }
  }

  fn spawn_revalidation(
    &self,
    request: Request,
    partition: Partition,
    key: String,
    default_ttl_secs: Option<u64>,
  ) {
    let engine = self.clone();
    let handle = tokio::spawn(async move {
      match engine.fetch_network(&request).await {
        Ok(response) => {
          engine.store_logged(&partition, &key, &request, &response, default_ttl_secs);
          debug!(url = %request.url, "revalidated");
        }
        Err(e) => debug!(url = %request.url, error = %e, "revalidation failed"),
      }
    });

    if let Ok(mut pending) = self.revalidations.lock() {
      pending.retain(|h| !h.is_finished());
      pending.push(handle);
    }
  }

  /// Wait until every background revalidation started so far has finished.
  pub async fn settle(&self) {
    loop {
      let pending = match self.revalidations.lock() {
        Ok(mut pending) => std::mem::take(&mut *pending),
        Err(_) => return,
      };
      if pending.is_empty() {
        return;
      }
      for handle in pending {
        let _ = handle.await;
      }
    }
  }

  async fn fetch_network(&self, request: &Request) -> Result<Response, FetchError> {
    if !self.connectivity.is_online() {
      return Err(FetchError::Offline);
    }
    self.network.fetch(request).await
  }

  fn read(&self, partition: &Partition, key: &str) -> Option<CacheEntry> {
    match self.storage.get(&partition.name, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(partition = %partition.name, error = %e, "cache read failed, treating as miss");
        None
      }
    }
  }

  fn store_logged(
    &self,
    partition: &Partition,
    key: &str,
    request: &Request,
    response: &Response,
    default_ttl_secs: Option<u64>,
  ) {
    if let Err(e) = self.store(partition, key, request, response, default_ttl_secs) {
      warn!(partition = %partition.name, url = %request.url, error = %e, "response not cached");
    }
  }

  /// Store a successful response, applying the partition's quota policy.
  ///
  /// Returns `Ok(false)` when the response is not cacheable.
  fn store(
    &self,
    partition: &Partition,
    key: &str,
    request: &Request,
    response: &Response,
    default_ttl_secs: Option<u64>,
  ) -> Result<bool, StorageError> {
    if !response.is_success() || request.method != Method::Get {
      return Ok(false);
    }

    let entry = CacheEntry {
      key: key.to_string(),
      url: request.url.to_string(),
      response: response.clone(),
      cached_at: Utc::now(),
      default_ttl_secs,
    };

    match self.storage.put(partition, &entry) {
      Ok(()) => Ok(true),
      Err(StorageError::QuotaExceeded { .. }) if partition.limits.purge_on_quota_error => {
        let removed = self.storage.clear(&partition.name)?;
        warn!(partition = %partition.name, removed, "quota exceeded, partition purged");
        self.alert(StorageAlert::Purged {
          partition: partition.name.clone(),
          removed,
        });

        // One retry against the now-empty partition
        match self.storage.put(partition, &entry) {
          Ok(()) => Ok(true),
          Err(e) => {
            self.alert(StorageAlert::NeedsAttention {
              partition: partition.name.clone(),
              reason: e.to_string(),
            });
            Err(e)
          }
        }
      }
      Err(e @ StorageError::QuotaExceeded { .. }) => {
        warn!(partition = %partition.name, error = %e, "quota exceeded on protected partition");
        self.alert(StorageAlert::NeedsAttention {
          partition: partition.name.clone(),
          reason: e.to_string(),
        });
        Err(e)
      }
      Err(e) => Err(e),
    }
  }

  fn alert(&self, alert: StorageAlert) {
    // No subscribers is fine
    let _ = self.alerts.send(alert);
  }

  /// Eagerly fetch assets into the static partition.
  pub async fn precache(&self, base: &Url, hrefs: &[String]) -> PrecacheReport {
    if let Err(e) = self.relieve_pressure(self.pressure_percent) {
      warn!(error = %e, "could not check storage pressure before pre-caching");
    }

    let partition = self.partitions.get(Category::Static);
    let results = join_all(hrefs.iter().map(|href| async move {
      let outcome = self.precache_one(base, href, partition).await;
      (href.clone(), outcome)
    }))
    .await;

    let mut report = PrecacheReport::default();
    for (href, outcome) in results {
      match outcome {
        Ok(()) => report.stored.push(href),
        Err(e) => {
          warn!(url = %href, error = %e, "pre-cache failed");
          report.failed.push((href, e));
        }
      }
    }
    info!(
      stored = report.stored.len(),
      failed = report.failed.len(),
      "pre-cache finished"
    );
    report
  }

  async fn precache_one(&self, base: &Url, href: &str, partition: &Partition) -> Result<(), String> {
    let request = Request::resolve(Method::Get, base, href).map_err(|e| e.to_string())?;
    let response = self
      .fetch_network(&request)
      .await
      .map_err(|e| e.to_string())?;
    if !response.is_success() {
      return Err(format!("HTTP {}", response.status));
    }
    self
      .store(partition, &cache_key(&request), &request, &response, None)
      .map_err(|e| e.to_string())?;
    Ok(())
  }

  /// Remove expired entries in every partition and enforce entry counts.
  pub fn sweep(&self) -> Result<SweepReport, StorageError> {
    let now = Utc::now();
    let mut report = SweepReport::default();

    for partition in self.partitions.iter() {
      let expired: Vec<String> = self
        .storage
        .list_meta(&partition.name)?
        .into_iter()
        .filter(|meta| !meta_is_fresh(meta, &partition.limits, now))
        .map(|meta| meta.key)
        .collect();

      if !expired.is_empty() {
        report.expired += self.storage.delete_keys(&partition.name, &expired)?;
      }
      report.trimmed += self.storage.trim(partition)?;
    }

    if report.expired > 0 || report.trimmed > 0 {
      info!(expired = report.expired, trimmed = report.trimmed, "cache sweep");
    }
    Ok(report)
  }

  pub fn estimate(&self) -> Result<QuotaEstimate, StorageError> {
    self.storage.estimate()
  }

  /// Clear purgeable partitions, least critical first, until usage drops
  /// below `threshold_percent`. Protected partitions are never touched.
  pub fn relieve_pressure(&self, threshold_percent: f64) -> Result<Vec<String>, StorageError> {
    let mut estimate = self.storage.estimate()?;
    let mut purged = Vec::new();

    for partition in self.partitions.purge_order() {
      if estimate.percentage < threshold_percent {
        break;
      }
      let removed = self.storage.clear(&partition.name)?;
      warn!(partition = %partition.name, removed, "storage pressure, partition purged");
      self.alert(StorageAlert::Purged {
        partition: partition.name.clone(),
        removed,
      });
      purged.push(partition.name.clone());
      estimate = self.storage.estimate()?;
    }

    if estimate.percentage >= threshold_percent {
      warn!(percentage = estimate.percentage, "storage still under pressure after purging");
    }
    Ok(purged)
  }

  /// Drop partitions of other releases and register the current ones.
  pub fn activate_partitions(&self) -> Result<Vec<String>, StorageError> {
    let mut removed = Vec::new();
    for name in self.storage.partitions()? {
      if self.partitions.is_outdated(&name) {
        let entries = self.storage.drop_partition(&name)?;
        info!(partition = %name, entries, "removed outdated partition");
        removed.push(name);
      }
    }
    for partition in self.partitions.iter() {
      self.storage.ensure_partition(&partition.name)?;
    }
    Ok(removed)
  }
}
