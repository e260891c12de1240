use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

use crate::cache::{
  CacheStorage, NoopStorage, PartitionSet, RouteTable, SqliteStorage, StrategyEngine,
};
use crate::config::Config;
use crate::connectivity::Connectivity;
use crate::interceptor::Interceptor;
use crate::net::{HttpNetwork, Network};
use crate::queue::{HttpReplayer, MutationQueue};
use crate::runtime::{self, WorkerSettings, Workers};

/// How the layer is brought up.
#[derive(Debug, Clone, Copy, Default)]
pub struct Startup {
  /// Start in the offline state without probing the backend
  pub offline: bool,
  /// Fetch the configured assets during install
  pub precache: bool,
}

/// The assembled offline layer.
pub struct App {
  pub config: Config,
  pub network: Arc<dyn Network>,
  pub connectivity: Connectivity,
  pub interceptor: Arc<Interceptor>,
}

impl App {
  pub async fn new(config: Config, startup: Startup) -> Result<Self> {
    let base_url = config.base_url()?;
    let network: Arc<dyn Network> = Arc::new(
      HttpNetwork::new(&config).map_err(|e| eyre!("Failed to create HTTP client: {}", e))?,
    );

    let online = if startup.offline {
      false
    } else {
      match health_url(&config, &base_url) {
        Some(url) => runtime::probe(network.as_ref(), &url).await,
        None => true,
      }
    };
    info!(online, "initial connectivity");
    let connectivity = Connectivity::new(online);

    let storage = open_storage(&config);
    let engine = StrategyEngine::new(
      storage,
      network.clone(),
      PartitionSet::new(
        &config.cache.prefix,
        &config.cache.version,
        &config.cache.partitions,
      ),
      RouteTable::standard(&config.cache.shell),
      connectivity.clone(),
    )
    .with_pressure_percent(config.cache.pressure_percent);

    let queue = MutationQueue::open(
      &config.queue_db_path()?,
      Arc::new(HttpReplayer::new(network.clone())),
      &config.queue,
    );

    let precache = if startup.precache {
      config.cache.precache.clone()
    } else {
      Vec::new()
    };
    let interceptor = Interceptor::new(
      engine,
      queue,
      network.clone(),
      connectivity.clone(),
      base_url,
    )
    .with_precache(precache)
    .with_offline_page(config.cache.offline_page.clone());

    Ok(Self {
      config,
      network,
      connectivity,
      interceptor: Arc::new(interceptor),
    })
  }

  /// Install and activate so the interceptor serves requests.
  pub async fn start(&self) -> Result<()> {
    let report = self.interceptor.install().await?;
    for (href, error) in &report.failed {
      warn!(url = %href, error = %error, "asset not pre-cached");
    }
    let removed = self.interceptor.activate()?;
    if !removed.is_empty() {
      info!(partitions = ?removed, "removed partitions of previous releases");
    }
    Ok(())
  }

  pub fn engine(&self) -> &StrategyEngine {
    self.interceptor.engine()
  }

  pub fn queue(&self) -> &MutationQueue {
    self.interceptor.queue()
  }

  pub fn spawn_workers(&self) -> Result<Workers> {
    let base_url = self.config.base_url()?;
    let settings = WorkerSettings {
      sweep_interval: Duration::from_secs(self.config.cache.sweep_interval_secs),
      drain_interval: Duration::from_secs(self.config.queue.drain_interval_secs),
      probe_interval: Duration::from_secs(self.config.backend.probe_interval_secs),
      health_url: health_url(&self.config, &base_url),
    };
    Ok(Workers::spawn(
      self.engine().clone(),
      self.queue().clone(),
      self.connectivity.clone(),
      self.network.clone(),
      settings,
    ))
  }
}

fn health_url(config: &Config, base_url: &Url) -> Option<Url> {
  if config.backend.health_path.is_empty() {
    return None;
  }
  match base_url.join(&config.backend.health_path) {
    Ok(url) => Some(url),
    Err(e) => {
      warn!(path = %config.backend.health_path, error = %e, "invalid health path, probing disabled");
      None
    }
  }
}

/// Cache storage, or a no-op store when caching is disabled or the
/// database cannot be opened.
fn open_storage(config: &Config) -> Arc<dyn CacheStorage> {
  if !config.cache.enabled {
    info!("response caching disabled");
    return Arc::new(NoopStorage);
  }
  let opened = config
    .cache_db_path()
    .and_then(|path| SqliteStorage::open(&path, config.cache.quota_bytes));
  match opened {
    Ok(storage) => Arc::new(storage),
    Err(e) => {
      warn!(error = %e, "cache storage unavailable, continuing without a cache");
      Arc::new(NoopStorage)
    }
  }
}
