use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::{Category, PartitionLimits};
use crate::db::Database;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub backend: BackendConfig,
  pub cache: CacheConfig,
  pub queue: QueueConfig,
  /// Where the cache and queue databases live (defaults to the XDG data dir)
  pub data_dir: Option<PathBuf>,
  /// Also write logs to a daily rolling file in the data directory
  pub log_to_file: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
  /// Origin the client talks to; relative request paths resolve against it
  pub base_url: String,
  pub timeout_secs: u64,
  /// Path probed to derive the reachability signal
  pub health_path: String,
  /// Seconds between reachability probes (0 disables probing)
  pub probe_interval_secs: u64,
}

impl Default for BackendConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:8080/".to_string(),
      timeout_secs: 10,
      health_path: "/api/health".to_string(),
      probe_interval_secs: 15,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Disable to run every read straight against the network
  pub enabled: bool,
  /// Product prefix embedded in every partition name
  pub prefix: String,
  /// Schema version embedded in every partition name
  pub version: String,
  /// Storage quota for all partitions together
  pub quota_bytes: u64,
  pub sweep_interval_secs: u64,
  /// Usage percentage above which pre-caching first purges purgeable partitions
  pub pressure_percent: f64,
  /// Assets fetched into the static partition at install time
  pub precache: Vec<String>,
  /// App-shell paths that are only ever served from cache
  pub shell: Vec<String>,
  /// Document served for navigations when neither network nor cache answers
  pub offline_page: String,
  /// Per-category overrides of the default partition limits
  pub partitions: BTreeMap<Category, PartitionLimits>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      prefix: "innkeep".to_string(),
      version: "v1".to_string(),
      quota_bytes: 50 * 1024 * 1024,
      sweep_interval_secs: 300,
      pressure_percent: 90.0,
      precache: vec![
        "/app-shell.html".to_string(),
        "/offline.html".to_string(),
        "/manifest.json".to_string(),
      ],
      shell: vec!["/app-shell.html".to_string(), "/offline.html".to_string()],
      offline_page: "/offline.html".to_string(),
      partitions: BTreeMap::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  pub max_retries: u32,
  /// Seconds between periodic drains while online
  pub drain_interval_secs: u64,
  /// Base of the exponential backoff between attempts (0 disables backoff)
  pub retry_backoff_secs: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      drain_interval_secs: 30,
      retry_backoff_secs: 2,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./innkeep.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/innkeep/config.yaml
  ///
  /// Falls back to defaults when no file exists. `INNKEEP_BASE_URL`
  /// overrides the backend origin either way.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    if let Ok(url) = std::env::var("INNKEEP_BASE_URL") {
      config.backend.base_url = url;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("innkeep.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("innkeep").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    self.base_url()?;
    if self.cache.prefix.is_empty() || self.cache.prefix.contains('-') {
      return Err(eyre!(
        "cache.prefix must be non-empty and must not contain '-': {:?}",
        self.cache.prefix
      ));
    }
    if self.cache.version.is_empty() || self.cache.version.contains('-') {
      return Err(eyre!(
        "cache.version must be non-empty and must not contain '-': {:?}",
        self.cache.version
      ));
    }
    Ok(())
  }

  /// Parsed backend origin.
  pub fn base_url(&self) -> Result<Url> {
    Url::parse(&self.backend.base_url)
      .map_err(|e| eyre!("Invalid backend.base_url {:?}: {}", self.backend.base_url, e))
  }

  pub fn data_dir(&self) -> Result<PathBuf> {
    match &self.data_dir {
      Some(dir) => Ok(dir.clone()),
      None => Database::default_dir(),
    }
  }

  pub fn cache_db_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("cache.db"))
  }

  pub fn queue_db_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("queue.db"))
  }
}
