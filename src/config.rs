use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::CacheManifest;
use crate::remote::resolve_url;
use crate::routes::RouteRules;

/// Environment variable overriding `api.base_url`.
pub const API_URL_ENV: &str = "OFFSYNC_API_URL";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub api: ApiConfig,
  pub cache: CacheConfig,
  pub routes: RouteRules,
  pub sync: SyncConfig,
  pub storage: StorageConfig,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// Root of the file server; relative paths resolve against it
  pub base_url: String,
  /// Connect timeout for the HTTP client. Request timeouts are left to the server.
  pub connect_timeout_secs: Option<u64>,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:8080/".to_string(),
      connect_timeout_secs: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Deploy version of each cache tier
  pub versions: CacheManifest,
  /// Resources warmed into the static tier on install
  pub precache: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      versions: CacheManifest::default(),
      precache: [
        "/",
        "/index.html",
        "/manifest.json",
        "/icons/icon-192.png",
        "/icons/icon-512.png",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Path probed to detect connectivity
  pub probe_path: String,
  pub probe_interval_secs: u64,
  /// How often the queue badge count is refreshed
  pub status_poll_secs: u64,
  /// Periodic drain in addition to reconnect events; off when unset
  pub sweep_interval_secs: Option<u64>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      probe_path: "/".to_string(),
      probe_interval_secs: 10,
      status_poll_secs: 30,
      sweep_interval_secs: None,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Directory for cache.db and queue.db (default: $XDG_DATA_HOME/offsync)
  pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Filter directive, overridden by RUST_LOG
  pub level: String,
  /// Optional log file, rotated daily
  pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offsync/config.yaml
  ///
  /// Without any file, defaults are used.
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

    if let Ok(url) = std::env::var(API_URL_ENV) {
      config.api.base_url = url;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    // An empty document deserializes as null
    if contents.trim().is_empty() {
      return Ok(Config::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  pub fn base_url(&self) -> Result<Url> {
    Url::parse(&self.api.base_url)
      .map_err(|e| eyre!("Invalid api.base_url '{}': {}", self.api.base_url, e))
  }

  pub fn precache_urls(&self) -> Result<Vec<Url>> {
    let base = self.base_url()?;
    self
      .cache
      .precache
      .iter()
      .map(|path| resolve_url(&base, path))
      .collect()
  }

  pub fn probe_url(&self) -> Result<Url> {
    resolve_url(&self.base_url()?, &self.sync.probe_path)
  }

  pub fn connect_timeout(&self) -> Option<Duration> {
    self.api.connect_timeout_secs.map(Duration::from_secs)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.sync.probe_interval_secs.max(1))
  }

  pub fn status_poll_interval(&self) -> Duration {
    Duration::from_secs(self.sync.status_poll_secs.max(1))
  }

  pub fn sweep_interval(&self) -> Option<Duration> {
    self
      .sync
      .sweep_interval_secs
      .filter(|secs| *secs > 0)
      .map(Duration::from_secs)
  }

  /// Directory holding the cache and queue databases.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.storage.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offsync"))
  }
}
