use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::QueryConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Site origin that relative paths resolve against
  pub origin: String,
  pub cache: ResourceConfig,
  pub query: QuerySettings,
  pub network: NetworkConfig,
  pub http: HttpConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:5173".to_string(),
      cache: ResourceConfig::default(),
      query: QuerySettings::default(),
      network: NetworkConfig::default(),
      http: HttpConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
  /// Generation tag; bumping it purges every older generation on activation
  pub version: String,
  /// Assets pre-cached on install (duplicates dropped, order kept)
  #[serde(deserialize_with = "deserialize_manifest")]
  pub manifest: Vec<String>,
}

impl Default for ResourceConfig {
  fn default() -> Self {
    Self {
      version: "topcenter-cache-v1".to_string(),
      manifest: vec![
        "/".to_string(),
        "/favicon.ico".to_string(),
        "/offline.html".to_string(),
        "/sounds/notification.mp3".to_string(),
      ],
    }
  }
}

fn deserialize_manifest<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  let mut manifest: Vec<String> = Vec::with_capacity(v.len());
  for path in v.into_iter().map(|p| p.trim().to_string()) {
    if !path.is_empty() && !manifest.contains(&path) {
      manifest.push(path);
    }
  }
  Ok(manifest)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
  pub stale_time_ms: u64,
  pub retry: u32,
  pub timeout_ms: Option<u64>,
  pub dedupe: bool,
}

impl Default for QuerySettings {
  fn default() -> Self {
    Self {
      stale_time_ms: 60_000,
      retry: 1,
      timeout_ms: None,
      dedupe: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Path or URL polled to detect connectivity; no probe when unset
  pub probe_url: Option<String>,
  pub probe_interval_ms: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      probe_url: None,
      probe_interval_ms: 15_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
  pub timeout_ms: u64,
}

impl Default for HttpConfig {
  fn default() -> Self {
    Self { timeout_ms: 15_000 }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tcache/config.yaml
  ///
  /// Falls back to built-in defaults when no file exists. `TCACHE_ORIGIN`
  /// overrides the origin either way.
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
      None => Self::default(),
    };

    if let Ok(origin) = std::env::var("TCACHE_ORIGIN") {
      config.origin = origin;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("tcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tcache").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Manifest entries resolved against the origin.
  pub fn manifest_urls(&self) -> Result<Vec<Url>> {
    let origin = self.origin_url()?;
    self
      .cache
      .manifest
      .iter()
      .map(|path| {
        origin
          .join(path)
          .map_err(|e| eyre!("Invalid manifest entry '{}': {}", path, e))
      })
      .collect()
  }

  pub fn query_config(&self) -> QueryConfig {
    QueryConfig {
      stale_time: Duration::from_millis(self.query.stale_time_ms),
      retry: self.query.retry,
      timeout: self.query.timeout_ms.map(Duration::from_millis),
      dedupe: self.query.dedupe,
    }
  }

  pub fn http_timeout(&self) -> Duration {
    Duration::from_millis(self.http.timeout_ms)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_millis(self.network.probe_interval_ms)
  }
}
