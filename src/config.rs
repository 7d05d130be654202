use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{DEFAULT_CLEANUP_INTERVAL, DEFAULT_MAX_ENTRIES, DEFAULT_TTL};
use crate::network::{NetworkOptions, DEFAULT_FOREGROUND_COOLDOWN, DEFAULT_SETTLE_DELAY};
use crate::queue::{QueueOptions, DEFAULT_DISPATCH_SPACING, QUEUE_NAMESPACE};
use crate::retry::{RetryConfig, RetryPolicy};

const APP_NAME: &str = "shelfsync";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub network: NetworkConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Base url; mutations go to `{url}/{target_resource}`
  pub url: String,
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
  10_000
}

impl BackendConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub default_ttl_ms: u64,
  pub max_entries: usize,
  /// Period of the expired-entry sweep in long-running commands
  pub cleanup_interval_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl_ms: DEFAULT_TTL.as_millis() as u64,
      max_entries: DEFAULT_MAX_ENTRIES,
      cleanup_interval_ms: DEFAULT_CLEANUP_INTERVAL.as_millis() as u64,
    }
  }
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::from_millis(self.default_ttl_ms)
  }

  pub fn cleanup_interval(&self) -> Duration {
    Duration::from_millis(self.cleanup_interval_ms.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// SQLite file holding the queue (defaults to the user data directory)
  pub database: Option<PathBuf>,
  pub dispatch_spacing_ms: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      database: None,
      dispatch_spacing_ms: DEFAULT_DISPATCH_SPACING.as_millis() as u64,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub settle_delay_ms: u64,
  /// How often the CLI probes the backend for connectivity
  pub probe_interval_ms: u64,
  pub foreground_cooldown_ms: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      settle_delay_ms: DEFAULT_SETTLE_DELAY.as_millis() as u64,
      probe_interval_ms: 15_000,
      foreground_cooldown_ms: DEFAULT_FOREGROUND_COOLDOWN.as_millis() as u64,
    }
  }
}

impl NetworkConfig {
  pub fn probe_interval(&self) -> Duration {
    // tokio intervals reject a zero period
    Duration::from_millis(self.probe_interval_ms.max(1))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shelfsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shelfsync/config.yaml
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/{}/config.yaml \
         with at least a `backend.url` entry.",
        APP_NAME
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from(format!("{}.yaml", APP_NAME));
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(APP_NAME).join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    if config.backend.url.trim().is_empty() {
      return Err(eyre!("backend.url must not be empty"));
    }
    Ok(config)
  }

  /// Bearer token for the backend, from `SHELFSYNC_API_TOKEN`.
  ///
  /// The backend may not need one, so absence is not an error.
  pub fn api_token() -> Option<String> {
    std::env::var("SHELFSYNC_API_TOKEN")
      .ok()
      .filter(|token| !token.trim().is_empty())
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy::from(&self.retry)
  }

  pub fn queue_options(&self) -> QueueOptions {
    QueueOptions {
      retry: self.retry_policy(),
      dispatch_spacing: Duration::from_millis(self.queue.dispatch_spacing_ms),
      namespace: QUEUE_NAMESPACE.to_string(),
    }
  }

  pub fn network_options(&self) -> NetworkOptions {
    NetworkOptions {
      settle_delay: Duration::from_millis(self.network.settle_delay_ms),
      foreground_cooldown: Duration::from_millis(self.network.foreground_cooldown_ms),
      initially_online: false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("backend:\n  url: https://api.example.com\n").unwrap();

    assert_eq!(config.backend.url, "https://api.example.com");
    assert_eq!(config.backend.timeout(), Duration::from_secs(10));
    assert_eq!(config.cache.default_ttl(), DEFAULT_TTL);
    assert_eq!(config.cache.max_entries, 500);
    assert_eq!(config.cache.cleanup_interval(), Duration::from_secs(3600));
    assert_eq!(config.retry_policy(), RetryPolicy::default());
    assert_eq!(config.queue.database, None);

    let queue = config.queue_options();
    assert_eq!(queue.dispatch_spacing, Duration::from_millis(100));
    assert_eq!(queue.namespace, "offline_queue");

    let network = config.network_options();
    assert_eq!(network.settle_delay, Duration::from_secs(1));
    assert_eq!(network.foreground_cooldown, Duration::from_secs(5));
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
backend:
  url: http://localhost:8080/api
  timeout_ms: 2500
cache:
  default_ttl_ms: 120000
retry:
  retries: 5
  base_backoff_ms: 100
  jitter: true
queue:
  database: /tmp/shelfsync.db
  dispatch_spacing_ms: 0
network:
  settle_delay_ms: 250
  probe_interval_ms: 1000
"#;
    let config = Config::parse(yaml).unwrap();

    assert_eq!(config.backend.timeout(), Duration::from_millis(2500));
    assert_eq!(config.cache.default_ttl(), Duration::from_secs(120));
    // Unset keys in a present section keep their defaults
    assert_eq!(config.cache.max_entries, DEFAULT_MAX_ENTRIES);

    let policy = config.retry_policy();
    assert_eq!(policy.max_retries, 5);
    assert_eq!(policy.base_backoff, Duration::from_millis(100));
    assert!(policy.jitter);

    assert_eq!(config.queue.database, Some(PathBuf::from("/tmp/shelfsync.db")));
    assert!(config.queue_options().dispatch_spacing.is_zero());
    assert_eq!(config.network.probe_interval(), Duration::from_secs(1));
    assert_eq!(config.network_options().foreground_cooldown, Duration::from_secs(5));
  }

  #[test]
  fn test_zero_intervals_are_clamped() {
    let yaml = "backend:\n  url: http://localhost\ncache:\n  cleanup_interval_ms: 0\nnetwork:\n  probe_interval_ms: 0\n";
    let config = Config::parse(yaml).unwrap();

    assert_eq!(config.cache.cleanup_interval(), Duration::from_millis(1));
    assert_eq!(config.network.probe_interval(), Duration::from_millis(1));
  }

  #[test]
  fn test_backend_is_required() {
    assert!(Config::parse("cache:\n  max_entries: 10\n").is_err());
    assert!(Config::parse("backend:\n  url: ''\n").is_err());
  }

  #[test]
  fn test_missing_explicit_file() {
    let err = Config::load(Some(Path::new("/nonexistent/shelfsync.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "backend:\n  url: https://books.example.org\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.backend.url, "https://books.example.org");
  }
}
