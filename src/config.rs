//! Client defaults loaded from YAML.
//!
//! ```yaml
//! queries:
//!   stale_time: 30000
//!   cache_time: infinity
//!   retry: 2
//! persistence:
//!   enabled: true
//!   max_age: 86400000
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_EVENT_CAPACITY;
use crate::key::QueryKey;
use crate::options::{parse_duration_setting, CacheTime, QueryOptions, StaleTime};
use crate::persist::{PersistOptions, Persister, SqlitePersister};
use crate::retry::Retry;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryClientConfig {
  pub queries: QueryDefaults,
  pub mutations: MutationDefaults,
  /// Capacity of the query and mutation event channels.
  pub event_capacity: usize,
  pub persistence: PersistenceConfig,
}

impl Default for QueryClientConfig {
  fn default() -> Self {
    Self {
      queries: QueryDefaults::default(),
      mutations: MutationDefaults::default(),
      event_capacity: DEFAULT_EVENT_CAPACITY,
      persistence: PersistenceConfig::default(),
    }
  }
}

/// Defaults every query option builder starts from.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryDefaults {
  pub stale_time: StaleTime,
  pub cache_time: CacheTime,
  /// Retries after the first failed attempt.
  pub retry: u32,
  pub refetch_on_mount: bool,
  pub refetch_on_window_focus: bool,
  pub refetch_on_reconnect: bool,
  /// Poll period in milliseconds; omit to disable polling.
  #[serde(deserialize_with = "parse_duration_setting")]
  pub refetch_interval: Option<Duration>,
}

impl Default for QueryDefaults {
  fn default() -> Self {
    Self {
      stale_time: StaleTime::default(),
      cache_time: CacheTime::default(),
      retry: 3,
      refetch_on_mount: true,
      refetch_on_window_focus: true,
      refetch_on_reconnect: true,
      refetch_interval: None,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MutationDefaults {
  /// Mutations are not retried unless configured.
  pub retry: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
  pub enabled: bool,
  /// SQLite database file (default: under the platform data directory).
  pub path: Option<PathBuf>,
  /// Entries older than this many milliseconds are dropped on hydrate.
  #[serde(deserialize_with = "parse_duration_setting")]
  pub max_age: Option<Duration>,
  pub key_prefix: Option<String>,
}

impl QueryClientConfig {
  /// Load configuration from file, falling back to built-in defaults.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./query-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/query-sync/config.yaml
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("query-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("query-sync").join("config.yaml");
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
    serde_yaml::from_str(contents).map_err(|e| eyre!("Invalid configuration: {}", e))
  }

  /// Query options for `key` seeded from the configured defaults.
  pub fn query_options<T, E>(&self, key: impl Into<QueryKey>) -> QueryOptions<T, E> {
    let defaults = &self.queries;
    QueryOptions::new(key)
      .stale_time(defaults.stale_time)
      .cache_time(defaults.cache_time)
      .retry(Retry::Count(defaults.retry))
      .refetch_on_mount(defaults.refetch_on_mount)
      .refetch_on_window_focus(defaults.refetch_on_window_focus)
      .refetch_on_reconnect(defaults.refetch_on_reconnect)
      .refetch_interval(defaults.refetch_interval)
  }

  pub fn mutation_retry<E>(&self) -> Retry<E> {
    Retry::Count(self.mutations.retry)
  }

  /// Open the configured SQLite persister, if persistence is enabled.
  pub fn open_persister(&self) -> Result<Option<Arc<dyn Persister>>> {
    if !self.persistence.enabled {
      return Ok(None);
    }
    let persister = match &self.persistence.path {
      Some(path) => SqlitePersister::open_at(path)?,
      None => SqlitePersister::open()?,
    };
    Ok(Some(Arc::new(persister)))
  }

  /// JSON persist options carrying the configured max age and key prefix.
  pub fn persist_options<T: Serialize + DeserializeOwned>(&self) -> PersistOptions<T> {
    let mut options = PersistOptions::json();
    options.max_age = self.persistence.max_age;
    options.key_prefix = self.persistence.key_prefix.clone();
    options
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_yaml_uses_defaults() {
    let config = QueryClientConfig::from_yaml("{}").unwrap();
    assert_eq!(config.queries.stale_time, StaleTime::ZERO);
    assert_eq!(config.queries.cache_time, CacheTime::Finite(Duration::from_secs(300)));
    assert_eq!(config.queries.retry, 3);
    assert_eq!(config.mutations.retry, 0);
    assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
    assert!(!config.persistence.enabled);
  }

  #[test]
  fn test_durations_in_millis_or_infinity() {
    let config = QueryClientConfig::from_yaml(
      r#"
queries:
  stale_time: 30000
  cache_time: infinity
  refetch_interval: 1500
  refetch_on_window_focus: false
persistence:
  enabled: true
  path: /tmp/qs.db
  max_age: 60000
  key_prefix: app
"#,
    )
    .unwrap();

    assert_eq!(config.queries.stale_time, StaleTime::Finite(Duration::from_secs(30)));
    assert_eq!(config.queries.cache_time, CacheTime::Infinite);
    assert_eq!(config.queries.refetch_interval, Some(Duration::from_millis(1500)));
    assert!(!config.queries.refetch_on_window_focus);
    assert_eq!(config.persistence.max_age, Some(Duration::from_secs(60)));
    assert_eq!(config.persistence.key_prefix.as_deref(), Some("app"));

    let options: PersistOptions<Vec<u32>> = config.persist_options();
    assert_eq!(options.max_age, Some(Duration::from_secs(60)));
    assert_eq!(options.key_prefix.as_deref(), Some("app"));
  }

  #[test]
  fn test_bad_duration_is_rejected() {
    assert!(QueryClientConfig::from_yaml("queries:\n  stale_time: forever\n").is_err());
  }

  #[test]
  fn test_query_options_follow_defaults() {
    let config = QueryClientConfig::from_yaml("queries:\n  retry: 1\n  stale_time: 5000\n").unwrap();
    let options: QueryOptions<u32, String> = config.query_options("todos");
    assert_eq!(options.stale_time, StaleTime::Finite(Duration::from_secs(5)));
    assert!(matches!(options.retry, Retry::Count(1)));
    assert!(options.refetch_on_mount);
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = QueryClientConfig::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_persistence_disabled_opens_nothing() {
    let config = QueryClientConfig::default();
    assert!(config.open_persister().unwrap().is_none());
  }
}
