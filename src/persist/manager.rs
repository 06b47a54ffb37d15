use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::{PersistedQuery, Persister};
use crate::cache::QueryCache;
use crate::key::QueryKey;
use crate::options::QueryOptions;
use crate::query::{Query, SettledHook};
use crate::state::{QueryState, QueryStatus};
use crate::Payload;

type SerializeFn<T> = Arc<dyn Fn(&T) -> Result<String> + Send + Sync>;
type DeserializeFn<T> = Arc<dyn Fn(&str) -> Result<T> + Send + Sync>;

/// How queries under one key prefix are persisted.
pub struct PersistOptions<T> {
  pub serialize: SerializeFn<T>,
  pub deserialize: DeserializeFn<T>,
  /// Entries persisted longer ago than this are dropped on hydrate.
  pub max_age: Option<Duration>,
  /// Also persist the last good data of queries that settled in error.
  pub persist_errors: bool,
  /// Namespace for the stored key hash.
  pub key_prefix: Option<String>,
}

impl<T: Serialize + DeserializeOwned> PersistOptions<T> {
  /// Store payloads as JSON.
  pub fn json() -> Self {
    Self::custom(
      |data: &T| serde_json::to_string(data).map_err(|e| eyre!("Failed to serialize payload: {}", e)),
      |raw: &str| serde_json::from_str(raw).map_err(|e| eyre!("Failed to deserialize payload: {}", e)),
    )
  }
}

impl<T> PersistOptions<T> {
  pub fn custom(
    serialize: impl Fn(&T) -> Result<String> + Send + Sync + 'static,
    deserialize: impl Fn(&str) -> Result<T> + Send + Sync + 'static,
  ) -> Self {
    Self {
      serialize: Arc::new(serialize),
      deserialize: Arc::new(deserialize),
      max_age: None,
      persist_errors: false,
      key_prefix: None,
    }
  }

  pub fn max_age(mut self, max_age: Duration) -> Self {
    self.max_age = Some(max_age);
    self
  }

  pub fn persist_errors(mut self, on: bool) -> Self {
    self.persist_errors = on;
    self
  }

  pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
    self.key_prefix = Some(prefix.into());
    self
  }

  /// The hash an entry for `key` is stored under.
  pub fn stored_hash(&self, key: &QueryKey) -> String {
    match &self.key_prefix {
      Some(prefix) => format!("{}:{}", prefix, key.hash()),
      None => key.hash(),
    }
  }

  fn is_expired(&self, entry: &PersistedQuery) -> bool {
    let Some(max_age) = self.max_age else {
      return false;
    };
    match chrono::Duration::from_std(max_age) {
      Ok(max_age) => Utc::now().signed_duration_since(entry.persisted_at) > max_age,
      Err(_) => false,
    }
  }
}

impl<T> Clone for PersistOptions<T> {
  fn clone(&self) -> Self {
    Self {
      serialize: Arc::clone(&self.serialize),
      deserialize: Arc::clone(&self.deserialize),
      max_age: self.max_age,
      persist_errors: self.persist_errors,
      key_prefix: self.key_prefix.clone(),
    }
  }
}

impl<T> fmt::Debug for PersistOptions<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PersistOptions")
      .field("max_age", &self.max_age)
      .field("persist_errors", &self.persist_errors)
      .field("key_prefix", &self.key_prefix)
      .finish_non_exhaustive()
  }
}

/// Writes settled queries to a [`Persister`] and restores them on hydrate.
///
/// Only keys with a registration are touched. Persistence failures are
/// logged and never reach the fetch that triggered them.
pub struct PersistenceManager<T, E> {
  persister: Arc<dyn Persister>,
  registrations: RwLock<Vec<(QueryKey, PersistOptions<T>)>>,
  this: Weak<Self>,
  _error: PhantomData<fn() -> E>,
}

impl<T: Payload, E: Payload> PersistenceManager<T, E> {
  pub fn new(persister: Arc<dyn Persister>) -> Arc<Self> {
    Arc::new_cyclic(|this| Self {
      persister,
      registrations: RwLock::new(Vec::new()),
      this: Weak::clone(this),
      _error: PhantomData,
    })
  }

  pub fn persister(&self) -> &Arc<dyn Persister> {
    &self.persister
  }

  /// Persist every query whose key starts with `key`. Registering the same
  /// key again replaces its options.
  pub fn register(&self, key: impl Into<QueryKey>, options: PersistOptions<T>) {
    let key = key.into();
    let mut registrations = self.registrations.write();
    registrations.retain(|(existing, _)| existing != &key);
    registrations.push((key, options));
  }

  pub fn unregister(&self, key: &QueryKey) -> Option<PersistOptions<T>> {
    let mut registrations = self.registrations.write();
    let index = registrations.iter().position(|(existing, _)| existing == key)?;
    Some(registrations.remove(index).1)
  }

  /// The registration for `key`: the longest registered prefix wins.
  pub fn options_for(&self, key: &QueryKey) -> Option<PersistOptions<T>> {
    self
      .registrations
      .read()
      .iter()
      .filter(|(prefix, _)| key.matches(prefix))
      .max_by_key(|(prefix, _)| prefix.len())
      .map(|(_, options)| options.clone())
  }

  /// The entry to store for a query in `state`, if it should be stored.
  pub fn snapshot(&self, key: &QueryKey, state: &QueryState<T, E>) -> Option<Result<PersistedQuery>> {
    let options = self.options_for(key)?;
    let persistable = match state.status {
      QueryStatus::Success => true,
      QueryStatus::Error => options.persist_errors,
      QueryStatus::Pending => false,
    };
    if !persistable {
      return None;
    }
    let data = state.data.as_ref()?;
    let data_updated_at = state.data_updated_at?;

    Some((options.serialize)(data).map(|payload| PersistedQuery {
      key: key.clone(),
      key_hash: options.stored_hash(key),
      payload,
      status: state.status,
      data_updated_at,
      persisted_at: Utc::now(),
    }))
  }

  /// Write one query now. Returns whether anything was stored.
  pub async fn persist(&self, query: &Query<T, E>) -> Result<bool> {
    match self.snapshot(query.key(), &query.state()) {
      Some(entry) => {
        self.persister.persist_query(entry?).await?;
        Ok(true)
      }
      None => Ok(false),
    }
  }

  /// Hook for [`QueryCache`] settles: writes the snapshot in the background.
  pub fn settled_hook(&self) -> SettledHook<T, E> {
    let this = Weak::clone(&self.this);
    Arc::new(move |query: &Query<T, E>, state: &QueryState<T, E>| {
      let Some(manager) = this.upgrade() else {
        return;
      };
      let entry = match manager.snapshot(query.key(), state) {
        Some(Ok(entry)) => entry,
        Some(Err(e)) => {
          warn!(key = %query.hash(), "failed to serialize query for persistence: {}", e);
          return;
        }
        None => return,
      };
      let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
      };
      handle.spawn(async move {
        let key_hash = entry.key_hash.clone();
        match manager.persister.persist_query(entry).await {
          Ok(()) => debug!(key = %key_hash, "query persisted"),
          Err(e) => warn!(key = %key_hash, "failed to persist query: {}", e),
        }
      });
    })
  }

  /// Seed `cache` from storage. Returns the number of queries restored.
  ///
  /// Restored data keeps its original `data_updated_at`, so staleness is
  /// measured from the original fetch. Entries that are unregistered,
  /// expired, undecodable or older than the cached data are skipped.
  ///
  /// Only data is stored, not the error value, so an entry saved with status
  /// `error` comes back as successful data that is already invalidated and
  /// refetches on next use.
  pub async fn hydrate(&self, cache: &QueryCache<T, E>) -> Result<usize> {
    let entries = self.persister.restore_all().await?;
    let mut restored = 0;

    for entry in entries {
      let Some(options) = self.options_for(&entry.key) else {
        continue;
      };
      if options.stored_hash(&entry.key) != entry.key_hash {
        continue;
      }
      if options.is_expired(&entry) {
        debug!(key = %entry.key_hash, "dropping expired persisted query");
        if let Err(e) = self.persister.remove_query(&entry.key_hash).await {
          warn!(key = %entry.key_hash, "failed to remove expired query: {}", e);
        }
        continue;
      }

      let fresher_in_memory = cache
        .find(&entry.key)
        .and_then(|query| query.state().data_updated_at)
        .is_some_and(|live| live >= entry.data_updated_at);
      if fresher_in_memory {
        continue;
      }

      match (options.deserialize)(&entry.payload) {
        Ok(data) => {
          let query = cache.set_query_data(QueryOptions::new(entry.key), data, Some(entry.data_updated_at));
          if entry.status == QueryStatus::Error {
            query.invalidate();
          }
          restored += 1;
        }
        Err(e) => warn!(key = %entry.key_hash, "failed to restore persisted query: {}", e),
      }
    }

    debug!(restored, "hydrated query cache");
    Ok(restored)
  }

  /// Persistable snapshots of every registered query in `cache`.
  pub fn dehydrate(&self, cache: &QueryCache<T, E>) -> Vec<PersistedQuery> {
    cache
      .all()
      .into_iter()
      .filter_map(|query| match self.snapshot(query.key(), &query.state())? {
        Ok(entry) => Some(entry),
        Err(e) => {
          warn!(key = %query.hash(), "failed to serialize query: {}", e);
          None
        }
      })
      .collect()
  }

  /// Stop persisting `key` and delete its stored entry.
  pub async fn unpersist(&self, key: &QueryKey) -> Result<()> {
    let stored_hash = match self.unregister(key) {
      Some(options) => options.stored_hash(key),
      None => key.hash(),
    };
    self.persister.remove_query(&stored_hash).await
  }

  pub async fn clear(&self) -> Result<()> {
    self.persister.clear().await
  }

  pub async fn close(&self) -> Result<()> {
    self.persister.close().await
  }
}

impl<T, E> fmt::Debug for PersistenceManager<T, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PersistenceManager")
      .field("registrations", &self.registrations.read().len())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::persist::InMemoryPersister;
  use crate::query_key;
  use chrono::DateTime;

  type Manager = PersistenceManager<Vec<String>, String>;

  fn success(data: Vec<String>, at: DateTime<Utc>) -> QueryState<Vec<String>, String> {
    QueryState::default().with_success(data, at)
  }

  #[test]
  fn test_longest_prefix_wins() {
    let manager = Manager::new(Arc::new(InMemoryPersister::new()));
    manager.register(query_key!["todos"], PersistOptions::json().key_prefix("short"));
    manager.register(query_key!["todos", "done"], PersistOptions::json().key_prefix("long"));

    let key = query_key!["todos", "done", 3];
    let options = manager.options_for(&key).unwrap();
    assert_eq!(options.key_prefix.as_deref(), Some("long"));
    assert_eq!(options.stored_hash(&key), r#"long:["todos","done",3]"#);

    let key = query_key!["todos", "open"];
    assert_eq!(manager.options_for(&key).unwrap().key_prefix.as_deref(), Some("short"));
    assert!(manager.options_for(&query_key!["users"]).is_none());
  }

  #[test]
  fn test_snapshot_skips_errors_unless_enabled() {
    let manager = Manager::new(Arc::new(InMemoryPersister::new()));
    manager.register(query_key!["a"], PersistOptions::json());
    manager.register(query_key!["b"], PersistOptions::json().persist_errors(true));

    let errored = success(vec!["x".into()], Utc::now()).with_error("boom".into(), Utc::now());
    assert!(manager.snapshot(&query_key!["a"], &errored).is_none());

    let entry = manager.snapshot(&query_key!["b"], &errored).unwrap().unwrap();
    assert_eq!(entry.status, QueryStatus::Error);
    assert_eq!(entry.payload, r#"["x"]"#);

    let pending = QueryState::default();
    assert!(manager.snapshot(&query_key!["a"], &pending).is_none());
  }

  #[tokio::test]
  async fn test_hydrate_preserves_original_timestamp() {
    let persister = Arc::new(InMemoryPersister::new());
    let manager = Manager::new(persister.clone());
    manager.register(query_key!["todos"], PersistOptions::json());

    let fetched_at = Utc::now() - chrono::Duration::minutes(10);
    let entry = manager
      .snapshot(&query_key!["todos"], &success(vec!["a".into()], fetched_at))
      .unwrap()
      .unwrap();
    persister.persist_query(entry).await.unwrap();

    let cache = QueryCache::new();
    assert_eq!(manager.hydrate(&cache).await.unwrap(), 1);

    let query = cache.find(&query_key!["todos"]).unwrap();
    assert_eq!(query.data(), Some(vec!["a".to_string()]));
    assert_eq!(query.state().data_updated_at, Some(fetched_at));
    assert!(query.is_stale());
  }

  #[tokio::test]
  async fn test_hydrate_invalidates_errored_entries() {
    let persister = Arc::new(InMemoryPersister::new());
    let manager = Manager::new(persister.clone());
    manager.register(query_key!["todos"], PersistOptions::json().persist_errors(true));
    manager.register(query_key!["users"], PersistOptions::json());

    let now = Utc::now();
    let errored = success(vec!["a".into()], now).with_error("boom".into(), now);
    let entry = manager.snapshot(&query_key!["todos"], &errored).unwrap().unwrap();
    persister.persist_query(entry).await.unwrap();
    let entry = manager
      .snapshot(&query_key!["users"], &success(vec!["b".into()], now))
      .unwrap()
      .unwrap();
    persister.persist_query(entry).await.unwrap();

    let cache = QueryCache::new();
    assert_eq!(manager.hydrate(&cache).await.unwrap(), 2);

    let todos = cache.find(&query_key!["todos"]).unwrap().state();
    assert_eq!(todos.data, Some(vec!["a".to_string()]));
    assert!(todos.is_invalidated);
    assert!(!cache.find(&query_key!["users"]).unwrap().state().is_invalidated);
  }

  #[tokio::test]
  async fn test_hydrate_drops_expired_entries() {
    let persister = Arc::new(InMemoryPersister::new());
    let manager = Manager::new(persister.clone());
    manager.register(
      query_key!["todos"],
      PersistOptions::json().max_age(Duration::from_secs(60)),
    );

    let mut entry = manager
      .snapshot(&query_key!["todos"], &success(vec!["old".into()], Utc::now()))
      .unwrap()
      .unwrap();
    entry.persisted_at = Utc::now() - chrono::Duration::minutes(5);
    persister.persist_query(entry).await.unwrap();

    let cache = QueryCache::new();
    assert_eq!(manager.hydrate(&cache).await.unwrap(), 0);
    assert!(cache.find(&query_key!["todos"]).is_none());
    assert!(persister.is_empty());
  }

  #[tokio::test]
  async fn test_hydrate_keeps_fresher_cache_data() {
    let persister = Arc::new(InMemoryPersister::new());
    let manager = Manager::new(persister.clone());
    manager.register(query_key!["todos"], PersistOptions::json());

    let stored_at = Utc::now() - chrono::Duration::minutes(1);
    let entry = manager
      .snapshot(&query_key!["todos"], &success(vec!["stored".into()], stored_at))
      .unwrap()
      .unwrap();
    persister.persist_query(entry).await.unwrap();

    let cache = QueryCache::new();
    cache.set_query_data(QueryOptions::new(query_key!["todos"]), vec!["live".into()], None);

    assert_eq!(manager.hydrate(&cache).await.unwrap(), 0);
    assert_eq!(cache.get_query_data(&query_key!["todos"]), Some(vec!["live".to_string()]));
  }

  #[tokio::test]
  async fn test_hydrate_skips_unregistered_and_undecodable() {
    let persister = Arc::new(InMemoryPersister::new());
    let manager = Manager::new(persister.clone());
    manager.register(query_key!["todos"], PersistOptions::json().key_prefix("v2"));

    let now = Utc::now();
    for (key, key_hash, payload) in [
      (query_key!["users"], r#"["users"]"#.to_string(), r#"["u"]"#),
      (query_key!["todos", 1], r#"v1:["todos",1]"#.to_string(), r#"["t"]"#),
      (query_key!["todos", 2], r#"v2:["todos",2]"#.to_string(), "not json"),
      (query_key!["todos", 3], r#"v2:["todos",3]"#.to_string(), r#"["ok"]"#),
    ] {
      persister
        .persist_query(PersistedQuery {
          key,
          key_hash,
          payload: payload.to_string(),
          status: QueryStatus::Success,
          data_updated_at: now,
          persisted_at: now,
        })
        .await
        .unwrap();
    }

    let cache = QueryCache::new();
    assert_eq!(manager.hydrate(&cache).await.unwrap(), 1);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.get_query_data(&query_key!["todos", 3]), Some(vec!["ok".to_string()]));
  }

  #[tokio::test]
  async fn test_settled_fetch_is_persisted() {
    let persister = Arc::new(InMemoryPersister::new());
    let manager = Manager::new(persister.clone());
    manager.register(query_key!["todos"], PersistOptions::json());

    let cache: QueryCache<Vec<String>, String> = QueryCache::new();
    cache.set_settled_hook(manager.settled_hook());

    let query = cache.build(
      QueryOptions::new(query_key!["todos"]).query_fn(|_| async { Ok(vec!["a".to_string()]) }),
      None,
    );
    query.fetch(None, false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stored = persister.restore_query(r#"["todos"]"#).await.unwrap().unwrap();
    assert_eq!(stored.payload, r#"["a"]"#);
    assert_eq!(Some(stored.data_updated_at), query.state().data_updated_at);
  }

  #[tokio::test]
  async fn test_unpersist_removes_registration_and_entry() {
    let persister = Arc::new(InMemoryPersister::new());
    let manager = Manager::new(persister.clone());
    manager.register(query_key!["todos"], PersistOptions::json().key_prefix("p"));

    let cache = QueryCache::new();
    let query = cache.set_query_data(QueryOptions::new(query_key!["todos"]), vec!["a".into()], None);
    assert!(manager.persist(&query).await.unwrap());
    assert_eq!(manager.dehydrate(&cache).len(), 1);

    manager.unpersist(&query_key!["todos"]).await.unwrap();
    assert!(persister.is_empty());
    assert!(manager.dehydrate(&cache).is_empty());
    assert!(!manager.persist(&query).await.unwrap());
  }
}
