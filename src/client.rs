//! The entry point tying the caches, persistence and connectivity together.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::cache::{QueryCache, QueryFilters, RefetchMode};
use crate::config::QueryClientConfig;
use crate::error::QueryResult;
use crate::infinite::{InfiniteEvictHook, InfiniteQuery, InfiniteQueryOptions};
use crate::key::{KeyPart, QueryKey};
use crate::mutation::{Mutation, MutationCache, MutationOptions};
use crate::observer::QueryObserver;
use crate::options::{QueryFnContext, QueryOptions};
use crate::persist::{PersistOptions, PersistedQuery, PersistenceManager, Persister};
use crate::query::Query;
use crate::state::QueryState;
use crate::store::QueryStore;
use crate::Payload;

struct ClientInner<T, E> {
  config: QueryClientConfig,
  queries: QueryCache<T, E>,
  mutations: MutationCache,
  infinite: DashMap<String, Arc<InfiniteQuery<T, E>>>,
  online: watch::Sender<bool>,
  focused: AtomicBool,
  persistence: Option<Arc<PersistenceManager<T, E>>>,
}

/// Owns a query cache, a mutation cache and the infinite queries for one
/// payload type. Cheap to clone; clones share everything.
pub struct QueryClient<T: Payload, E: Payload> {
  inner: Arc<ClientInner<T, E>>,
}

/// Builder for [`QueryClient`].
pub struct QueryClientBuilder<T, E> {
  config: QueryClientConfig,
  persister: Option<Arc<dyn Persister>>,
  event_capacity: Option<usize>,
  _types: std::marker::PhantomData<fn() -> (T, E)>,
}

impl<T: Payload, E: Payload> QueryClientBuilder<T, E> {
  pub fn config(mut self, config: QueryClientConfig) -> Self {
    self.config = config;
    self
  }

  pub fn persister(mut self, persister: Arc<dyn Persister>) -> Self {
    self.persister = Some(persister);
    self
  }

  pub fn event_capacity(mut self, capacity: usize) -> Self {
    self.event_capacity = Some(capacity);
    self
  }

  pub fn build(self) -> QueryClient<T, E> {
    let capacity = self.event_capacity.unwrap_or(self.config.event_capacity);
    let (online, online_rx) = watch::channel(true);
    let queries = QueryCache::with_capacity(capacity, Some(online_rx));

    let persistence = self.persister.map(|persister| {
      let manager = PersistenceManager::new(persister);
      queries.set_settled_hook(manager.settled_hook());
      manager
    });

    QueryClient {
      inner: Arc::new(ClientInner {
        config: self.config,
        queries,
        mutations: MutationCache::with_capacity(capacity),
        infinite: DashMap::new(),
        online,
        focused: AtomicBool::new(true),
        persistence,
      }),
    }
  }
}

impl<T: Payload, E: Payload> QueryClient<T, E> {
  pub fn new() -> Self {
    Self::builder().build()
  }

  pub fn builder() -> QueryClientBuilder<T, E> {
    QueryClientBuilder {
      config: QueryClientConfig::default(),
      persister: None,
      event_capacity: None,
      _types: std::marker::PhantomData,
    }
  }

  /// A client configured from `config`, opening its SQLite persister when
  /// persistence is enabled.
  pub fn from_config(config: QueryClientConfig) -> Result<Self> {
    let persister = config.open_persister()?;
    let mut builder = Self::builder().config(config);
    if let Some(persister) = persister {
      builder = builder.persister(persister);
    }
    Ok(builder.build())
  }

  pub fn config(&self) -> &QueryClientConfig {
    &self.inner.config
  }

  pub fn query_cache(&self) -> &QueryCache<T, E> {
    &self.inner.queries
  }

  pub fn mutation_cache(&self) -> &MutationCache {
    &self.inner.mutations
  }

  pub fn persistence(&self) -> Option<&Arc<PersistenceManager<T, E>>> {
    self.inner.persistence.as_ref()
  }

  /// Query options for `key` seeded from the configured defaults.
  pub fn query_options(&self, key: impl Into<QueryKey>) -> QueryOptions<T, E> {
    self.inner.config.query_options(key)
  }

  /// Mutation options carrying the configured retry policy.
  pub fn mutation_options<D, V, C>(&self) -> MutationOptions<D, E, V, C> {
    MutationOptions::new().retry(self.inner.config.mutation_retry())
  }

  /// Fetch `options.key`, returning cached data when it is fresh by
  /// `options.stale_time`. Fetch failures are returned to the caller.
  pub async fn fetch_query(&self, options: QueryOptions<T, E>) -> QueryResult<T, E> {
    let stale_time = options.stale_time;
    let query_fn = options.query_fn.clone();
    let query = self.inner.queries.build(options, None);
    if !query.is_stale_by(stale_time) {
      if let Some(data) = query.data() {
        return Ok(data);
      }
    }
    query.fetch(query_fn, false).await
  }

  /// Like [`fetch_query`](Self::fetch_query) but failures are only logged.
  pub async fn prefetch_query(&self, options: QueryOptions<T, E>) {
    let key = options.key.hash();
    if let Err(e) = self.fetch_query(options).await {
      debug!(key = %key, cancelled = e.is_cancelled(), "prefetch failed");
    }
  }

  /// A new observer on this client's cache. Call `start` to attach it.
  pub fn observer(&self, options: QueryOptions<T, E>) -> QueryObserver<T, E> {
    QueryObserver::new(&self.inner.queries, options)
  }

  pub fn get_query(&self, key: &QueryKey) -> Option<Arc<Query<T, E>>> {
    self.inner.queries.find(key)
  }

  pub fn get_query_data(&self, key: &QueryKey) -> Option<T> {
    self.inner.queries.get_query_data(key)
  }

  pub fn get_query_state(&self, key: &QueryKey) -> Option<QueryState<T, E>> {
    self.inner.queries.find(key).map(|query| query.state())
  }

  /// Write data for `key` as if it had just been fetched.
  pub fn set_query_data(&self, key: impl Into<QueryKey>, data: T) -> Arc<Query<T, E>> {
    self.inner.queries.set_query_data(self.query_options(key), data, None)
  }

  /// Derive new data from the current data (if any) and write it.
  pub fn update_query_data(
    &self,
    key: impl Into<QueryKey>,
    updater: impl FnOnce(Option<&T>) -> T,
  ) -> Arc<Query<T, E>> {
    let key = key.into();
    let current = self.get_query_data(&key);
    self.set_query_data(key, updater(current.as_ref()))
  }

  /// Mark every match stale, then refetch those `refetch` selects.
  pub async fn invalidate_queries(
    &self,
    filters: QueryFilters<T, E>,
    refetch: RefetchMode,
  ) -> Vec<QueryResult<T, E>> {
    let matches = self.inner.queries.find_all(&filters);
    for query in &matches {
      query.invalidate();
    }
    debug!(count = matches.len(), ?refetch, "invalidated queries");

    let targets = matches
      .into_iter()
      .filter(|query| !is_disabled(query) && refetch.includes(query.is_active()))
      .collect();
    refetch_all(targets).await
  }

  /// Force a fresh fetch of every match, skipping disabled queries.
  pub async fn refetch_queries(&self, filters: QueryFilters<T, E>) -> Vec<QueryResult<T, E>> {
    let targets = self
      .inner
      .queries
      .find_all(&filters)
      .into_iter()
      .filter(|query| !is_disabled(query))
      .collect();
    refetch_all(targets).await
  }

  /// Cancel the in-flight fetch of every match.
  pub fn cancel_queries(&self, filters: QueryFilters<T, E>) {
    for query in self.inner.queries.find_all(&filters.fetching(true)) {
      query.cancel();
    }
  }

  pub fn remove_queries(&self, filters: QueryFilters<T, E>) {
    for query in self.inner.queries.find_all(&filters) {
      self.inner.queries.remove(&query);
    }
  }

  /// Return every match to its initial state and refetch the active ones.
  pub async fn reset_queries(&self, filters: QueryFilters<T, E>) -> Vec<QueryResult<T, E>> {
    let matches = self.inner.queries.find_all(&filters);
    for query in &matches {
      query.reset();
    }
    let targets = matches.into_iter().filter(|query| query.is_active()).collect();
    refetch_all(targets).await
  }

  /// Whether any query or infinite query is fetching.
  pub fn is_fetching(&self) -> bool {
    self.fetching_count(&QueryFilters::all()) > 0
      || self.inner.infinite.iter().any(|entry| entry.value().is_fetching())
  }

  pub fn fetching_count(&self, filters: &QueryFilters<T, E>) -> usize {
    self.inner.queries.find_all(&filters.clone().fetching(true)).len()
  }

  pub fn is_mutating(&self) -> bool {
    self.mutating_count() > 0
  }

  pub fn mutating_count(&self) -> usize {
    self.inner.mutations.pending_count()
  }

  /// The infinite query for `options.key`, created on first use. Later
  /// calls with the same key return the existing query unchanged.
  ///
  /// The query is dropped from the registry once it has been unsubscribed
  /// and idle for its cache time.
  pub fn get_infinite_query(&self, options: InfiniteQueryOptions<T, E>) -> Arc<InfiniteQuery<T, E>> {
    let hash = options.key.hash();
    let online = self.inner.online.subscribe();
    let client = Arc::downgrade(&self.inner);
    let on_evict: InfiniteEvictHook<T, E, KeyPart> = Arc::new(move |query: &Arc<InfiniteQuery<T, E>>| {
      let Some(inner) = client.upgrade() else {
        return;
      };
      let removed = inner
        .infinite
        .remove_if(query.hash(), |_, current| Arc::ptr_eq(current, query))
        .is_some();
      if removed {
        debug!(key = %query.hash(), "infinite query removed");
      }
    });
    let entry = self
      .inner
      .infinite
      .entry(hash)
      .or_insert_with(|| InfiniteQuery::with_hooks(options, Some(online), Some(on_evict)));
    Arc::clone(entry.value())
  }

  pub fn remove_infinite_query(&self, key: &QueryKey) -> bool {
    match self.inner.infinite.remove(&key.hash()) {
      Some((_, query)) => {
        query.cancel();
        true
      }
      None => false,
    }
  }

  /// Register a new mutation. Each call yields an independent mutation.
  pub fn build_mutation<D, V, C>(&self, options: MutationOptions<D, E, V, C>) -> Arc<Mutation<D, E, V, C>>
  where
    D: Payload,
    V: Payload,
    C: Payload,
  {
    self.inner.mutations.build(options)
  }

  /// A started observer for `key` that lives as long as the returned store.
  ///
  /// `options` defaults to the configured query defaults; its key and fetch
  /// function are replaced by `key` and `fetch`.
  pub fn create_store<F, Fut>(
    &self,
    key: impl Into<QueryKey>,
    fetch: F,
    options: Option<QueryOptions<T, E>>,
  ) -> QueryStore<T, E>
  where
    F: Fn(QueryFnContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
  {
    let key = key.into();
    let mut options = options.unwrap_or_else(|| self.query_options(key.clone()));
    options.key = key;
    let observer = self.observer(options.query_fn(fetch));
    QueryStore::new(observer)
  }

  /// Persist queries under `key` with `options`.
  pub fn register_persistence(&self, key: impl Into<QueryKey>, options: PersistOptions<T>) -> Result<()> {
    let manager = self.persistence_manager()?;
    manager.register(key, options);
    Ok(())
  }

  /// Seed the cache from the persister. Returns how many queries were
  /// restored; zero when no persister is configured.
  pub async fn hydrate(&self) -> Result<usize> {
    let Some(manager) = &self.inner.persistence else {
      return Ok(0);
    };
    manager.persister().init().await?;
    let restored = manager.hydrate(&self.inner.queries).await?;
    info!(restored, "restored persisted queries");
    Ok(restored)
  }

  /// Snapshots of every persistable query currently cached.
  pub fn dehydrate(&self) -> Vec<PersistedQuery> {
    match &self.inner.persistence {
      Some(manager) => manager.dehydrate(&self.inner.queries),
      None => Vec::new(),
    }
  }

  /// Delete every stored snapshot. In-memory queries are untouched.
  pub async fn clear_persistence(&self) -> Result<()> {
    match &self.inner.persistence {
      Some(manager) => manager.clear().await,
      None => Ok(()),
    }
  }

  /// Stop persisting `key` and delete its snapshot.
  pub async fn unpersist(&self, key: &QueryKey) -> Result<()> {
    self.persistence_manager()?.unpersist(key).await
  }

  fn persistence_manager(&self) -> Result<&Arc<PersistenceManager<T, E>>> {
    self
      .inner
      .persistence
      .as_ref()
      .ok_or_else(|| eyre!("No persister configured for this client"))
  }

  pub fn is_online(&self) -> bool {
    *self.inner.online.borrow()
  }

  pub fn is_focused(&self) -> bool {
    self.inner.focused.load(Ordering::SeqCst)
  }

  /// Update the online flag. Going offline pauses fetch attempts; coming
  /// back resumes them and refetches stale active queries that ask for it.
  /// Returns the number of queries refetched.
  pub fn set_online(&self, online: bool) -> usize {
    let was_online = self.inner.online.send_replace(online);
    if was_online || !online {
      return 0;
    }
    info!("back online");
    self.refetch_stale(|options| options.refetch_on_reconnect)
  }

  /// Update the focus flag. Regaining focus while online refetches stale
  /// active queries that ask for it. Returns the number of queries refetched.
  pub fn set_focused(&self, focused: bool) -> usize {
    let was_focused = self.inner.focused.swap(focused, Ordering::SeqCst);
    if was_focused || !focused || !self.is_online() {
      return 0;
    }
    debug!("focus regained");
    self.refetch_stale(|options| options.refetch_on_window_focus)
  }

  fn refetch_stale(&self, wants: impl Fn(&QueryOptions<T, E>) -> bool) -> usize {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      return 0;
    };
    let targets = self
      .inner
      .queries
      .find_all(&QueryFilters::all().active(true).stale(true).fetching(false))
      .into_iter()
      .filter(|query| wants(&query.options()))
      .collect::<Vec<_>>();

    for query in &targets {
      let query = Arc::clone(query);
      runtime.spawn(async move {
        // The outcome lands in the query state
        let _ = query.fetch(None, false).await;
      });
    }
    targets.len()
  }

  /// Drop every in-memory query, infinite query and mutation. Persisted
  /// snapshots stay.
  pub fn clear(&self) {
    self.inner.queries.clear();
    for entry in self.inner.infinite.iter() {
      entry.value().cancel();
    }
    self.inner.infinite.clear();
    self.inner.mutations.clear();
  }

  /// Cancel all fetches, clear memory and close the persister.
  pub async fn dispose(&self) -> Result<()> {
    self.cancel_queries(QueryFilters::all());
    self.clear();
    if let Some(manager) = &self.inner.persistence {
      manager.close().await?;
    }
    Ok(())
  }
}

/// Every observer attached to the query is disabled.
fn is_disabled<T: Payload, E: Payload>(query: &Query<T, E>) -> bool {
  query.observer_count() > 0 && !query.is_active()
}

async fn refetch_all<T: Payload, E: Payload>(queries: Vec<Arc<Query<T, E>>>) -> Vec<QueryResult<T, E>> {
  join_all(queries.iter().map(|query| query.refetch())).await
}

impl<T: Payload, E: Payload> Default for QueryClient<T, E> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: Payload, E: Payload> Clone for QueryClient<T, E> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T: Payload, E: Payload> fmt::Debug for QueryClient<T, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryClient")
      .field("queries", &self.inner.queries.len())
      .field("infinite", &self.inner.infinite.len())
      .field("mutations", &self.inner.mutations.len())
      .field("online", &self.is_online())
      .field("persistence", &self.inner.persistence.is_some())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::QueryError;
  use crate::options::StaleTime;
  use crate::persist::InMemoryPersister;
  use crate::query_key;
  use crate::state::FetchStatus;
  use serde::{Deserialize, Serialize};
  use std::sync::atomic::AtomicU32;
  use std::time::Duration;

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Todo {
    id: u32,
    title: String,
  }

  fn todo(id: u32, title: &str) -> Todo {
    Todo {
      id,
      title: title.to_string(),
    }
  }

  type Client = QueryClient<Vec<Todo>, String>;

  /// First call returns one todo, every later call two.
  fn todos_options(client: &Client, calls: &Arc<AtomicU32>) -> QueryOptions<Vec<Todo>, String> {
    let calls = calls.clone();
    client
      .query_options(query_key!["todos"])
      .stale_time(StaleTime::ZERO)
      .query_fn(move |_| {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
          if n == 0 {
            Ok(vec![todo(1, "a")])
          } else {
            Ok(vec![todo(1, "a"), todo(2, "b")])
          }
        }
      })
  }

  fn counting(client: &QueryClient<u32, String>, key: QueryKey, calls: &Arc<AtomicU32>) -> QueryOptions<u32, String> {
    let calls = calls.clone();
    client.query_options(key).query_fn(move |_| {
      let calls = calls.clone();
      async move { Ok(calls.fetch_add(1, Ordering::SeqCst) + 1) }
    })
  }

  async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_refetches_active_todos() {
    let client = Client::new();
    let calls = Arc::new(AtomicU32::new(0));
    let options = todos_options(&client, &calls);

    let first = client.fetch_query(options.clone()).await.unwrap();
    assert_eq!(first.len(), 1);

    let observer = client.observer(options.refetch_on_mount(false));
    observer.start();
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let results = client
      .invalidate_queries(QueryFilters::key(query_key!["todos"]), RefetchMode::Active)
      .await;
    assert_eq!(results.len(), 1);
    assert_eq!(client.get_query_data(&query_key!["todos"]).unwrap().len(), 2);
    assert_eq!(observer.get_current_result().data.unwrap().len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_modes() {
    let client: QueryClient<u32, String> = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    client.fetch_query(counting(&client, query_key!["a"], &calls)).await.unwrap();
    client.fetch_query(counting(&client, query_key!["b"], &calls)).await.unwrap();
    let observer = client.observer(counting(&client, query_key!["a"], &calls).refetch_on_mount(false));
    observer.start();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // None only marks stale
    let results = client
      .invalidate_queries(QueryFilters::all(), RefetchMode::None)
      .await;
    assert!(results.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(client.get_query_state(&query_key!["b"]).unwrap().is_invalidated);

    // Active skips the unobserved query
    client
      .invalidate_queries(QueryFilters::all(), RefetchMode::Active)
      .await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    client
      .invalidate_queries(QueryFilters::all(), RefetchMode::Inactive)
      .await;
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(client.get_query_data(&query_key!["b"]), Some(4));

    client
      .invalidate_queries(QueryFilters::all(), RefetchMode::All)
      .await;
    assert_eq!(calls.load(Ordering::SeqCst), 6);
  }

  #[tokio::test(start_paused = true)]
  async fn test_disabled_observer_blocks_refetch() {
    let client: QueryClient<u32, String> = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    client.fetch_query(counting(&client, query_key!["a"], &calls)).await.unwrap();
    let observer = client.observer(counting(&client, query_key!["a"], &calls).enabled(false));
    observer.start();

    client
      .invalidate_queries(QueryFilters::all(), RefetchMode::All)
      .await;
    client.refetch_queries(QueryFilters::all()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_query_respects_stale_time() {
    let client: QueryClient<u32, String> = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let options = counting(&client, query_key!["a"], &calls).stale_time(Duration::from_secs(60));

    assert_eq!(client.fetch_query(options.clone()).await, Ok(1));
    assert_eq!(client.fetch_query(options.clone()).await, Ok(1));
    assert_eq!(
      client.fetch_query(options.stale_time(StaleTime::ZERO)).await,
      Ok(2)
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_prefetch_swallows_errors() {
    let client: QueryClient<u32, String> = QueryClient::new();
    let options = client
      .query_options(query_key!["broken"])
      .retry(crate::retry::Retry::never())
      .query_fn(|_| async { Err::<u32, _>("down".to_string()) });

    client.prefetch_query(options.clone()).await;
    let state = client.get_query_state(&query_key!["broken"]).unwrap();
    assert_eq!(state.error.as_deref(), Some("down"));

    let err = client.fetch_query(options).await.unwrap_err();
    assert_eq!(err, QueryError::Failed("down".to_string()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_set_and_update_query_data() {
    let client: QueryClient<u32, String> = QueryClient::new();
    assert!(client.get_query_data(&query_key!["n"]).is_none());

    client.set_query_data(query_key!["n"], 1);
    client.update_query_data(query_key!["n"], |n| n.copied().unwrap_or(0) + 10);
    assert_eq!(client.get_query_data(&query_key!["n"]), Some(11));

    client.update_query_data(query_key!["m"], |n| n.copied().unwrap_or(0) + 10);
    assert_eq!(client.get_query_data(&query_key!["m"]), Some(10));
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_remove_and_reset() {
    let client: QueryClient<u32, String> = QueryClient::new();
    let slow = client
      .query_options(query_key!["slow"])
      .query_fn(|_| async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(7)
      });
    client.set_query_data(query_key!["slow"], 1);

    let pending = tokio::spawn({
      let client = client.clone();
      let slow = slow.clone().stale_time(StaleTime::ZERO);
      async move { client.fetch_query(slow).await }
    });
    settle().await;
    assert!(client.is_fetching());
    assert_eq!(client.fetching_count(&QueryFilters::key(query_key!["slow"])), 1);

    client.cancel_queries(QueryFilters::key(query_key!["slow"]));
    assert_eq!(pending.await.unwrap(), Err(QueryError::Cancelled));
    assert!(!client.is_fetching());
    assert_eq!(client.get_query_data(&query_key!["slow"]), Some(1));

    let results = client.reset_queries(QueryFilters::key(query_key!["slow"])).await;
    assert!(results.is_empty());
    assert!(client.get_query_state(&query_key!["slow"]).unwrap().is_pending());

    client.remove_queries(QueryFilters::key(query_key!["slow"]));
    assert!(client.get_query(&query_key!["slow"]).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_reconnect_and_focus_sweeps() {
    let client: QueryClient<u32, String> = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let observer = client.observer(counting(&client, query_key!["a"], &calls));
    observer.start();
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Unobserved and opted-out queries are left alone
    client.fetch_query(counting(&client, query_key!["b"], &calls)).await.unwrap();
    let quiet = client.observer(
      counting(&client, query_key!["c"], &calls)
        .refetch_on_reconnect(false)
        .refetch_on_window_focus(false),
    );
    quiet.start();
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    assert_eq!(client.set_online(true), 0);
    assert_eq!(client.set_online(false), 0);
    assert!(!client.is_online());
    assert_eq!(client.set_online(true), 1);
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    assert_eq!(client.set_focused(false), 0);
    assert_eq!(client.set_focused(true), 1);
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 5);
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_fetch_pauses_until_reconnect() {
    let client: QueryClient<u32, String> = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    client.set_online(false);

    let pending = tokio::spawn({
      let client = client.clone();
      let options = counting(&client, query_key!["a"], &calls);
      async move { client.fetch_query(options).await }
    });
    settle().await;
    let state = client.get_query_state(&query_key!["a"]).unwrap();
    assert_eq!(state.fetch_status, FetchStatus::Paused);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    client.set_online(true);
    assert_eq!(pending.await.unwrap(), Ok(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_persistence_round_trip() {
    let persister = Arc::new(InMemoryPersister::new());
    let client = Client::builder().persister(persister.clone()).build();
    client
      .register_persistence(query_key!["todos"], PersistOptions::json())
      .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let original = client.fetch_query(todos_options(&client, &calls)).await.unwrap();
    settle().await;
    let fetched_at = client.get_query_state(&query_key!["todos"]).unwrap().data_updated_at;
    assert_eq!(persister.len(), 1);
    assert_eq!(client.dehydrate().len(), 1);

    client.clear();
    assert!(client.get_query_data(&query_key!["todos"]).is_none());

    assert_eq!(client.hydrate().await.unwrap(), 1);
    let state = client.get_query_state(&query_key!["todos"]).unwrap();
    assert_eq!(state.data, Some(original));
    assert_eq!(state.data_updated_at, fetched_at);

    client.unpersist(&query_key!["todos"]).await.unwrap();
    assert!(persister.is_empty());
  }

  #[tokio::test]
  async fn test_persistence_needs_a_persister() {
    let client = Client::new();
    assert!(client
      .register_persistence(query_key!["todos"], PersistOptions::json())
      .is_err());
    assert_eq!(client.hydrate().await.unwrap(), 0);
    assert!(client.dehydrate().is_empty());
    client.clear_persistence().await.unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn test_mutation_counts() {
    let client: QueryClient<u32, String> = QueryClient::new();
    let mutation = client.build_mutation(
      client
        .mutation_options::<u32, u32, ()>()
        .mutation_fn(|n: u32| async move {
          tokio::time::sleep(Duration::from_secs(1)).await;
          Ok(n * 2)
        }),
    );

    let running = tokio::spawn({
      let mutation = mutation.clone();
      async move { mutation.mutate(21).await }
    });
    settle().await;
    assert!(client.is_mutating());
    assert_eq!(client.mutating_count(), 1);

    assert_eq!(running.await.unwrap(), Ok(42));
    assert!(!client.is_mutating());
    assert_eq!(client.mutation_cache().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_infinite_queries_are_registered_by_key() {
    let client: QueryClient<Vec<u32>, String> = QueryClient::new();
    let options = || {
      InfiniteQueryOptions::<Vec<u32>, String, KeyPart>::new(
        query_key!["feed"],
        KeyPart::Int(0),
        |ctx| async move {
          let page = ctx.page_param.and_then(|p| p.as_i64()).unwrap_or(0) as u32;
          Ok(vec![page * 10, page * 10 + 1])
        },
        |_, data| Some(KeyPart::Int(data.len() as i64)),
      )
    };

    let feed = client.get_infinite_query(options());
    assert!(Arc::ptr_eq(&feed, &client.get_infinite_query(options())));

    feed.fetch(false).await.unwrap();
    let data = feed.fetch_next_page().await.unwrap();
    assert_eq!(data.pages, vec![vec![0, 1], vec![10, 11]]);

    assert!(client.remove_infinite_query(&query_key!["feed"]));
    assert!(!Arc::ptr_eq(&feed, &client.get_infinite_query(options())));
  }

  #[tokio::test(start_paused = true)]
  async fn test_idle_infinite_query_leaves_registry() {
    let client: QueryClient<u32, String> = QueryClient::new();
    let options = || {
      InfiniteQueryOptions::<u32, String, KeyPart>::new(query_key!["inbox"], KeyPart::Int(0), |_| async { Ok(1) }, |_, _| None)
        .cache_time(Duration::from_secs(60))
    };

    let inbox = client.get_infinite_query(options());
    let sub = inbox.subscribe(|_| {});
    inbox.fetch(false).await.unwrap();

    // Subscribed queries are never evicted
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(Arc::ptr_eq(&inbox, &client.get_infinite_query(options())));

    drop(sub);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(Arc::ptr_eq(&inbox, &client.get_infinite_query(options())));
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(!Arc::ptr_eq(&inbox, &client.get_infinite_query(options())));
  }

  #[tokio::test(start_paused = true)]
  async fn test_clear_and_dispose() {
    let persister = Arc::new(InMemoryPersister::new());
    let client: QueryClient<u32, String> = QueryClient::builder().persister(persister).build();
    client.set_query_data(query_key!["a"], 1);
    client.build_mutation(client.mutation_options::<u32, u32, ()>());
    assert_eq!(client.query_cache().len(), 1);

    client.clear();
    assert!(client.query_cache().is_empty());
    assert!(client.mutation_cache().is_empty());

    client.set_query_data(query_key!["b"], 2);
    client.dispose().await.unwrap();
    assert!(client.query_cache().is_empty());
  }
}
