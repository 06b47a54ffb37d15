//! The key-hash registry of queries.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use super::events::QueryCacheEvent;
use super::filters::QueryFilters;
use crate::key::QueryKey;
use crate::options::QueryOptions;
use crate::query::{EvictHook, Query, QueryHooks, SettledHook};
use crate::state::QueryState;
use crate::Payload;

/// Default capacity of the cache event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

struct CacheInner<T, E> {
  queries: DashMap<String, Arc<Query<T, E>>>,
  events: broadcast::Sender<QueryCacheEvent>,
  on_settled: RwLock<Option<SettledHook<T, E>>>,
  online: Option<watch::Receiver<bool>>,
}

/// Maps canonical key hashes to shared [`Query`] instances.
///
/// Cheap to clone; clones share the same registry.
pub struct QueryCache<T, E> {
  inner: Arc<CacheInner<T, E>>,
}

impl<T: Payload, E: Payload> QueryCache<T, E> {
  pub fn new() -> Self {
    Self::with_capacity(DEFAULT_EVENT_CAPACITY, None)
  }

  /// A cache whose queries pause fetching while `online` reads `false`.
  pub fn with_capacity(event_capacity: usize, online: Option<watch::Receiver<bool>>) -> Self {
    let (events, _) = broadcast::channel(event_capacity.max(1));
    Self {
      inner: Arc::new(CacheInner {
        queries: DashMap::new(),
        events,
        on_settled: RwLock::new(None),
        online,
      }),
    }
  }

  /// Install the callback run whenever any query's fetch settles.
  pub(crate) fn set_settled_hook(&self, hook: SettledHook<T, E>) {
    *self.inner.on_settled.write() = Some(hook);
  }

  fn hooks(&self) -> QueryHooks<T, E> {
    let cache = Arc::downgrade(&self.inner);
    let on_evict: EvictHook<T, E> = Arc::new(move |query: &Arc<Query<T, E>>| {
      if let Some(inner) = cache.upgrade() {
        evict(&inner, query);
      }
    });

    let cache = Arc::downgrade(&self.inner);
    let on_settled: SettledHook<T, E> = Arc::new(move |query: &Query<T, E>, state: &QueryState<T, E>| {
      let hook = cache.upgrade().and_then(|inner| inner.on_settled.read().clone());
      if let Some(hook) = hook {
        hook(query, state);
      }
    });

    QueryHooks {
      events: Some(self.inner.events.clone()),
      on_evict: Some(on_evict),
      on_settled: Some(on_settled),
      online: self.inner.online.clone(),
    }
  }

  /// Find the query for `options.key` or create it.
  ///
  /// An existing query takes `options` as its base options. A new one starts
  /// from `initial_state` when given, else from the options' initial data.
  pub fn build(
    &self,
    options: QueryOptions<T, E>,
    initial_state: Option<QueryState<T, E>>,
  ) -> Arc<Query<T, E>> {
    let hash = options.key.hash();
    let (query, created) = match self.inner.queries.entry(hash.clone()) {
      Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
      Entry::Vacant(entry) => {
        let query = Query::with_hooks(options.clone(), initial_state, self.hooks());
        entry.insert(Arc::clone(&query));
        (query, true)
      }
    };

    if created {
      debug!(key = %hash, "query added");
      self.emit(QueryCacheEvent::Added { hash });
    } else {
      query.set_base_options(options);
    }
    query
  }

  /// Destroy a query and drop it from the registry.
  pub fn remove(&self, query: &Arc<Query<T, E>>) {
    evict(&self.inner, query);
  }

  pub fn remove_key(&self, key: &QueryKey) {
    if let Some(query) = self.find(key) {
      self.remove(&query);
    }
  }

  /// Exact lookup.
  pub fn find(&self, key: &QueryKey) -> Option<Arc<Query<T, E>>> {
    self.get(&key.hash())
  }

  pub fn get(&self, hash: &str) -> Option<Arc<Query<T, E>>> {
    self.inner.queries.get(hash).map(|entry| Arc::clone(entry.value()))
  }

  pub fn find_all(&self, filters: &QueryFilters<T, E>) -> Vec<Arc<Query<T, E>>> {
    // Collect first so filters never run under a shard lock
    self
      .all()
      .into_iter()
      .filter(|query| filters.matches(query))
      .collect()
  }

  pub fn all(&self) -> Vec<Arc<Query<T, E>>> {
    self
      .inner
      .queries
      .iter()
      .map(|entry| Arc::clone(entry.value()))
      .collect()
  }

  pub fn len(&self) -> usize {
    self.inner.queries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.inner.queries.is_empty()
  }

  pub fn get_query_data(&self, key: &QueryKey) -> Option<T> {
    self.find(key).and_then(|query| query.data())
  }

  /// Write data without fetching. A missing query is created and seeded as
  /// if the data had been fetched at `updated_at` (default: now).
  pub fn set_query_data(
    &self,
    options: QueryOptions<T, E>,
    data: T,
    updated_at: Option<DateTime<Utc>>,
  ) -> Arc<Query<T, E>> {
    match self.find(&options.key) {
      Some(query) => {
        query.set_data(data, updated_at);
        query
      }
      None => {
        let state = QueryState::default().with_success(data, updated_at.unwrap_or_else(Utc::now));
        let query = self.build(options, Some(state.clone()));
        // Lost a race against a concurrent build: write through the winner
        if query.state().data_updated_at != state.data_updated_at {
          if let Some(data) = state.data {
            query.set_data(data, state.data_updated_at);
          }
        }
        query
      }
    }
  }

  /// Remove and destroy every query.
  pub fn clear(&self) {
    for query in self.all() {
      self.remove(&query);
    }
  }

  pub fn subscribe_events(&self) -> broadcast::Receiver<QueryCacheEvent> {
    self.inner.events.subscribe()
  }

  fn emit(&self, event: QueryCacheEvent) {
    let _ = self.inner.events.send(event);
  }
}

fn evict<T: Payload, E: Payload>(inner: &CacheInner<T, E>, query: &Arc<Query<T, E>>) {
  let removed = inner
    .queries
    .remove_if(query.hash(), |_, current| Arc::ptr_eq(current, query))
    .is_some();
  if removed {
    query.destroy();
    debug!(key = %query.hash(), "query removed");
    let _ = inner.events.send(QueryCacheEvent::Removed {
      hash: query.hash().to_string(),
    });
  }
}

impl<T: Payload, E: Payload> Default for QueryCache<T, E> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T, E> Clone for QueryCache<T, E> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T, E> fmt::Debug for QueryCache<T, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryCache")
      .field("queries", &self.inner.queries.len())
      .finish_non_exhaustive()
  }
}
