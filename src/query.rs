//! The per-key query state machine.
//!
//! Inspired by TanStack Query, a [`Query`] owns one key's state, runs at most
//! one fetch at a time, tracks staleness, merges the options of the
//! observers attached to it and schedules its own eviction.
//!
//! # Example
//!
//! ```ignore
//! let query = Query::new(
//!   QueryOptions::new(query_key!["todos", { "done" => false }])
//!     .query_fn(move |ctx| {
//!       let api = api.clone();
//!       async move { api.open_todos(ctx.signal).await }
//!     })
//!     .stale_time(Duration::from_secs(60)),
//! );
//!
//! // Concurrent callers share one in-flight fetch
//! let todos = query.fetch(None, false).await?;
//! ```

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::cache::QueryCacheEvent;
use crate::cancel::CancellationToken;
use crate::error::{QueryError, QueryResult};
use crate::key::QueryKey;
use crate::options::{QueryFn, QueryFnContext, QueryOptions, StaleTime};
use crate::retry::{RetryEvents, Retryer};
use crate::state::{FetchStatus, QueryState};
use crate::subscription::{Listener, ObserverId, Subscription};
use crate::Payload;

type SharedFetch<T, E> = Shared<BoxFuture<'static, QueryResult<T, E>>>;

/// Called when the eviction timer fires with no observers attached.
pub type EvictHook<T, E> = Arc<dyn Fn(&Arc<Query<T, E>>) + Send + Sync>;

/// Called after a fetch settles with success or a final error.
pub type SettledHook<T, E> = Arc<dyn Fn(&Query<T, E>, &QueryState<T, E>) + Send + Sync>;

/// Wiring a query receives from the cache that owns it.
pub struct QueryHooks<T, E> {
  pub events: Option<broadcast::Sender<QueryCacheEvent>>,
  pub on_evict: Option<EvictHook<T, E>>,
  pub on_settled: Option<SettledHook<T, E>>,
  pub online: Option<watch::Receiver<bool>>,
}

impl<T, E> Default for QueryHooks<T, E> {
  fn default() -> Self {
    Self {
      events: None,
      on_evict: None,
      on_settled: None,
      online: None,
    }
  }
}

/// Error fields to restore when a fetch is cancelled.
pub(crate) struct Revert<E> {
  error: Option<E>,
  fetch_failure_count: u32,
  fetch_failure_reason: Option<E>,
}

impl<E: Clone> Revert<E> {
  pub(crate) fn capture<T>(state: &QueryState<T, E>) -> Self {
    Self {
      error: state.error.clone(),
      fetch_failure_count: state.fetch_failure_count,
      fetch_failure_reason: state.fetch_failure_reason.clone(),
    }
  }
}

struct InFlight<T, E> {
  id: u64,
  token: CancellationToken,
  result: SharedFetch<T, E>,
  revert: Revert<E>,
}

struct Inner<T, E> {
  state: QueryState<T, E>,
  /// Options given when the query was built, used when nobody observes it.
  base_options: QueryOptions<T, E>,
  /// Merged options; kept as-is when the last observer leaves.
  options: QueryOptions<T, E>,
  observer_options: Vec<(ObserverId, QueryOptions<T, E>)>,
  observers: Vec<(ObserverId, Listener<QueryState<T, E>>)>,
  in_flight: Option<InFlight<T, E>>,
  gc_task: Option<JoinHandle<()>>,
  next_fetch_id: u64,
}

impl<T, E> Inner<T, E> {
  fn listeners(&self) -> Vec<Listener<QueryState<T, E>>> {
    self.observers.iter().map(|(_, l)| Arc::clone(l)).collect()
  }
}

enum FetchStart<T, E> {
  Cached(T),
  Flight(SharedFetch<T, E>),
}

/// One key's shared state.
pub struct Query<T, E> {
  key: QueryKey,
  hash: String,
  this: Weak<Query<T, E>>,
  hooks: QueryHooks<T, E>,
  inner: Mutex<Inner<T, E>>,
}

impl<T: Payload, E: Payload> Query<T, E> {
  /// Create a standalone query, not registered in any cache.
  pub fn new(options: QueryOptions<T, E>) -> Arc<Self> {
    Self::with_hooks(options, None, QueryHooks::default())
  }

  pub(crate) fn with_hooks(
    options: QueryOptions<T, E>,
    initial_state: Option<QueryState<T, E>>,
    hooks: QueryHooks<T, E>,
  ) -> Arc<Self> {
    let state = initial_state.unwrap_or_else(|| {
      QueryState::initial(
        options.initial_data.clone(),
        options.initial_data_updated_at,
      )
    });
    let key = options.key.clone();
    let hash = key.hash();

    let query = Arc::new_cyclic(|this| Self {
      key,
      hash,
      this: this.clone(),
      hooks,
      inner: Mutex::new(Inner {
        state,
        base_options: options.clone(),
        options,
        observer_options: Vec::new(),
        observers: Vec::new(),
        in_flight: None,
        gc_task: None,
        next_fetch_id: 0,
      }),
    });

    {
      let mut inner = query.inner.lock();
      query.schedule_gc(&mut inner);
    }
    query
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Canonical key hash; the query's identity in a cache.
  pub fn hash(&self) -> &str {
    &self.hash
  }

  pub fn state(&self) -> QueryState<T, E> {
    self.inner.lock().state.clone()
  }

  pub fn data(&self) -> Option<T> {
    self.inner.lock().state.data.clone()
  }

  /// The currently merged options.
  pub fn options(&self) -> QueryOptions<T, E> {
    self.inner.lock().options.clone()
  }

  pub fn observer_count(&self) -> usize {
    self.inner.lock().observers.len()
  }

  /// At least one observer and the merged options are enabled.
  pub fn is_active(&self) -> bool {
    let inner = self.inner.lock();
    !inner.observers.is_empty() && inner.options.enabled
  }

  pub fn is_fetching(&self) -> bool {
    self.inner.lock().in_flight.is_some()
  }

  pub fn is_stale(&self) -> bool {
    let inner = self.inner.lock();
    is_stale(&inner.state, inner.options.stale_time)
  }

  /// Staleness judged against a caller-provided stale time.
  pub fn is_stale_by(&self, stale_time: StaleTime) -> bool {
    is_stale(&self.inner.lock().state, stale_time)
  }

  /// Replace the options used while no observer is attached.
  ///
  /// With observers attached, only a missing fetch function is filled in.
  pub fn set_base_options(&self, mut options: QueryOptions<T, E>) {
    let mut inner = self.inner.lock();
    if options.query_fn.is_none() {
      options.query_fn = inner.base_options.query_fn.clone();
    }
    if inner.observer_options.is_empty() {
      inner.options = options.clone();
    } else if inner.options.query_fn.is_none() {
      inner.options.query_fn = options.query_fn.clone();
    }
    inner.base_options = options;
  }

  /// Join (or update) the option merge set.
  pub fn add_observer_options(&self, id: ObserverId, options: QueryOptions<T, E>) {
    let mut inner = self.inner.lock();
    match inner.observer_options.iter_mut().find(|(oid, _)| *oid == id) {
      Some((_, existing)) => *existing = options,
      None => inner.observer_options.push((id, options)),
    }
    remerge(&mut inner);
  }

  pub fn remove_observer_options(&self, id: ObserverId) {
    let mut inner = self.inner.lock();
    inner.observer_options.retain(|(oid, _)| *oid != id);
    remerge(&mut inner);
  }

  /// Attach a state listener. Cancels any pending eviction.
  pub fn add_observer(&self, id: ObserverId, listener: Listener<QueryState<T, E>>) {
    let observers = {
      let mut inner = self.inner.lock();
      if let Some(task) = inner.gc_task.take() {
        task.abort();
      }
      inner.observers.push((id, listener));
      inner.observers.len()
    };
    self.emit(QueryCacheEvent::ObserverAdded {
      hash: self.hash.clone(),
      observers,
    });
  }

  /// Detach a state listener. The last one out starts the eviction timer.
  pub fn remove_observer(&self, id: ObserverId) {
    let observers = {
      let mut inner = self.inner.lock();
      let before = inner.observers.len();
      inner.observers.retain(|(oid, _)| *oid != id);
      if inner.observers.len() == before {
        return;
      }
      if inner.observers.is_empty() {
        self.schedule_gc(&mut inner);
      }
      inner.observers.len()
    };
    self.emit(QueryCacheEvent::ObserverRemoved {
      hash: self.hash.clone(),
      observers,
    });
  }

  /// Listen to every state transition until the subscription is dropped.
  pub fn subscribe(
    &self,
    listener: impl Fn(&QueryState<T, E>) + Send + Sync + 'static,
  ) -> Subscription {
    let id = ObserverId::next();
    self.add_observer(id, Arc::new(listener));
    let this = self.this.clone();
    Subscription::new(move || {
      if let Some(query) = this.upgrade() {
        query.remove_observer(id);
      }
    })
  }

  /// Fetch unless fresh data exists or a fetch is already running.
  ///
  /// Without `force`, an in-flight fetch is joined and fresh data is returned
  /// without I/O. With `force`, any in-flight fetch is cancelled and a new
  /// one starts. `query_fn` overrides the merged fetch function.
  pub async fn fetch(
    self: &Arc<Self>,
    query_fn: Option<QueryFn<T, E>>,
    force: bool,
  ) -> QueryResult<T, E> {
    match self.start_fetch(query_fn, force)? {
      FetchStart::Cached(data) => Ok(data),
      FetchStart::Flight(result) => result.await,
    }
  }

  /// Force a fresh fetch with the merged fetch function.
  pub async fn refetch(self: &Arc<Self>) -> QueryResult<T, E> {
    self.fetch(None, true).await
  }

  fn start_fetch(
    self: &Arc<Self>,
    query_fn: Option<QueryFn<T, E>>,
    force: bool,
  ) -> Result<FetchStart<T, E>, QueryError<E>> {
    let (tx, rx) = oneshot::channel();

    let (superseded, state, listeners, job) = {
      let mut inner = self.inner.lock();

      if !force {
        if let Some(flight) = &inner.in_flight {
          trace!(key = %self.hash, "joining in-flight fetch");
          return Ok(FetchStart::Flight(flight.result.clone()));
        }
        if !is_stale(&inner.state, inner.options.stale_time) {
          if let Some(data) = &inner.state.data {
            trace!(key = %self.hash, "serving fresh data");
            return Ok(FetchStart::Cached(data.clone()));
          }
        }
      }

      let query_fn = query_fn
        .or_else(|| inner.options.query_fn.clone())
        .ok_or_else(|| QueryError::MissingQueryFn {
          key: self.hash.clone(),
        })?;

      let superseded = inner.in_flight.take().map(|flight| flight.token);

      inner.next_fetch_id += 1;
      let id = inner.next_fetch_id;
      let token = CancellationToken::new();

      let mut retryer = Retryer::new(inner.options.retry.clone(), inner.options.retry_delay.clone())
        .with_token(token.clone());
      if let Some(online) = &self.hooks.online {
        retryer = retryer.with_online(online.clone());
      }
      let ctx = QueryFnContext {
        key: self.key.clone(),
        page_param: None,
        signal: token.clone(),
        meta: inner.options.meta.clone(),
      };

      let result = async move {
        rx.await
          .unwrap_or_else(|_| Err(QueryError::Aborted("fetch task dropped".to_string())))
      }
      .boxed()
      .shared();

      let revert = Revert::capture(&inner.state);
      inner.in_flight = Some(InFlight {
        id,
        token: token.clone(),
        result: result.clone(),
        revert,
      });
      inner.state = inner.state.with_fetching();

      (
        superseded,
        inner.state.clone(),
        inner.listeners(),
        (id, token, retryer, query_fn, ctx, result),
      )
    };

    if let Some(token) = superseded {
      debug!(key = %self.hash, "cancelling superseded fetch");
      token.cancel();
    }
    self.publish(&state, listeners);

    let (id, token, retryer, query_fn, ctx, result) = job;
    let query = Arc::clone(self);
    tokio::spawn(async move {
      let outcome = AssertUnwindSafe(query.run_fetch(id, token, retryer, query_fn, ctx))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| query.abandon(id));
      let _ = tx.send(outcome);
    });

    Ok(FetchStart::Flight(result))
  }

  async fn run_fetch(
    &self,
    id: u64,
    token: CancellationToken,
    retryer: Retryer<E>,
    query_fn: QueryFn<T, E>,
    ctx: QueryFnContext,
  ) -> QueryResult<T, E> {
    debug!(key = %self.hash, fetch = id, "fetch started");
    let mut events = FetchEvents { query: self, id };
    let result = retryer.run(|| query_fn(ctx.clone()), &mut events).await;
    self.settle(id, &token, result)
  }

  /// Commit a finished fetch, unless it was cancelled or superseded.
  fn settle(&self, id: u64, token: &CancellationToken, result: QueryResult<T, E>) -> QueryResult<T, E> {
    let mut inner = self.inner.lock();
    let current = inner.in_flight.as_ref().is_some_and(|flight| flight.id == id);

    if !current || token.is_cancelled() || matches!(result, Err(QueryError::Cancelled)) {
      if current {
        let flight = inner.in_flight.take();
        if let Some(flight) = flight {
          inner.state = reverted(&inner.state, flight.revert);
        }
        let (state, listeners) = (inner.state.clone(), inner.listeners());
        drop(inner);
        self.publish(&state, listeners);
      }
      debug!(key = %self.hash, fetch = id, "fetch cancelled");
      return Err(QueryError::Cancelled);
    }

    inner.in_flight = None;
    let now = Utc::now();
    match &result {
      Ok(data) => {
        inner.state = inner.state.with_success(data.clone(), now);
        debug!(key = %self.hash, fetch = id, "fetch succeeded");
      }
      Err(QueryError::Failed(error)) => {
        inner.state = inner.state.with_error(error.clone(), now);
        debug!(key = %self.hash, fetch = id, failures = inner.state.fetch_failure_count, "fetch failed");
      }
      Err(_) => {
        inner.state = inner.state.with_fetch_status(FetchStatus::Idle);
      }
    }
    if inner.observers.is_empty() {
      self.schedule_gc(&mut inner);
    }
    let (state, listeners) = (inner.state.clone(), inner.listeners());
    drop(inner);

    self.publish(&state, listeners);
    if matches!(result, Ok(_) | Err(QueryError::Failed(_))) {
      if let Some(hook) = &self.hooks.on_settled {
        hook(self, &state);
      }
    }
    result
  }

  /// Clear fetch `id` after its task panicked, restoring the pre-fetch state.
  fn abandon(&self, id: u64) -> QueryResult<T, E> {
    warn!(key = %self.hash, fetch = id, "fetch task panicked");
    let mut inner = self.inner.lock();
    if inner.in_flight.as_ref().is_some_and(|flight| flight.id == id) {
      if let Some(flight) = inner.in_flight.take() {
        inner.state = reverted(&inner.state, flight.revert);
      }
      if inner.observers.is_empty() {
        self.schedule_gc(&mut inner);
      }
      let (state, listeners) = (inner.state.clone(), inner.listeners());
      drop(inner);
      self.publish(&state, listeners);
    }
    Err(QueryError::Aborted("fetch task panicked".to_string()))
  }

  /// Apply `f` to the state if fetch `id` is still the current one.
  fn update_flight(&self, id: u64, f: impl FnOnce(&QueryState<T, E>) -> QueryState<T, E>) {
    let (state, listeners) = {
      let mut inner = self.inner.lock();
      if !inner.in_flight.as_ref().is_some_and(|flight| flight.id == id) {
        return;
      }
      inner.state = f(&inner.state);
      (inner.state.clone(), inner.listeners())
    };
    self.publish(&state, listeners);
  }

  /// Cancel the running fetch, if any. Data and error are left as they were
  /// before the fetch started.
  pub fn cancel(&self) {
    let (token, state, listeners) = {
      let mut inner = self.inner.lock();
      let Some(flight) = inner.in_flight.take() else {
        return;
      };
      inner.state = reverted(&inner.state, flight.revert);
      if inner.observers.is_empty() {
        self.schedule_gc(&mut inner);
      }
      (flight.token, inner.state.clone(), inner.listeners())
    };
    debug!(key = %self.hash, "cancelling fetch");
    token.cancel();
    self.publish(&state, listeners);
  }

  /// Mark the data stale. Does not fetch.
  pub fn invalidate(&self) {
    let (state, listeners) = {
      let mut inner = self.inner.lock();
      inner.state = inner.state.invalidated();
      (inner.state.clone(), inner.listeners())
    };
    self.publish(&state, listeners);
  }

  /// Cancel any fetch and return to the never-fetched state.
  pub fn reset(&self) {
    let (token, state, listeners) = {
      let mut inner = self.inner.lock();
      let token = inner.in_flight.take().map(|flight| flight.token);
      inner.state = QueryState::initial(
        inner.options.initial_data.clone(),
        inner.options.initial_data_updated_at,
      );
      (token, inner.state.clone(), inner.listeners())
    };
    if let Some(token) = token {
      token.cancel();
    }
    self.publish(&state, listeners);
  }

  /// Install data directly, as if fetched at `updated_at` (default: now).
  pub fn set_data(&self, data: T, updated_at: Option<DateTime<Utc>>) {
    let (state, listeners) = {
      let mut inner = self.inner.lock();
      let fetch_status = inner.state.fetch_status;
      inner.state = inner
        .state
        .with_success(data, updated_at.unwrap_or_else(Utc::now))
        .with_fetch_status(fetch_status);
      (inner.state.clone(), inner.listeners())
    };
    self.publish(&state, listeners);
  }

  /// Tear down: cancel the fetch, stop the eviction timer, drop observers.
  pub(crate) fn destroy(&self) {
    let token = {
      let mut inner = self.inner.lock();
      if let Some(task) = inner.gc_task.take() {
        task.abort();
      }
      inner.observers.clear();
      inner.observer_options.clear();
      inner.in_flight.take().map(|flight| flight.token)
    };
    if let Some(token) = token {
      token.cancel();
    }
  }

  fn schedule_gc(&self, inner: &mut Inner<T, E>) {
    if let Some(task) = inner.gc_task.take() {
      task.abort();
    }
    let Some(delay) = inner.options.cache_time.duration() else {
      return;
    };
    // Eviction needs a runtime; without one the query lives until removed
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      return;
    };

    let this = self.this.clone();
    inner.gc_task = Some(runtime.spawn(async move {
      tokio::time::sleep(delay).await;
      if let Some(query) = this.upgrade() {
        query.try_evict();
      }
    }));
  }

  fn try_evict(self: &Arc<Self>) {
    {
      let mut inner = self.inner.lock();
      inner.gc_task = None;
      if !inner.observers.is_empty() || inner.in_flight.is_some() {
        return;
      }
    }
    debug!(key = %self.hash, "evicting unobserved query");
    if let Some(hook) = &self.hooks.on_evict {
      hook(self);
    }
  }

  fn publish(&self, state: &QueryState<T, E>, listeners: Vec<Listener<QueryState<T, E>>>) {
    for listener in listeners {
      listener(state);
    }
    self.emit(QueryCacheEvent::Updated {
      hash: self.hash.clone(),
      status: state.status,
      fetch_status: state.fetch_status,
    });
  }

  fn emit(&self, event: QueryCacheEvent) {
    if let Some(events) = &self.hooks.events {
      // No receivers is fine
      let _ = events.send(event);
    }
  }
}

impl<T, E> Drop for Query<T, E> {
  fn drop(&mut self) {
    if let Some(task) = self.inner.get_mut().gc_task.take() {
      task.abort();
    }
  }
}

struct FetchEvents<'a, T, E> {
  query: &'a Query<T, E>,
  id: u64,
}

impl<T: Payload, E: Payload> RetryEvents<E> for FetchEvents<'_, T, E> {
  fn on_fail(&mut self, failure_count: u32, error: &E) {
    self
      .query
      .update_flight(self.id, |state| state.with_failure(failure_count, error.clone()));
  }

  fn on_pause(&mut self) {
    self
      .query
      .update_flight(self.id, |state| state.with_fetch_status(FetchStatus::Paused));
  }

  fn on_continue(&mut self) {
    self
      .query
      .update_flight(self.id, |state| state.with_fetch_status(FetchStatus::Fetching));
  }
}

fn is_stale<T, E>(state: &QueryState<T, E>, stale_time: StaleTime) -> bool {
  if state.is_invalidated {
    return true;
  }
  match state.data_updated_at {
    Some(updated_at) => stale_time.is_stale(updated_at),
    None => true,
  }
}

pub(crate) fn reverted<T: Clone, E: Clone>(state: &QueryState<T, E>, revert: Revert<E>) -> QueryState<T, E> {
  QueryState {
    fetch_status: FetchStatus::Idle,
    error: revert.error,
    fetch_failure_count: revert.fetch_failure_count,
    fetch_failure_reason: revert.fetch_failure_reason,
    ..state.clone()
  }
}

fn remerge<T: Clone, E>(inner: &mut Inner<T, E>) {
  let Some(mut merged) = QueryOptions::merge(inner.observer_options.iter().map(|(_, o)| o)) else {
    return;
  };
  if merged.query_fn.is_none() {
    merged.query_fn = inner.base_options.query_fn.clone();
  }
  inner.options = merged;
}

impl<T, E> fmt::Debug for Query<T, E>
where
  T: fmt::Debug,
  E: fmt::Debug,
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let inner = self.inner.lock();
    f.debug_struct("Query")
      .field("key", &self.hash)
      .field("state", &inner.state)
      .field("observers", &inner.observers.len())
      .field("fetching", &inner.in_flight.is_some())
      .finish_non_exhaustive()
  }
}
