//! One consumer's live view of a query.
//!
//! A [`QueryObserver`] joins its options into the shared query's merge set,
//! decides whether mounting warrants a fetch, runs its own poll timer and
//! turns every [`QueryState`] transition into a [`QueryObserverResult`].

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::trace;

use crate::cache::QueryCache;
use crate::error::QueryResult;
use crate::options::{QueryFn, QueryOptions};
use crate::query::Query;
use crate::state::{FetchStatus, QueryState, QueryStatus};
use crate::subscription::{Listener, ObserverId, Subscription};
use crate::Payload;

/// The derived view an observer hands to its listeners.
pub struct QueryObserverResult<T, E> {
  pub data: Option<T>,
  pub error: Option<E>,
  pub status: QueryStatus,
  pub fetch_status: FetchStatus,
  /// No data yet and a fetch is running.
  pub is_loading: bool,
  pub is_fetching: bool,
  pub is_pending: bool,
  pub is_error: bool,
  pub is_success: bool,
  /// Success and fetching.
  pub is_refetching: bool,
  pub is_stale: bool,
  pub is_paused: bool,
  /// `data` is the observer's placeholder, not cached data.
  pub is_placeholder_data: bool,
  pub data_update_count: u64,
  pub error_update_count: u64,
  pub data_updated_at: Option<DateTime<Utc>>,
  pub error_updated_at: Option<DateTime<Utc>>,
  pub failure_count: u32,
  pub failure_reason: Option<E>,
  query: Arc<Query<T, E>>,
  query_fn: Option<QueryFn<T, E>>,
}

impl<T: Payload, E: Payload> QueryObserverResult<T, E> {
  fn new(
    query: &Arc<Query<T, E>>,
    options: &QueryOptions<T, E>,
    state: QueryState<T, E>,
  ) -> Self {
    let is_stale = query.is_stale();
    let placeholder = match (&state.data, &options.placeholder_data) {
      (None, Some(placeholder)) if state.is_pending() => Some(placeholder.clone()),
      _ => None,
    };
    let is_placeholder_data = placeholder.is_some();
    let status = if is_placeholder_data {
      QueryStatus::Success
    } else {
      state.status
    };
    let is_fetching = state.fetch_status == FetchStatus::Fetching;

    Self {
      data: placeholder.or(state.data),
      error: state.error,
      status,
      fetch_status: state.fetch_status,
      is_loading: status == QueryStatus::Pending && is_fetching,
      is_fetching,
      is_pending: status == QueryStatus::Pending,
      is_error: status == QueryStatus::Error,
      is_success: status == QueryStatus::Success,
      is_refetching: status == QueryStatus::Success && is_fetching,
      is_stale,
      is_paused: state.fetch_status == FetchStatus::Paused,
      is_placeholder_data,
      data_update_count: state.data_update_count,
      error_update_count: state.error_update_count,
      data_updated_at: state.data_updated_at,
      error_updated_at: state.error_updated_at,
      failure_count: state.fetch_failure_count,
      failure_reason: state.fetch_failure_reason,
      query: Arc::clone(query),
      query_fn: options.query_fn.clone(),
    }
  }

  /// Force a fetch of the query this result was computed from.
  pub async fn refetch(&self) -> QueryResult<T, E> {
    self.query.fetch(self.query_fn.clone(), true).await
  }
}

impl<T: Clone, E: Clone> Clone for QueryObserverResult<T, E> {
  fn clone(&self) -> Self {
    Self {
      data: self.data.clone(),
      error: self.error.clone(),
      status: self.status,
      fetch_status: self.fetch_status,
      is_loading: self.is_loading,
      is_fetching: self.is_fetching,
      is_pending: self.is_pending,
      is_error: self.is_error,
      is_success: self.is_success,
      is_refetching: self.is_refetching,
      is_stale: self.is_stale,
      is_paused: self.is_paused,
      is_placeholder_data: self.is_placeholder_data,
      data_update_count: self.data_update_count,
      error_update_count: self.error_update_count,
      data_updated_at: self.data_updated_at,
      error_updated_at: self.error_updated_at,
      failure_count: self.failure_count,
      failure_reason: self.failure_reason.clone(),
      query: Arc::clone(&self.query),
      query_fn: self.query_fn.clone(),
    }
  }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for QueryObserverResult<T, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryObserverResult")
      .field("data", &self.data)
      .field("error", &self.error)
      .field("status", &self.status)
      .field("fetch_status", &self.fetch_status)
      .field("is_stale", &self.is_stale)
      .field("is_placeholder_data", &self.is_placeholder_data)
      .finish_non_exhaustive()
  }
}

struct Inner<T, E> {
  options: QueryOptions<T, E>,
  query: Arc<Query<T, E>>,
  started: bool,
  poll_task: Option<JoinHandle<()>>,
  listeners: Vec<(ObserverId, Listener<QueryObserverResult<T, E>>)>,
}

struct Shared<T, E> {
  id: ObserverId,
  cache: QueryCache<T, E>,
  inner: Mutex<Inner<T, E>>,
}

impl<T: Payload, E: Payload> Shared<T, E> {
  fn current(&self) -> (Arc<Query<T, E>>, QueryOptions<T, E>) {
    let inner = self.inner.lock();
    (Arc::clone(&inner.query), inner.options.clone())
  }

  fn on_query_update(&self, hash: &str, state: &QueryState<T, E>) {
    let (query, options, listeners) = {
      let inner = self.inner.lock();
      if inner.query.hash() != hash {
        return;
      }
      let listeners: Vec<_> = inner.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
      (Arc::clone(&inner.query), inner.options.clone(), listeners)
    };
    if listeners.is_empty() {
      return;
    }
    let result = QueryObserverResult::new(&query, &options, state.clone());
    for listener in listeners {
      listener(&result);
    }
  }

  fn notify_current(&self) {
    let (query, _) = self.current();
    self.on_query_update(query.hash(), &query.state());
  }
}

/// A consumer's subscription to one query key.
///
/// Dropping the observer detaches it and stops its poll timer.
pub struct QueryObserver<T: Payload, E: Payload> {
  shared: Arc<Shared<T, E>>,
}

impl<T: Payload, E: Payload> QueryObserver<T, E> {
  /// Create an observer. Nothing is attached or fetched until [`start`](Self::start).
  pub fn new(cache: &QueryCache<T, E>, options: QueryOptions<T, E>) -> Self {
    let query = cache.build(options.clone(), None);
    Self {
      shared: Arc::new(Shared {
        id: ObserverId::next(),
        cache: cache.clone(),
        inner: Mutex::new(Inner {
          options,
          query,
          started: false,
          poll_task: None,
          listeners: Vec::new(),
        }),
      }),
    }
  }

  pub fn id(&self) -> ObserverId {
    self.shared.id
  }

  /// Attach to the query, fetch if mounting calls for it and start polling.
  ///
  /// Starting an already started observer only returns its current result.
  pub fn start(&self) -> QueryObserverResult<T, E> {
    let options = {
      let inner = self.shared.inner.lock();
      (!inner.started).then(|| inner.options.clone())
    };
    let Some(options) = options else {
      return self.get_current_result();
    };

    // The query resolved at construction may have been evicted since
    let query = self.shared.cache.build(options.clone(), None);
    let mounted = {
      let mut inner = self.shared.inner.lock();
      if inner.started {
        false
      } else {
        inner.started = true;
        inner.query = Arc::clone(&query);
        true
      }
    };

    if mounted {
      self.attach(&query, &options);
      self.fetch_on_mount(&query, &options);
      self.reschedule_poll();
    }
    self.get_current_result()
  }

  fn attach(&self, query: &Arc<Query<T, E>>, options: &QueryOptions<T, E>) {
    query.add_observer_options(self.shared.id, options.clone());
    let shared = Arc::downgrade(&self.shared);
    let hash = query.hash().to_string();
    query.add_observer(
      self.shared.id,
      Arc::new(move |state: &QueryState<T, E>| {
        if let Some(shared) = shared.upgrade() {
          shared.on_query_update(&hash, state);
        }
      }),
    );
  }

  fn detach(&self, query: &Query<T, E>) {
    query.remove_observer(self.shared.id);
    query.remove_observer_options(self.shared.id);
  }

  fn fetch_on_mount(&self, query: &Arc<Query<T, E>>, options: &QueryOptions<T, E>) {
    if !options.enabled {
      return;
    }
    let state = query.state();
    let wanted = !state.has_data() || (options.refetch_on_mount && query.is_stale());
    if !wanted || state.is_fetching() {
      return;
    }
    spawn_fetch(Arc::clone(query), options.query_fn.clone(), false);
  }

  /// The result as of now, computed from the query's current state.
  pub fn get_current_result(&self) -> QueryObserverResult<T, E> {
    let (query, options) = self.shared.current();
    let state = query.state();
    QueryObserverResult::new(&query, &options, state)
  }

  /// The query currently observed.
  pub fn query(&self) -> Arc<Query<T, E>> {
    self.shared.current().0
  }

  pub fn options(&self) -> QueryOptions<T, E> {
    self.shared.current().1
  }

  /// Called with a fresh result on every state transition of the query.
  pub fn subscribe(
    &self,
    listener: impl Fn(&QueryObserverResult<T, E>) + Send + Sync + 'static,
  ) -> Subscription {
    let id = ObserverId::next();
    self.shared.inner.lock().listeners.push((id, Arc::new(listener)));
    let shared: Weak<Shared<T, E>> = Arc::downgrade(&self.shared);
    Subscription::new(move || {
      if let Some(shared) = shared.upgrade() {
        shared.inner.lock().listeners.retain(|(lid, _)| *lid != id);
      }
    })
  }

  /// Replace this observer's options.
  ///
  /// A new key moves the observer to that key's query. A changed poll
  /// interval or enabled flag restarts the poll timer.
  pub fn set_options(&self, options: QueryOptions<T, E>) {
    let (old_query, old_options, started) = {
      let mut inner = self.shared.inner.lock();
      let old = std::mem::replace(&mut inner.options, options.clone());
      (Arc::clone(&inner.query), old, inner.started)
    };

    let key_changed = old_options.key != options.key;
    if key_changed {
      let query = self.shared.cache.build(options.clone(), None);
      self.shared.inner.lock().query = Arc::clone(&query);
      if started {
        self.detach(&old_query);
        self.attach(&query, &options);
        self.fetch_on_mount(&query, &options);
        self.shared.notify_current();
      }
    } else if started {
      old_query.add_observer_options(self.shared.id, options.clone());
      if !old_options.enabled && options.enabled {
        self.fetch_on_mount(&old_query, &options);
      }
    }

    let poll_changed = old_options.poll_interval() != options.poll_interval()
      || old_options.enabled != options.enabled;
    if started && (key_changed || poll_changed) {
      self.reschedule_poll();
    }
  }

  /// Force a fetch, cancelling any fetch in flight for the query.
  pub async fn refetch(&self) -> QueryResult<T, E> {
    let (query, options) = self.shared.current();
    query.fetch(options.query_fn, true).await
  }

  fn reschedule_poll(&self) {
    let mut inner = self.shared.inner.lock();
    if let Some(task) = inner.poll_task.take() {
      task.abort();
    }
    if !inner.started || !inner.options.enabled {
      return;
    }
    let Some(period) = inner.options.poll_interval() else {
      return;
    };
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      return;
    };
    inner.poll_task = Some(runtime.spawn(poll(Arc::downgrade(&self.shared), period)));
  }

  /// Detach from the query and stop polling. Listeners are dropped.
  pub fn destroy(&self) {
    let query = {
      let mut inner = self.shared.inner.lock();
      if let Some(task) = inner.poll_task.take() {
        task.abort();
      }
      inner.listeners.clear();
      let started = std::mem::replace(&mut inner.started, false);
      started.then(|| Arc::clone(&inner.query))
    };
    if let Some(query) = query {
      self.detach(&query);
    }
  }
}

impl<T: Payload, E: Payload> Drop for QueryObserver<T, E> {
  fn drop(&mut self) {
    self.destroy();
  }
}

impl<T: Payload, E: Payload> fmt::Debug for QueryObserver<T, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let inner = self.shared.inner.lock();
    f.debug_struct("QueryObserver")
      .field("id", &self.shared.id)
      .field("key", &inner.query.hash())
      .field("started", &inner.started)
      .field("polling", &inner.poll_task.is_some())
      .finish_non_exhaustive()
  }
}

fn spawn_fetch<T: Payload, E: Payload>(
  query: Arc<Query<T, E>>,
  query_fn: Option<QueryFn<T, E>>,
  force: bool,
) {
  let Ok(runtime) = tokio::runtime::Handle::try_current() else {
    trace!(key = %query.hash(), "no runtime, skipping fetch");
    return;
  };
  runtime.spawn(async move {
    // The outcome lands in the query state
    let _ = query.fetch(query_fn, force).await;
  });
}

async fn poll<T: Payload, E: Payload>(shared: Weak<Shared<T, E>>, period: Duration) {
  let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  loop {
    ticker.tick().await;
    let Some((query, options)) = shared.upgrade().map(|shared| shared.current()) else {
      break;
    };
    if query.is_fetching() {
      continue;
    }
    trace!(key = %query.hash(), "poll tick");
    let _ = query.fetch(options.query_fn, true).await;
  }
}
