//! Paginated queries that accumulate pages.
//!
//! An [`InfiniteQuery`] keeps an ordered list of pages plus the page params
//! that produced them. Page requests run one at a time through the same
//! retry and cancellation machinery as [`Query`](crate::Query), and an
//! optional page cap drops pages from the end opposite the fetch direction.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cancel::CancellationToken;
use crate::error::{QueryError, QueryResult};
use crate::key::{KeyPart, QueryKey};
use crate::options::{query_fn, CacheTime, Meta, QueryFn, QueryFnContext, StaleTime};
use crate::query::{reverted, Revert};
use crate::retry::{Retry, RetryDelay, RetryEvents, Retryer};
use crate::state::{FetchStatus, QueryState};
use crate::subscription::{Listener, ObserverId, Subscription};
use crate::Payload;

/// Pages oldest to newest, with the param each page was fetched with.
#[derive(Debug, Clone, PartialEq)]
pub struct InfiniteData<T, P = KeyPart> {
  pub pages: Vec<T>,
  pub page_params: Vec<P>,
}

impl<T, P> InfiniteData<T, P> {
  pub fn len(&self) -> usize {
    self.pages.len()
  }

  pub fn is_empty(&self) -> bool {
    self.pages.is_empty()
  }
}

impl<T, P> Default for InfiniteData<T, P> {
  fn default() -> Self {
    Self {
      pages: Vec::new(),
      page_params: Vec::new(),
    }
  }
}

/// Derives a neighbouring page param from an edge page and all loaded data.
/// `None` means there is no such page.
pub type PageParamFn<T, P> = Arc<dyn Fn(&T, &InfiniteData<T, P>) -> Option<P> + Send + Sync>;

pub struct InfiniteQueryOptions<T, E, P = KeyPart> {
  pub key: QueryKey,
  pub query_fn: QueryFn<T, E, P>,
  pub initial_page_param: P,
  pub get_next_page_param: PageParamFn<T, P>,
  pub get_previous_page_param: Option<PageParamFn<T, P>>,
  /// Keep at most this many pages.
  pub max_pages: Option<usize>,
  pub stale_time: StaleTime,
  /// How long an unsubscribed, idle query stays registered with its client.
  pub cache_time: CacheTime,
  pub retry: Retry<E>,
  pub retry_delay: RetryDelay<E>,
  pub meta: Meta,
}

impl<T, E, P> InfiniteQueryOptions<T, E, P> {
  pub fn new<F, Fut, N>(key: impl Into<QueryKey>, initial_page_param: P, fetch: F, get_next_page_param: N) -> Self
  where
    F: Fn(QueryFnContext<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    N: Fn(&T, &InfiniteData<T, P>) -> Option<P> + Send + Sync + 'static,
  {
    Self {
      key: key.into(),
      query_fn: query_fn(fetch),
      initial_page_param,
      get_next_page_param: Arc::new(get_next_page_param),
      get_previous_page_param: None,
      max_pages: None,
      stale_time: StaleTime::default(),
      cache_time: CacheTime::default(),
      retry: Retry::default(),
      retry_delay: RetryDelay::default(),
      meta: Meta::new(),
    }
  }

  pub fn get_previous_page_param(
    mut self,
    f: impl Fn(&T, &InfiniteData<T, P>) -> Option<P> + Send + Sync + 'static,
  ) -> Self {
    self.get_previous_page_param = Some(Arc::new(f));
    self
  }

  pub fn max_pages(mut self, max_pages: usize) -> Self {
    self.max_pages = Some(max_pages).filter(|n| *n > 0);
    self
  }

  pub fn stale_time(mut self, stale_time: impl Into<StaleTime>) -> Self {
    self.stale_time = stale_time.into();
    self
  }

  pub fn cache_time(mut self, cache_time: impl Into<CacheTime>) -> Self {
    self.cache_time = cache_time.into();
    self
  }

  pub fn retry(mut self, retry: Retry<E>) -> Self {
    self.retry = retry;
    self
  }

  pub fn retry_delay(mut self, retry_delay: RetryDelay<E>) -> Self {
    self.retry_delay = retry_delay;
    self
  }

  pub fn meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
    self.meta.insert(key.into(), value);
    self
  }
}

impl<T, E, P: Clone> Clone for InfiniteQueryOptions<T, E, P> {
  fn clone(&self) -> Self {
    Self {
      key: self.key.clone(),
      query_fn: Arc::clone(&self.query_fn),
      initial_page_param: self.initial_page_param.clone(),
      get_next_page_param: Arc::clone(&self.get_next_page_param),
      get_previous_page_param: self.get_previous_page_param.clone(),
      max_pages: self.max_pages,
      stale_time: self.stale_time,
      cache_time: self.cache_time,
      retry: self.retry.clone(),
      retry_delay: self.retry_delay.clone(),
      meta: self.meta.clone(),
    }
  }
}

impl<T, E, P> fmt::Debug for InfiniteQueryOptions<T, E, P> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InfiniteQueryOptions")
      .field("key", &self.key)
      .field("max_pages", &self.max_pages)
      .field("stale_time", &self.stale_time)
      .field("cache_time", &self.cache_time)
      .field("retry", &self.retry)
      .finish_non_exhaustive()
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InfiniteQueryState<T, E, P = KeyPart> {
  /// Status, timestamps and the page list as data.
  pub state: QueryState<InfiniteData<T, P>, E>,
  pub has_next_page: bool,
  pub has_previous_page: bool,
  pub is_fetching_next_page: bool,
  pub is_fetching_previous_page: bool,
}

impl<T, E, P> Default for InfiniteQueryState<T, E, P> {
  fn default() -> Self {
    Self {
      state: QueryState::default(),
      has_next_page: false,
      has_previous_page: false,
      is_fetching_next_page: false,
      is_fetching_previous_page: false,
    }
  }
}

impl<T, E, P> InfiniteQueryState<T, E, P> {
  pub fn pages(&self) -> &[T] {
    self.state.data.as_ref().map_or(&[], |data| data.pages.as_slice())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
  First,
  Next,
  Previous,
  Refetch,
}

type SharedLoad<T, E, P> = Shared<BoxFuture<'static, QueryResult<InfiniteData<T, P>, E>>>;

/// Called when the eviction timer fires on an unsubscribed, idle query.
pub type InfiniteEvictHook<T, E, P> = Arc<dyn Fn(&Arc<InfiniteQuery<T, E, P>>) + Send + Sync>;

struct Inner<T, E, P> {
  state: InfiniteQueryState<T, E, P>,
  listeners: Vec<(ObserverId, Listener<InfiniteQueryState<T, E, P>>)>,
  token: Option<CancellationToken>,
  /// Error fields from before the running page request.
  revert: Option<Revert<E>>,
  first_page: Option<(u64, SharedLoad<T, E, P>)>,
  next_load_id: u64,
  gc_task: Option<JoinHandle<()>>,
}

/// A paginated query.
pub struct InfiniteQuery<T, E, P = KeyPart> {
  hash: String,
  this: Weak<InfiniteQuery<T, E, P>>,
  options: InfiniteQueryOptions<T, E, P>,
  inner: Mutex<Inner<T, E, P>>,
  /// Held for the whole of a page request.
  gate: tokio::sync::Mutex<()>,
  online: Option<watch::Receiver<bool>>,
  on_evict: Option<InfiniteEvictHook<T, E, P>>,
}

impl<T: Payload, E: Payload, P: Payload> InfiniteQuery<T, E, P> {
  pub fn new(options: InfiniteQueryOptions<T, E, P>) -> Arc<Self> {
    Self::with_online(options, None)
  }

  /// An infinite query whose page fetches pause while `online` is `false`.
  pub fn with_online(
    options: InfiniteQueryOptions<T, E, P>,
    online: Option<watch::Receiver<bool>>,
  ) -> Arc<Self> {
    Self::with_hooks(options, online, None)
  }

  pub(crate) fn with_hooks(
    options: InfiniteQueryOptions<T, E, P>,
    online: Option<watch::Receiver<bool>>,
    on_evict: Option<InfiniteEvictHook<T, E, P>>,
  ) -> Arc<Self> {
    let query = Arc::new_cyclic(|this| Self {
      hash: options.key.hash(),
      this: this.clone(),
      options,
      inner: Mutex::new(Inner {
        state: InfiniteQueryState::default(),
        listeners: Vec::new(),
        token: None,
        revert: None,
        first_page: None,
        next_load_id: 0,
        gc_task: None,
      }),
      gate: tokio::sync::Mutex::new(()),
      online,
      on_evict,
    });
    {
      let mut inner = query.inner.lock();
      query.schedule_gc(&mut inner);
    }
    query
  }

  pub fn key(&self) -> &QueryKey {
    &self.options.key
  }

  pub fn hash(&self) -> &str {
    &self.hash
  }

  pub fn options(&self) -> &InfiniteQueryOptions<T, E, P> {
    &self.options
  }

  pub fn state(&self) -> InfiniteQueryState<T, E, P> {
    self.inner.lock().state.clone()
  }

  pub fn data(&self) -> Option<InfiniteData<T, P>> {
    self.inner.lock().state.state.data.clone()
  }

  pub fn is_stale(&self) -> bool {
    let inner = self.inner.lock();
    let state = &inner.state.state;
    state.is_invalidated
      || state
        .data_updated_at
        .map_or(true, |at| self.options.stale_time.is_stale(at))
  }

  pub fn is_fetching(&self) -> bool {
    self.inner.lock().state.state.fetch_status != FetchStatus::Idle
  }

  pub fn observer_count(&self) -> usize {
    self.inner.lock().listeners.len()
  }

  pub fn subscribe(
    &self,
    listener: impl Fn(&InfiniteQueryState<T, E, P>) + Send + Sync + 'static,
  ) -> Subscription {
    let id = ObserverId::next();
    {
      let mut inner = self.inner.lock();
      if let Some(task) = inner.gc_task.take() {
        task.abort();
      }
      inner.listeners.push((id, Arc::new(listener)));
    }
    let this = self.this.clone();
    Subscription::new(move || {
      if let Some(query) = this.upgrade() {
        let mut inner = query.inner.lock();
        inner.listeners.retain(|(lid, _)| *lid != id);
        if inner.listeners.is_empty() {
          query.schedule_gc(&mut inner);
        }
      }
    })
  }

  /// Load the first page, replacing whatever pages were loaded.
  ///
  /// Joins a first-page load already in flight. Without `force`, fresh
  /// data is returned as-is.
  pub async fn fetch(self: &Arc<Self>, force: bool) -> QueryResult<InfiniteData<T, P>, E> {
    let load = {
      let mut inner = self.inner.lock();
      match &inner.first_page {
        Some((_, load)) => load.clone(),
        None => {
          if !force && !self.is_stale_locked(&inner.state.state) {
            if let Some(data) = &inner.state.state.data {
              return Ok(data.clone());
            }
          }
          inner.next_load_id += 1;
          let id = inner.next_load_id;
          let this = Arc::clone(self);
          let task = tokio::spawn(async move {
            let result = this.load(Direction::First).await;
            let mut inner = this.inner.lock();
            if inner.first_page.as_ref().is_some_and(|(current, _)| *current == id) {
              inner.first_page = None;
            }
            result
          });
          let load = async move {
            task
              .await
              .unwrap_or_else(|e| Err(QueryError::Aborted(e.to_string())))
          }
          .boxed()
          .shared();
          inner.first_page = Some((id, load.clone()));
          load
        }
      }
    };
    load.await
  }

  /// Load the page after the newest one. Does nothing without a next page.
  pub async fn fetch_next_page(&self) -> QueryResult<InfiniteData<T, P>, E> {
    self.load(Direction::Next).await
  }

  /// Load the page before the oldest one. Does nothing without a previous page.
  pub async fn fetch_previous_page(&self) -> QueryResult<InfiniteData<T, P>, E> {
    self.load(Direction::Previous).await
  }

  /// Re-fetch every loaded page in order, deriving each param from the page
  /// just fetched. Stops early once there is no next page.
  pub async fn refetch(&self) -> QueryResult<InfiniteData<T, P>, E> {
    self.load(Direction::Refetch).await
  }

  async fn load(&self, direction: Direction) -> QueryResult<InfiniteData<T, P>, E> {
    let _gate = self.gate.lock().await;

    let current = self.inner.lock().state.clone();
    let loaded = current.state.data.clone().unwrap_or_default();
    let param = match direction {
      Direction::First => Some(self.options.initial_page_param.clone()),
      Direction::Refetch => Some(
        loaded
          .page_params
          .first()
          .cloned()
          .unwrap_or_else(|| self.options.initial_page_param.clone()),
      ),
      Direction::Next => {
        if !current.has_next_page {
          return Ok(loaded);
        }
        loaded
          .pages
          .last()
          .and_then(|page| (self.options.get_next_page_param)(page, &loaded))
      }
      Direction::Previous => {
        if !current.has_previous_page {
          return Ok(loaded);
        }
        match (&self.options.get_previous_page_param, loaded.pages.first()) {
          (Some(f), Some(page)) => f(page, &loaded),
          _ => None,
        }
      }
    };
    let Some(param) = param else {
      return Ok(loaded);
    };

    let token = self.begin(direction);
    let result = match direction {
      Direction::Refetch => self.refetch_pages(param, loaded.len().max(1), &token).await,
      _ => self.fetch_page(param.clone(), &token).await.map(|page| {
        let mut data = match direction {
          Direction::First => InfiniteData::default(),
          _ => loaded,
        };
        self.place(&mut data, page, param, direction);
        data
      }),
    };
    self.finish(direction, &token, result)
  }

  async fn refetch_pages(
    &self,
    first_param: P,
    count: usize,
    token: &CancellationToken,
  ) -> QueryResult<InfiniteData<T, P>, E> {
    let mut data = InfiniteData::default();
    let mut param = Some(first_param);
    while let Some(next) = param.take() {
      let page = self.fetch_page(next.clone(), token).await?;
      data.pages.push(page);
      data.page_params.push(next);
      if data.len() >= count {
        break;
      }
      param = data
        .pages
        .last()
        .and_then(|page| (self.options.get_next_page_param)(page, &data));
    }
    Ok(data)
  }

  async fn fetch_page(&self, param: P, token: &CancellationToken) -> QueryResult<T, E> {
    let mut retryer = Retryer::new(self.options.retry.clone(), self.options.retry_delay.clone())
      .with_token(token.clone());
    if let Some(online) = &self.online {
      retryer = retryer.with_online(online.clone());
    }
    let ctx = QueryFnContext {
      key: self.options.key.clone(),
      page_param: Some(param),
      signal: token.clone(),
      meta: self.options.meta.clone(),
    };
    let mut events = PageEvents { query: self, token };
    retryer
      .run(|| (self.options.query_fn)(ctx.clone()), &mut events)
      .await
  }

  /// Insert a fetched page, trimming the opposite end past `max_pages`.
  fn place(&self, data: &mut InfiniteData<T, P>, page: T, param: P, direction: Direction) {
    match direction {
      Direction::Previous => {
        data.pages.insert(0, page);
        data.page_params.insert(0, param);
        if let Some(max) = self.options.max_pages {
          data.pages.truncate(max);
          data.page_params.truncate(max);
        }
      }
      _ => {
        data.pages.push(page);
        data.page_params.push(param);
        if let Some(max) = self.options.max_pages {
          let excess = data.pages.len().saturating_sub(max);
          data.pages.drain(..excess);
          data.page_params.drain(..excess);
        }
      }
    }
  }

  fn begin(&self, direction: Direction) -> CancellationToken {
    let token = CancellationToken::new();
    self.update(|inner| {
      inner.token = Some(token.clone());
      inner.revert = Some(Revert::capture(&inner.state.state));
      let mut state = inner.state.clone();
      state.state = state.state.with_fetching();
      state.is_fetching_next_page = direction == Direction::Next;
      state.is_fetching_previous_page = direction == Direction::Previous;
      inner.state = state;
      true
    });
    debug!(key = %self.hash, ?direction, "page fetch started");
    token
  }

  fn finish(
    &self,
    direction: Direction,
    token: &CancellationToken,
    result: QueryResult<InfiniteData<T, P>, E>,
  ) -> QueryResult<InfiniteData<T, P>, E> {
    if token.is_cancelled() {
      debug!(key = %self.hash, ?direction, "page fetch cancelled");
      return Err(QueryError::Cancelled);
    }

    self.update(|inner| {
      inner.token = None;
      inner.revert = None;
      if inner.listeners.is_empty() {
        self.schedule_gc(inner);
      }
      let mut state = inner.state.clone();
      state.is_fetching_next_page = false;
      state.is_fetching_previous_page = false;
      match &result {
        Ok(data) => {
          state.has_next_page = data
            .pages
            .last()
            .is_some_and(|page| (self.options.get_next_page_param)(page, data).is_some());
          state.has_previous_page = match (&self.options.get_previous_page_param, data.pages.first()) {
            (Some(f), Some(page)) => f(page, data).is_some(),
            _ => false,
          };
          state.state = state.state.with_success(data.clone(), Utc::now());
        }
        Err(QueryError::Failed(error)) => {
          state.state = state.state.with_error(error.clone(), Utc::now());
        }
        Err(_) => {
          state.state = state.state.with_fetch_status(FetchStatus::Idle);
        }
      }
      inner.state = state;
      true
    });
    debug!(key = %self.hash, ?direction, ok = result.is_ok(), "page fetch settled");
    result
  }

  /// Cancel the running page request. Loaded pages are kept, and the error
  /// fields go back to what they were before the request started.
  pub fn cancel(&self) {
    let mut token = None;
    self.update(|inner| {
      token = inner.token.take();
      if token.is_none() {
        return false;
      }
      inner.state.is_fetching_next_page = false;
      inner.state.is_fetching_previous_page = false;
      inner.state.state = match inner.revert.take() {
        Some(revert) => reverted(&inner.state.state, revert),
        None => inner.state.state.with_fetch_status(FetchStatus::Idle),
      };
      if inner.listeners.is_empty() {
        self.schedule_gc(inner);
      }
      true
    });
    if let Some(token) = token {
      token.cancel();
    }
  }

  /// Mark the pages stale. Does not fetch.
  pub fn invalidate(&self) {
    self.update(|inner| {
      inner.state.state = inner.state.state.invalidated();
      true
    });
  }

  /// Cancel any request and drop every page.
  pub fn reset(&self) {
    let mut token = None;
    self.update(|inner| {
      token = inner.token.take();
      inner.revert = None;
      inner.first_page = None;
      inner.state = InfiniteQueryState::default();
      true
    });
    if let Some(token) = token {
      token.cancel();
    }
  }

  /// Apply `f` under the lock and notify listeners if it returns true.
  fn update(&self, f: impl FnOnce(&mut Inner<T, E, P>) -> bool) {
    let (state, listeners) = {
      let mut inner = self.inner.lock();
      if !f(&mut inner) {
        return;
      }
      let listeners: Vec<_> = inner.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
      (inner.state.clone(), listeners)
    };
    for listener in listeners {
      listener(&state);
    }
  }

  fn schedule_gc(&self, inner: &mut Inner<T, E, P>) {
    if let Some(task) = inner.gc_task.take() {
      task.abort();
    }
    if self.on_evict.is_none() {
      return;
    }
    let Some(delay) = self.options.cache_time.duration() else {
      return;
    };
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
      if !inner.listeners.is_empty() || inner.token.is_some() || inner.first_page.is_some() {
        return;
      }
    }
    debug!(key = %self.hash, "evicting unobserved infinite query");
    if let Some(hook) = &self.on_evict {
      hook(self);
    }
  }

  fn is_stale_locked(&self, state: &QueryState<InfiniteData<T, P>, E>) -> bool {
    state.is_invalidated
      || state
        .data_updated_at
        .map_or(true, |at| self.options.stale_time.is_stale(at))
  }
}

struct PageEvents<'a, T, E, P> {
  query: &'a InfiniteQuery<T, E, P>,
  token: &'a CancellationToken,
}

impl<T: Payload, E: Payload, P: Payload> PageEvents<'_, T, E, P> {
  fn apply(&self, f: impl FnOnce(&QueryState<InfiniteData<T, P>, E>) -> QueryState<InfiniteData<T, P>, E>) {
    if self.token.is_cancelled() {
      return;
    }
    self.query.update(|inner| {
      inner.state.state = f(&inner.state.state);
      true
    });
  }
}

impl<T: Payload, E: Payload, P: Payload> RetryEvents<E> for PageEvents<'_, T, E, P> {
  fn on_fail(&mut self, failure_count: u32, error: &E) {
    self.apply(|state| state.with_failure(failure_count, error.clone()));
  }

  fn on_pause(&mut self) {
    self.apply(|state| state.with_fetch_status(FetchStatus::Paused));
  }

  fn on_continue(&mut self) {
    self.apply(|state| state.with_fetch_status(FetchStatus::Fetching));
  }
}

impl<T, E, P> Drop for InfiniteQuery<T, E, P> {
  fn drop(&mut self) {
    if let Some(task) = self.inner.get_mut().gc_task.take() {
      task.abort();
    }
  }
}

impl<T, E, P> fmt::Debug for InfiniteQuery<T, E, P>
where
  T: fmt::Debug,
  E: fmt::Debug,
  P: fmt::Debug,
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let inner = self.inner.lock();
    f.debug_struct("InfiniteQuery")
      .field("key", &self.hash)
      .field("pages", &inner.state.state.data.as_ref().map_or(0, |d| d.pages.len()))
      .field("fetch_status", &inner.state.state.fetch_status)
      .finish_non_exhaustive()
  }
}
