//! Query options and the rule for merging them across observers.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Deserializer};

use crate::cancel::CancellationToken;
use crate::key::{KeyPart, QueryKey};
use crate::retry::{Retry, RetryDelay};

/// Free-form metadata handed to fetch functions.
pub type Meta = BTreeMap<String, serde_json::Value>;

/// How long fetched data stays fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StaleTime {
  Finite(Duration),
  Infinite,
}

impl StaleTime {
  /// Data is stale as soon as it lands.
  pub const ZERO: StaleTime = StaleTime::Finite(Duration::ZERO);
  pub const INFINITY: StaleTime = StaleTime::Infinite;

  /// Whether data stamped `updated_at` is stale at `now`.
  pub fn is_stale_at(&self, updated_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    match self {
      StaleTime::Infinite => false,
      StaleTime::Finite(limit) if limit.is_zero() => true,
      StaleTime::Finite(limit) => match chrono::Duration::from_std(*limit) {
        Ok(limit) => now.signed_duration_since(updated_at) > limit,
        // Longer than chrono can represent: effectively never stale
        Err(_) => false,
      },
    }
  }

  pub fn is_stale(&self, updated_at: DateTime<Utc>) -> bool {
    self.is_stale_at(updated_at, Utc::now())
  }
}

impl From<Duration> for StaleTime {
  fn from(value: Duration) -> Self {
    StaleTime::Finite(value)
  }
}

impl Default for StaleTime {
  fn default() -> Self {
    StaleTime::ZERO
  }
}

/// How long an unobserved query is retained before eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CacheTime {
  Finite(Duration),
  Infinite,
}

impl CacheTime {
  pub const INFINITY: CacheTime = CacheTime::Infinite;

  /// The eviction delay, or `None` when eviction is disabled.
  pub fn duration(&self) -> Option<Duration> {
    match self {
      CacheTime::Finite(d) => Some(*d),
      CacheTime::Infinite => None,
    }
  }
}

impl From<Duration> for CacheTime {
  fn from(value: Duration) -> Self {
    CacheTime::Finite(value)
  }
}

impl Default for CacheTime {
  fn default() -> Self {
    CacheTime::Finite(Duration::from_secs(5 * 60))
  }
}

/// Millisecond count or the string `"infinity"`.
#[derive(Deserialize)]
#[serde(untagged)]
enum DurationSetting {
  Millis(u64),
  Keyword(String),
}

pub(crate) fn parse_duration_setting<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
  D: Deserializer<'de>,
{
  match DurationSetting::deserialize(deserializer)? {
    DurationSetting::Millis(ms) => Ok(Some(Duration::from_millis(ms))),
    DurationSetting::Keyword(word) if word.eq_ignore_ascii_case("infinity") => Ok(None),
    DurationSetting::Keyword(word) => Err(serde::de::Error::custom(format!(
      "expected milliseconds or \"infinity\", got {:?}",
      word
    ))),
  }
}

impl<'de> Deserialize<'de> for StaleTime {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    Ok(parse_duration_setting(deserializer)?.map_or(StaleTime::Infinite, StaleTime::Finite))
  }
}

impl<'de> Deserialize<'de> for CacheTime {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    Ok(parse_duration_setting(deserializer)?.map_or(CacheTime::Infinite, CacheTime::Finite))
  }
}

/// Everything a fetch function gets to see.
#[derive(Debug, Clone)]
pub struct QueryFnContext<P = KeyPart> {
  pub key: QueryKey,
  /// Set for infinite-query page fetches.
  pub page_param: Option<P>,
  /// Check this to exit early from long-running work.
  pub signal: CancellationToken,
  pub meta: Meta,
}

/// A shareable async fetch function.
pub type QueryFn<T, E, P = KeyPart> =
  Arc<dyn Fn(QueryFnContext<P>) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

/// Box a plain async closure into a [`QueryFn`].
pub fn query_fn<T, E, P, F, Fut>(f: F) -> QueryFn<T, E, P>
where
  F: Fn(QueryFnContext<P>) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T, E>> + Send + 'static,
{
  Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Per-observer options for one query key.
pub struct QueryOptions<T, E> {
  pub key: QueryKey,
  pub query_fn: Option<QueryFn<T, E>>,
  pub stale_time: StaleTime,
  pub cache_time: CacheTime,
  pub retry: Retry<E>,
  pub retry_delay: RetryDelay<E>,
  pub refetch_on_mount: bool,
  pub refetch_on_window_focus: bool,
  pub refetch_on_reconnect: bool,
  /// Poll period; `None` or zero disables polling.
  pub refetch_interval: Option<Duration>,
  pub enabled: bool,
  /// Shown by observers while no real data exists. Never cached.
  pub placeholder_data: Option<T>,
  /// Seeds a newly created query as if it had been fetched.
  pub initial_data: Option<T>,
  pub initial_data_updated_at: Option<DateTime<Utc>>,
  pub meta: Meta,
}

impl<T, E> QueryOptions<T, E> {
  pub fn new(key: impl Into<QueryKey>) -> Self {
    Self {
      key: key.into(),
      query_fn: None,
      stale_time: StaleTime::default(),
      cache_time: CacheTime::default(),
      retry: Retry::default(),
      retry_delay: RetryDelay::default(),
      refetch_on_mount: true,
      refetch_on_window_focus: true,
      refetch_on_reconnect: true,
      refetch_interval: None,
      enabled: true,
      placeholder_data: None,
      initial_data: None,
      initial_data_updated_at: None,
      meta: Meta::new(),
    }
  }

  pub fn query_fn<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(QueryFnContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    self.query_fn = Some(query_fn(f));
    self
  }

  pub fn with_query_fn(mut self, f: QueryFn<T, E>) -> Self {
    self.query_fn = Some(f);
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

  pub fn refetch_on_mount(mut self, on: bool) -> Self {
    self.refetch_on_mount = on;
    self
  }

  pub fn refetch_on_window_focus(mut self, on: bool) -> Self {
    self.refetch_on_window_focus = on;
    self
  }

  pub fn refetch_on_reconnect(mut self, on: bool) -> Self {
    self.refetch_on_reconnect = on;
    self
  }

  pub fn refetch_interval(mut self, interval: Option<Duration>) -> Self {
    self.refetch_interval = interval;
    self
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  pub fn placeholder_data(mut self, data: T) -> Self {
    self.placeholder_data = Some(data);
    self
  }

  pub fn initial_data(mut self, data: T, updated_at: Option<DateTime<Utc>>) -> Self {
    self.initial_data = Some(data);
    self.initial_data_updated_at = updated_at;
    self
  }

  pub fn meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
    self.meta.insert(key.into(), value);
    self
  }

  /// The effective poll period, if polling is on.
  pub fn poll_interval(&self) -> Option<Duration> {
    self.refetch_interval.filter(|d| !d.is_zero())
  }
}

impl<T: Clone, E> QueryOptions<T, E> {
  /// Merge the options of every observer sharing one query.
  ///
  /// Shortest stale time, longest cache time and highest retry win; the
  /// first fetch function, retry delay, seed data and meta win. Refetch
  /// triggers and `enabled` are on when any observer turns them on.
  /// Returns `None` for an empty slice.
  pub fn merge<'a>(all: impl IntoIterator<Item = &'a QueryOptions<T, E>>) -> Option<Self>
  where
    T: 'a,
    E: 'a,
  {
    let mut iter = all.into_iter();
    let mut merged = iter.next()?.clone();
    for next in iter {
      merged.stale_time = merged.stale_time.min(next.stale_time);
      merged.cache_time = merged.cache_time.max(next.cache_time);
      merged.retry = merged.retry.max(next.retry.clone());
      if merged.query_fn.is_none() {
        merged.query_fn = next.query_fn.clone();
      }
      if merged.initial_data.is_none() {
        merged.initial_data = next.initial_data.clone();
        merged.initial_data_updated_at = next.initial_data_updated_at;
      }
      if merged.placeholder_data.is_none() {
        merged.placeholder_data = next.placeholder_data.clone();
      }
      merged.refetch_on_mount |= next.refetch_on_mount;
      merged.refetch_on_window_focus |= next.refetch_on_window_focus;
      merged.refetch_on_reconnect |= next.refetch_on_reconnect;
      merged.enabled |= next.enabled;
      merged.refetch_interval = match (merged.poll_interval(), next.poll_interval()) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
      };
    }
    Some(merged)
  }
}

impl<T: Clone, E> Clone for QueryOptions<T, E> {
  fn clone(&self) -> Self {
    Self {
      key: self.key.clone(),
      query_fn: self.query_fn.clone(),
      stale_time: self.stale_time,
      cache_time: self.cache_time,
      retry: self.retry.clone(),
      retry_delay: self.retry_delay.clone(),
      refetch_on_mount: self.refetch_on_mount,
      refetch_on_window_focus: self.refetch_on_window_focus,
      refetch_on_reconnect: self.refetch_on_reconnect,
      refetch_interval: self.refetch_interval,
      enabled: self.enabled,
      placeholder_data: self.placeholder_data.clone(),
      initial_data: self.initial_data.clone(),
      initial_data_updated_at: self.initial_data_updated_at,
      meta: self.meta.clone(),
    }
  }
}

impl<T, E> fmt::Debug for QueryOptions<T, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryOptions")
      .field("key", &self.key)
      .field("has_query_fn", &self.query_fn.is_some())
      .field("stale_time", &self.stale_time)
      .field("cache_time", &self.cache_time)
      .field("retry", &self.retry)
      .field("enabled", &self.enabled)
      .field("refetch_interval", &self.refetch_interval)
      .finish_non_exhaustive()
  }
}
