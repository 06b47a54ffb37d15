use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use super::cache::MutationCacheEvent;
use crate::error::{QueryError, QueryResult};
use crate::key::QueryKey;
use crate::options::Meta;
use crate::retry::{Retry, RetryDelay, RetryEvents, Retryer};
use crate::subscription::{Listener, ObserverId, Subscription};
use crate::Payload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
  Idle,
  Pending,
  Error,
  Success,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MutationState<D, E, V, C> {
  pub data: Option<D>,
  pub error: Option<E>,
  pub status: MutationStatus,
  pub variables: Option<V>,
  /// Whatever `on_mutate` returned, typically a rollback snapshot.
  pub context: Option<C>,
  pub submitted_at: Option<DateTime<Utc>>,
  pub failure_count: u32,
  pub failure_reason: Option<E>,
}

impl<D, E, V, C> Default for MutationState<D, E, V, C> {
  fn default() -> Self {
    Self {
      data: None,
      error: None,
      status: MutationStatus::Idle,
      variables: None,
      context: None,
      submitted_at: None,
      failure_count: 0,
      failure_reason: None,
    }
  }
}

impl<D, E, V, C> MutationState<D, E, V, C> {
  pub fn is_idle(&self) -> bool {
    self.status == MutationStatus::Idle
  }

  pub fn is_pending(&self) -> bool {
    self.status == MutationStatus::Pending
  }

  pub fn is_error(&self) -> bool {
    self.status == MutationStatus::Error
  }

  pub fn is_success(&self) -> bool {
    self.status == MutationStatus::Success
  }
}

pub type MutationFn<D, E, V> = Arc<dyn Fn(V) -> BoxFuture<'static, Result<D, E>> + Send + Sync>;
type OnMutate<V, C> = Arc<dyn Fn(&V) -> C + Send + Sync>;
type OnSuccess<D, V, C> = Arc<dyn Fn(&D, &V, Option<&C>) + Send + Sync>;
type OnError<E, V, C> = Arc<dyn Fn(&E, &V, Option<&C>) + Send + Sync>;
type OnSettled<D, E, V, C> = Arc<dyn Fn(Option<&D>, Option<&E>, &V, Option<&C>) + Send + Sync>;

/// Everything a mutation runs and calls back into.
pub struct MutationOptions<D, E, V, C = ()> {
  pub mutation_fn: Option<MutationFn<D, E, V>>,
  pub on_mutate: Option<OnMutate<V, C>>,
  pub on_success: Option<OnSuccess<D, V, C>>,
  pub on_error: Option<OnError<E, V, C>>,
  pub on_settled: Option<OnSettled<D, E, V, C>>,
  /// Mutations do not retry unless asked to.
  pub retry: Retry<E>,
  pub retry_delay: RetryDelay<E>,
  /// Groups mutations for lookup; never deduplicates.
  pub mutation_key: Option<QueryKey>,
  pub meta: Meta,
}

impl<D, E, V, C> MutationOptions<D, E, V, C> {
  pub fn new() -> Self {
    Self {
      mutation_fn: None,
      on_mutate: None,
      on_success: None,
      on_error: None,
      on_settled: None,
      retry: Retry::never(),
      retry_delay: RetryDelay::default(),
      mutation_key: None,
      meta: Meta::new(),
    }
  }

  pub fn mutation_fn<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<D, E>> + Send + 'static,
  {
    self.mutation_fn = Some(Arc::new(move |vars| Box::pin(f(vars))));
    self
  }

  /// Runs before the mutation function; its return value becomes the context.
  pub fn on_mutate(mut self, f: impl Fn(&V) -> C + Send + Sync + 'static) -> Self {
    self.on_mutate = Some(Arc::new(f));
    self
  }

  pub fn on_success(mut self, f: impl Fn(&D, &V, Option<&C>) + Send + Sync + 'static) -> Self {
    self.on_success = Some(Arc::new(f));
    self
  }

  pub fn on_error(mut self, f: impl Fn(&E, &V, Option<&C>) + Send + Sync + 'static) -> Self {
    self.on_error = Some(Arc::new(f));
    self
  }

  pub fn on_settled(
    mut self,
    f: impl Fn(Option<&D>, Option<&E>, &V, Option<&C>) + Send + Sync + 'static,
  ) -> Self {
    self.on_settled = Some(Arc::new(f));
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

  pub fn mutation_key(mut self, key: impl Into<QueryKey>) -> Self {
    self.mutation_key = Some(key.into());
    self
  }

  pub fn meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
    self.meta.insert(key.into(), value);
    self
  }
}

impl<D, E, V, C> Default for MutationOptions<D, E, V, C> {
  fn default() -> Self {
    Self::new()
  }
}

impl<D, E, V, C> Clone for MutationOptions<D, E, V, C> {
  fn clone(&self) -> Self {
    Self {
      mutation_fn: self.mutation_fn.clone(),
      on_mutate: self.on_mutate.clone(),
      on_success: self.on_success.clone(),
      on_error: self.on_error.clone(),
      on_settled: self.on_settled.clone(),
      retry: self.retry.clone(),
      retry_delay: self.retry_delay.clone(),
      mutation_key: self.mutation_key.clone(),
      meta: self.meta.clone(),
    }
  }
}

impl<D, E, V, C> fmt::Debug for MutationOptions<D, E, V, C> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MutationOptions")
      .field("has_mutation_fn", &self.mutation_fn.is_some())
      .field("retry", &self.retry)
      .field("mutation_key", &self.mutation_key)
      .finish_non_exhaustive()
  }
}

/// The view of a mutation the cache and its filters work with.
pub trait MutationEntry: Send + Sync {
  fn id(&self) -> u64;
  fn status(&self) -> MutationStatus;
  fn mutation_key(&self) -> Option<&QueryKey>;
  fn meta(&self) -> &Meta;
  fn submitted_at(&self) -> Option<DateTime<Utc>>;
  fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// One write operation and its lifecycle.
pub struct Mutation<D, E, V, C = ()> {
  id: u64,
  options: MutationOptions<D, E, V, C>,
  state: Mutex<MutationState<D, E, V, C>>,
  listeners: Arc<Mutex<Vec<(ObserverId, Listener<MutationState<D, E, V, C>>)>>>,
  events: Option<broadcast::Sender<MutationCacheEvent>>,
}

impl<D: Payload, E: Payload, V: Payload, C: Payload> Mutation<D, E, V, C> {
  pub(crate) fn new(
    id: u64,
    options: MutationOptions<D, E, V, C>,
    events: Option<broadcast::Sender<MutationCacheEvent>>,
  ) -> Self {
    Self {
      id,
      options,
      state: Mutex::new(MutationState::default()),
      listeners: Arc::new(Mutex::new(Vec::new())),
      events,
    }
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn state(&self) -> MutationState<D, E, V, C> {
    self.state.lock().clone()
  }

  pub fn options(&self) -> &MutationOptions<D, E, V, C> {
    &self.options
  }

  /// Run the mutation with `variables`.
  ///
  /// `on_mutate` runs first and its result is handed to every later
  /// callback. A final failure runs `on_error` and `on_settled`, then is
  /// returned to the caller.
  pub async fn mutate(&self, variables: V) -> QueryResult<D, E> {
    let mutation_fn = self
      .options
      .mutation_fn
      .clone()
      .ok_or(QueryError::MissingMutationFn)?;

    let context = self.options.on_mutate.as_ref().map(|f| f(&variables));
    self.update(|_| MutationState {
      status: MutationStatus::Pending,
      variables: Some(variables.clone()),
      context: context.clone(),
      submitted_at: Some(Utc::now()),
      ..MutationState::default()
    });
    debug!(mutation = self.id, "mutation started");

    let retryer = Retryer::new(self.options.retry.clone(), self.options.retry_delay.clone());
    let mut events = MutationEvents { mutation: self };
    let result = retryer
      .run(|| mutation_fn(variables.clone()), &mut events)
      .await;

    match &result {
      Ok(data) => {
        if let Some(f) = &self.options.on_success {
          f(data, &variables, context.as_ref());
        }
        if let Some(f) = &self.options.on_settled {
          f(Some(data), None, &variables, context.as_ref());
        }
        self.update(|state| MutationState {
          data: Some(data.clone()),
          error: None,
          status: MutationStatus::Success,
          failure_count: 0,
          failure_reason: None,
          ..state.clone()
        });
        debug!(mutation = self.id, "mutation succeeded");
      }
      Err(QueryError::Failed(error)) => {
        if let Some(f) = &self.options.on_error {
          f(error, &variables, context.as_ref());
        }
        if let Some(f) = &self.options.on_settled {
          f(None, Some(error), &variables, context.as_ref());
        }
        self.update(|state| MutationState {
          error: Some(error.clone()),
          status: MutationStatus::Error,
          failure_count: state.failure_count + 1,
          failure_reason: Some(error.clone()),
          ..state.clone()
        });
        debug!(mutation = self.id, "mutation failed");
      }
      Err(_) => {
        self.update(|state| MutationState {
          status: MutationStatus::Idle,
          ..state.clone()
        });
      }
    }
    result
  }

  /// Back to idle, forgetting data, error and variables.
  pub fn reset(&self) {
    self.update(|_| MutationState::default());
  }

  pub fn subscribe(
    &self,
    listener: impl Fn(&MutationState<D, E, V, C>) + Send + Sync + 'static,
  ) -> Subscription {
    let id = ObserverId::next();
    self.listeners.lock().push((id, Arc::new(listener)));
    let listeners = Arc::downgrade(&self.listeners);
    Subscription::new(move || {
      if let Some(listeners) = listeners.upgrade() {
        listeners.lock().retain(|(lid, _)| *lid != id);
      }
    })
  }

  fn update(&self, f: impl FnOnce(&MutationState<D, E, V, C>) -> MutationState<D, E, V, C>) {
    let (state, listeners) = {
      let mut state = self.state.lock();
      *state = f(&state);
      let listeners: Vec<_> = self.listeners.lock().iter().map(|(_, l)| Arc::clone(l)).collect();
      (state.clone(), listeners)
    };
    for listener in listeners {
      listener(&state);
    }
    if let Some(events) = &self.events {
      let _ = events.send(MutationCacheEvent::Updated {
        id: self.id,
        status: state.status,
      });
    }
  }
}

struct MutationEvents<'a, D, E, V, C> {
  mutation: &'a Mutation<D, E, V, C>,
}

impl<D: Payload, E: Payload, V: Payload, C: Payload> RetryEvents<E> for MutationEvents<'_, D, E, V, C> {
  fn on_fail(&mut self, failure_count: u32, error: &E) {
    self.mutation.update(|state| MutationState {
      failure_count,
      failure_reason: Some(error.clone()),
      ..state.clone()
    });
  }
}

impl<D: Payload, E: Payload, V: Payload, C: Payload> MutationEntry for Mutation<D, E, V, C> {
  fn id(&self) -> u64 {
    self.id
  }

  fn status(&self) -> MutationStatus {
    self.state.lock().status
  }

  fn mutation_key(&self) -> Option<&QueryKey> {
    self.options.mutation_key.as_ref()
  }

  fn meta(&self) -> &Meta {
    &self.options.meta
  }

  fn submitted_at(&self) -> Option<DateTime<Utc>> {
    self.state.lock().submitted_at
  }

  fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
    self
  }
}

impl<D, E, V, C> fmt::Debug for Mutation<D, E, V, C>
where
  D: fmt::Debug,
  E: fmt::Debug,
  V: fmt::Debug,
  C: fmt::Debug,
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Mutation")
      .field("id", &self.id)
      .field("state", &*self.state.lock())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::QueryCache;
  use crate::options::QueryOptions;
  use crate::query_key;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  type Todos = Vec<String>;

  #[tokio::test]
  async fn test_success_runs_callbacks_in_order() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let (a, b, c) = (calls.clone(), calls.clone(), calls.clone());
    let mutation: Mutation<u32, String, u32, &'static str> = Mutation::new(
      1,
      MutationOptions::new()
        .mutation_fn(|n: u32| async move { Ok(n * 2) })
        .on_mutate(move |n| {
          a.lock().push(format!("mutate {}", n));
          "ctx"
        })
        .on_success(move |data, _, ctx| b.lock().push(format!("success {} {:?}", data, ctx)))
        .on_settled(move |data, err, _, _| c.lock().push(format!("settled {:?} {:?}", data, err))),
      None,
    );

    assert_eq!(mutation.mutate(21).await, Ok(42));
    assert_eq!(
      *calls.lock(),
      vec![
        "mutate 21".to_string(),
        "success 42 Some(\"ctx\")".to_string(),
        "settled Some(42) None".to_string(),
      ]
    );
    let state = mutation.state();
    assert!(state.is_success());
    assert_eq!(state.data, Some(42));
    assert_eq!(state.variables, Some(21));
    assert_eq!(state.context, Some("ctx"));
    assert!(state.submitted_at.is_some());
  }

  #[tokio::test]
  async fn test_failure_is_reraised_after_callbacks() {
    let errors = Arc::new(AtomicU32::new(0));
    let settled = Arc::new(AtomicU32::new(0));
    let (e, s) = (errors.clone(), settled.clone());
    let mutation: Mutation<(), String, (), ()> = Mutation::new(
      2,
      MutationOptions::new()
        .mutation_fn(|_| async { Err("rejected".to_string()) })
        .on_error(move |_, _, _| {
          e.fetch_add(1, Ordering::SeqCst);
        })
        .on_settled(move |data, err, _, _| {
          assert!(data.is_none());
          assert_eq!(err, Some(&"rejected".to_string()));
          s.fetch_add(1, Ordering::SeqCst);
        }),
      None,
    );

    let result = mutation.mutate(()).await;
    assert_eq!(result, Err(QueryError::Failed("rejected".to_string())));
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(settled.load(Ordering::SeqCst), 1);
    let state = mutation.state();
    assert!(state.is_error());
    assert_eq!(state.failure_count, 1);

    mutation.reset();
    assert!(mutation.state().is_idle());
  }

  #[tokio::test(start_paused = true)]
  async fn test_retries_only_when_configured() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let mutation: Mutation<(), String, (), ()> = Mutation::new(
      3,
      MutationOptions::new()
        .retry(Retry::Count(2))
        .retry_delay(RetryDelay::Fixed(Duration::from_millis(100)))
        .mutation_fn(move |_| {
          counter.fetch_add(1, Ordering::SeqCst);
          async { Err("busy".to_string()) }
        }),
      None,
    );

    let failures = Arc::new(Mutex::new(Vec::new()));
    let log = failures.clone();
    let _sub = mutation.subscribe(move |state| log.lock().push(state.failure_count));

    assert!(mutation.mutate(()).await.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(*failures.lock(), vec![0, 1, 2, 3]);
  }

  #[tokio::test]
  async fn test_missing_mutation_fn() {
    let mutation: Mutation<(), String, (), ()> = Mutation::new(4, MutationOptions::new(), None);
    assert_eq!(mutation.mutate(()).await, Err(QueryError::MissingMutationFn));
    assert!(mutation.state().is_idle());
  }

  #[tokio::test]
  async fn test_optimistic_update_rolls_back() {
    let cache: QueryCache<Todos, String> = QueryCache::new();
    let key = query_key!["todos"];
    cache.set_query_data(QueryOptions::new(key.clone()), vec!["a".to_string()], None);
    let before = cache.find(&key).unwrap().state().data;

    let (optimistic, rollback) = (cache.clone(), cache.clone());
    let (k1, k2) = (key.clone(), key.clone());
    let mutation: Mutation<(), String, String, Option<Todos>> = Mutation::new(
      5,
      MutationOptions::new()
        .mutation_fn(|_title: String| async { Err("server down".to_string()) })
        .on_mutate(move |title| {
          if let Some(query) = optimistic.find(&k1) {
            query.cancel();
          }
          let snapshot = optimistic.get_query_data(&k1);
          let mut next = snapshot.clone().unwrap_or_default();
          next.push(title.clone());
          optimistic.set_query_data(QueryOptions::new(k1.clone()), next, None);
          snapshot
        })
        .on_error(move |_, _, ctx| {
          if let Some(Some(snapshot)) = ctx {
            rollback.set_query_data(QueryOptions::new(k2.clone()), snapshot.clone(), None);
          }
        }),
      None,
    );

    let seen_optimistic = Arc::new(Mutex::new(None::<Todos>));
    let slot = seen_optimistic.clone();
    let _sub = cache.find(&key).unwrap().subscribe(move |state| {
      let mut slot = slot.lock();
      if slot.is_none() {
        *slot = state.data.clone();
      }
    });

    assert!(mutation.mutate("b".to_string()).await.is_err());
    assert_eq!(cache.get_query_data(&key), before);
    assert_eq!(
      *seen_optimistic.lock(),
      Some(vec!["a".to_string(), "b".to_string()])
    );
  }
}
