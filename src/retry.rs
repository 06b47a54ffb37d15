//! Retry loop with backoff, cancellation and offline pausing.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, trace};

use crate::cancel::CancellationToken;
use crate::error::QueryError;

/// Decides whether a failed attempt is retried.
pub enum Retry<E> {
  /// Retry while `failure_count <= n`, so at most `n + 1` attempts.
  Count(u32),
  /// Retry forever (until cancelled).
  Infinite,
  /// Retry while the predicate returns true for `(failure_count, error)`.
  Custom(Arc<dyn Fn(u32, &E) -> bool + Send + Sync>),
}

impl<E> Retry<E> {
  pub fn never() -> Self {
    Retry::Count(0)
  }

  pub fn custom(f: impl Fn(u32, &E) -> bool + Send + Sync + 'static) -> Self {
    Retry::Custom(Arc::new(f))
  }

  pub fn should_retry(&self, failure_count: u32, error: &E) -> bool {
    match self {
      Retry::Count(limit) => failure_count <= *limit,
      Retry::Infinite => true,
      Retry::Custom(f) => f(failure_count, error),
    }
  }

  /// The higher of two policies. Infinite beats any count; a custom
  /// predicate only wins over another custom predicate (first one kept).
  pub fn max(self, other: Self) -> Self {
    match (self, other) {
      (Retry::Infinite, _) | (_, Retry::Infinite) => Retry::Infinite,
      (Retry::Count(a), Retry::Count(b)) => Retry::Count(a.max(b)),
      (Retry::Count(a), Retry::Custom(_)) => Retry::Count(a),
      (Retry::Custom(_), Retry::Count(b)) => Retry::Count(b),
      (custom @ Retry::Custom(_), Retry::Custom(_)) => custom,
    }
  }
}

impl<E> Clone for Retry<E> {
  fn clone(&self) -> Self {
    match self {
      Retry::Count(n) => Retry::Count(*n),
      Retry::Infinite => Retry::Infinite,
      Retry::Custom(f) => Retry::Custom(Arc::clone(f)),
    }
  }
}

impl<E> Default for Retry<E> {
  fn default() -> Self {
    Retry::Count(3)
  }
}

impl<E> fmt::Debug for Retry<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Retry::Count(n) => f.debug_tuple("Count").field(n).finish(),
      Retry::Infinite => f.write_str("Infinite"),
      Retry::Custom(_) => f.write_str("Custom(..)"),
    }
  }
}

/// Computes the sleep before the next attempt from `(attempt, error)`,
/// where `attempt` is the zero-based index of the failure just seen.
pub enum RetryDelay<E> {
  /// `1000ms * 2^min(attempt, 4)`.
  Exponential,
  Fixed(Duration),
  Custom(Arc<dyn Fn(u32, &E) -> Duration + Send + Sync>),
}

impl<E> RetryDelay<E> {
  pub fn custom(f: impl Fn(u32, &E) -> Duration + Send + Sync + 'static) -> Self {
    RetryDelay::Custom(Arc::new(f))
  }

  pub fn delay(&self, attempt: u32, error: &E) -> Duration {
    match self {
      RetryDelay::Exponential => default_retry_delay(attempt),
      RetryDelay::Fixed(d) => *d,
      RetryDelay::Custom(f) => f(attempt, error),
    }
  }
}

/// Capped exponential backoff: 1s, 2s, 4s, 8s, then 16s for every later attempt.
pub fn default_retry_delay(attempt: u32) -> Duration {
  Duration::from_millis(1000 * 2u64.pow(attempt.min(4)))
}

impl<E> Clone for RetryDelay<E> {
  fn clone(&self) -> Self {
    match self {
      RetryDelay::Exponential => RetryDelay::Exponential,
      RetryDelay::Fixed(d) => RetryDelay::Fixed(*d),
      RetryDelay::Custom(f) => RetryDelay::Custom(Arc::clone(f)),
    }
  }
}

impl<E> Default for RetryDelay<E> {
  fn default() -> Self {
    RetryDelay::Exponential
  }
}

impl<E> fmt::Debug for RetryDelay<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RetryDelay::Exponential => f.write_str("Exponential"),
      RetryDelay::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
      RetryDelay::Custom(_) => f.write_str("Custom(..)"),
    }
  }
}

/// Progress callbacks fired by [`Retryer::run`].
pub trait RetryEvents<E>: Send {
  /// An attempt failed and another one will follow.
  fn on_fail(&mut self, _failure_count: u32, _error: &E) {}

  /// The loop is waiting for the network to come back.
  fn on_pause(&mut self) {}

  /// The loop resumed after a pause.
  fn on_continue(&mut self) {}
}

impl<E> RetryEvents<E> for () {}

/// Runs an operation until it succeeds, retries are exhausted, or the
/// token is cancelled.
pub struct Retryer<E> {
  retry: Retry<E>,
  retry_delay: RetryDelay<E>,
  token: Option<CancellationToken>,
  online: Option<watch::Receiver<bool>>,
}

impl<E> Retryer<E> {
  pub fn new(retry: Retry<E>, retry_delay: RetryDelay<E>) -> Self {
    Self {
      retry,
      retry_delay,
      token: None,
      online: None,
    }
  }

  pub fn with_token(mut self, token: CancellationToken) -> Self {
    self.token = Some(token);
    self
  }

  /// Pause before attempts while the watched flag is `false`.
  pub fn with_online(mut self, online: watch::Receiver<bool>) -> Self {
    self.online = Some(online);
    self
  }

  fn is_cancelled(&self) -> bool {
    self.token.as_ref().is_some_and(CancellationToken::is_cancelled)
  }

  async fn cancelled(&self) {
    match &self.token {
      Some(token) => token.cancelled().await,
      None => futures::future::pending().await,
    }
  }

  async fn wait_online(&self, events: &mut impl RetryEvents<E>) -> Result<(), QueryError<E>> {
    let Some(online) = &self.online else {
      return Ok(());
    };
    if *online.borrow() {
      return Ok(());
    }

    trace!("offline, pausing attempt");
    events.on_pause();
    let mut online = online.clone();
    tokio::select! {
      // A dropped sender means nobody can flip us back offline
      _ = online.wait_for(|up| *up) => {}
      _ = self.cancelled() => return Err(QueryError::Cancelled),
    }
    events.on_continue();
    Ok(())
  }

  /// Drive `op` to completion.
  ///
  /// The token is checked before every attempt and after every failure, and
  /// backoff sleeps end early on cancellation.
  pub async fn run<T, F, Fut>(
    &self,
    mut op: F,
    events: &mut impl RetryEvents<E>,
  ) -> Result<T, QueryError<E>>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    let mut failure_count = 0u32;

    loop {
      if self.is_cancelled() {
        return Err(QueryError::Cancelled);
      }
      self.wait_online(events).await?;

      let error = match op().await {
        Ok(value) => return Ok(value),
        Err(error) => error,
      };

      if self.is_cancelled() {
        return Err(QueryError::Cancelled);
      }

      failure_count += 1;
      if !self.retry.should_retry(failure_count, &error) {
        debug!(failure_count, "giving up after failed attempt");
        return Err(QueryError::Failed(error));
      }

      events.on_fail(failure_count, &error);
      let delay = self.retry_delay.delay(failure_count - 1, &error);
      debug!(failure_count, ?delay, "attempt failed, retrying");

      tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = self.cancelled() => return Err(QueryError::Cancelled),
      }
    }
  }
}

impl<E> fmt::Debug for Retryer<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Retryer")
      .field("retry", &self.retry)
      .field("retry_delay", &self.retry_delay)
      .field("token", &self.token)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};

  #[derive(Default)]
  struct Recorder {
    failures: Vec<u32>,
    pauses: u32,
    resumes: u32,
  }

  impl RetryEvents<String> for Recorder {
    fn on_fail(&mut self, failure_count: u32, _error: &String) {
      self.failures.push(failure_count);
    }

    fn on_pause(&mut self) {
      self.pauses += 1;
    }

    fn on_continue(&mut self) {
      self.resumes += 1;
    }
  }

  #[test]
  fn test_default_delay_is_capped() {
    assert_eq!(default_retry_delay(0), Duration::from_secs(1));
    assert_eq!(default_retry_delay(1), Duration::from_secs(2));
    assert_eq!(default_retry_delay(3), Duration::from_secs(8));
    assert_eq!(default_retry_delay(4), Duration::from_secs(16));
    assert_eq!(default_retry_delay(9), Duration::from_secs(16));
  }

  #[test]
  fn test_retry_max() {
    let a: Retry<()> = Retry::Count(1);
    assert!(matches!(a.max(Retry::Count(4)), Retry::Count(4)));
    let b: Retry<()> = Retry::Count(10);
    assert!(matches!(b.max(Retry::Infinite), Retry::Infinite));
    let c: Retry<()> = Retry::custom(|_, _| true);
    assert!(matches!(c.max(Retry::Count(2)), Retry::Count(2)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_succeeds_after_transient_failures() {
    let attempts = Arc::new(AtomicU32::new(0));
    let retryer = Retryer::new(Retry::Count(3), RetryDelay::Exponential);
    let mut recorder = Recorder::default();

    let counter = attempts.clone();
    let result = retryer
      .run(
        || {
          let counter = counter.clone();
          async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
              Err("flaky".to_string())
            } else {
              Ok(42)
            }
          }
        },
        &mut recorder,
      )
      .await;

    assert_eq!(result, Ok(42));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(recorder.failures, vec![1, 2]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stops_after_limit_plus_one_attempts() {
    let attempts = Arc::new(AtomicU32::new(0));
    let retryer = Retryer::new(Retry::Count(2), RetryDelay::Fixed(Duration::from_millis(10)));

    let counter = attempts.clone();
    let result: Result<(), _> = retryer
      .run(
        || {
          counter.fetch_add(1, Ordering::SeqCst);
          async { Err("down".to_string()) }
        },
        &mut (),
      )
      .await;

    assert_eq!(result, Err(QueryError::Failed("down".to_string())));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_custom_predicate_sees_failure_count() {
    let retryer: Retryer<String> = Retryer::new(
      Retry::custom(|count, err: &String| count < 2 && err == "retryable"),
      RetryDelay::Fixed(Duration::ZERO),
    );
    let attempts = AtomicU32::new(0);

    let result: Result<(), _> = retryer
      .run(
        || {
          attempts.fetch_add(1, Ordering::SeqCst);
          async { Err("retryable".to_string()) }
        },
        &mut (),
      )
      .await;

    assert!(result.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_pre_cancelled_token_never_attempts() {
    let token = CancellationToken::new();
    token.cancel();
    let retryer: Retryer<String> = Retryer::new(Retry::Count(3), RetryDelay::Exponential).with_token(token);
    let attempts = AtomicU32::new(0);

    let result: Result<(), _> = retryer
      .run(
        || {
          attempts.fetch_add(1, Ordering::SeqCst);
          async { Ok(()) }
        },
        &mut (),
      )
      .await;

    assert_eq!(result, Err(QueryError::Cancelled));
    assert_eq!(attempts.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_during_backoff_does_not_retry() {
    let token = CancellationToken::new();
    let retryer: Retryer<String> = Retryer::new(Retry::Count(5), RetryDelay::Fixed(Duration::from_secs(60)))
      .with_token(token.clone());
    let attempts = Arc::new(AtomicU32::new(0));

    let canceller = token.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_secs(1)).await;
      canceller.cancel();
    });

    let counter = attempts.clone();
    let result: Result<(), _> = retryer
      .run(
        || {
          counter.fetch_add(1, Ordering::SeqCst);
          async { Err("down".to_string()) }
        },
        &mut (),
      )
      .await;

    assert_eq!(result, Err(QueryError::Cancelled));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_pauses_while_offline() {
    let (online_tx, online_rx) = watch::channel(false);
    let retryer: Retryer<String> = Retryer::new(Retry::Count(0), RetryDelay::Exponential).with_online(online_rx);
    let mut recorder = Recorder::default();

    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_secs(5)).await;
      let _ = online_tx.send(true);
    });

    let result = retryer.run(|| async { Ok::<_, String>(1) }, &mut recorder).await;

    assert_eq!(result, Ok(1));
    assert_eq!(recorder.pauses, 1);
    assert_eq!(recorder.resumes, 1);
  }
}
