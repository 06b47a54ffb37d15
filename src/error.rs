//! Error types for fetches and mutations.

use thiserror::Error;

/// Errors surfaced by query fetches and mutations.
///
/// `E` is the error type returned by the user's fetch or mutation function.
/// Cancellation is a separate variant and is never recorded as a failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError<E> {
  /// The fetch or mutation function failed and retries are exhausted.
  #[error("fetch failed: {0:?}")]
  Failed(E),

  /// The operation observed its cancellation token and stopped.
  #[error("query cancelled")]
  Cancelled,

  /// A fetch was requested for a key with no fetch function configured.
  #[error("no query function configured for key {key}")]
  MissingQueryFn { key: String },

  /// A mutation was started without a mutation function.
  #[error("no mutation function configured")]
  MissingMutationFn,

  /// The background task driving the fetch panicked or was torn down.
  #[error("fetch task aborted: {0}")]
  Aborted(String),
}

impl<E> QueryError<E> {
  pub fn is_cancelled(&self) -> bool {
    matches!(self, QueryError::Cancelled)
  }

  /// The user error, if this is a fetch failure.
  pub fn failure(&self) -> Option<&E> {
    match self {
      QueryError::Failed(e) => Some(e),
      _ => None,
    }
  }

  pub fn into_failure(self) -> Option<E> {
    match self {
      QueryError::Failed(e) => Some(e),
      _ => None,
    }
  }
}

pub type QueryResult<T, E> = std::result::Result<T, QueryError<E>>;
