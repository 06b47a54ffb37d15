//! Immutable query state snapshots.
//!
//! Every transition builds a new [`QueryState`]; a snapshot handed to a
//! listener is never changed afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
  /// No data has landed yet.
  Pending,
  Error,
  Success,
}

impl QueryStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      QueryStatus::Pending => "pending",
      QueryStatus::Error => "error",
      QueryStatus::Success => "success",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
  Idle,
  Fetching,
  /// A fetch wants to run but the client is offline.
  Paused,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<T, E> {
  pub data: Option<T>,
  pub error: Option<E>,
  pub status: QueryStatus,
  pub fetch_status: FetchStatus,
  pub data_update_count: u64,
  pub error_update_count: u64,
  pub data_updated_at: Option<DateTime<Utc>>,
  pub error_updated_at: Option<DateTime<Utc>>,
  pub fetch_failure_count: u32,
  pub fetch_failure_reason: Option<E>,
  pub is_invalidated: bool,
}

impl<T, E> Default for QueryState<T, E> {
  fn default() -> Self {
    Self {
      data: None,
      error: None,
      status: QueryStatus::Pending,
      fetch_status: FetchStatus::Idle,
      data_update_count: 0,
      error_update_count: 0,
      data_updated_at: None,
      error_updated_at: None,
      fetch_failure_count: 0,
      fetch_failure_reason: None,
      is_invalidated: false,
    }
  }
}

impl<T: Clone, E: Clone> QueryState<T, E> {
  /// The never-fetched state, optionally seeded with initial data.
  pub fn initial(initial_data: Option<T>, updated_at: Option<DateTime<Utc>>) -> Self {
    match initial_data {
      Some(data) => Self {
        data: Some(data),
        status: QueryStatus::Success,
        data_updated_at: Some(updated_at.unwrap_or_else(Utc::now)),
        ..Self::default()
      },
      None => Self::default(),
    }
  }

  /// A fetch started. Any prior error is cleared; data is kept.
  pub fn with_fetching(&self) -> Self {
    Self {
      fetch_status: FetchStatus::Fetching,
      error: None,
      fetch_failure_count: 0,
      fetch_failure_reason: None,
      ..self.clone()
    }
  }

  pub fn with_fetch_status(&self, fetch_status: FetchStatus) -> Self {
    Self {
      fetch_status,
      ..self.clone()
    }
  }

  /// An attempt failed and the retry loop will try again.
  pub fn with_failure(&self, failure_count: u32, reason: E) -> Self {
    Self {
      fetch_failure_count: failure_count,
      fetch_failure_reason: Some(reason),
      ..self.clone()
    }
  }

  /// Data landed, either from a fetch or written directly.
  pub fn with_success(&self, data: T, updated_at: DateTime<Utc>) -> Self {
    Self {
      data: Some(data),
      error: None,
      status: QueryStatus::Success,
      fetch_status: FetchStatus::Idle,
      data_update_count: self.data_update_count + 1,
      data_updated_at: Some(updated_at),
      fetch_failure_count: 0,
      fetch_failure_reason: None,
      is_invalidated: false,
      ..self.clone()
    }
  }

  /// Retries are exhausted. Existing data is kept.
  pub fn with_error(&self, error: E, at: DateTime<Utc>) -> Self {
    Self {
      error: Some(error.clone()),
      status: QueryStatus::Error,
      fetch_status: FetchStatus::Idle,
      error_update_count: self.error_update_count + 1,
      error_updated_at: Some(at),
      fetch_failure_count: self.fetch_failure_count + 1,
      fetch_failure_reason: Some(error),
      ..self.clone()
    }
  }

  pub fn invalidated(&self) -> Self {
    Self {
      is_invalidated: true,
      ..self.clone()
    }
  }
}

impl<T, E> QueryState<T, E> {
  pub fn is_pending(&self) -> bool {
    self.status == QueryStatus::Pending
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }

  pub fn is_fetching(&self) -> bool {
    self.fetch_status == FetchStatus::Fetching
  }

  pub fn is_paused(&self) -> bool {
    self.fetch_status == FetchStatus::Paused
  }

  /// Whether data has ever been stored, by fetch or by direct write.
  pub fn has_data(&self) -> bool {
    self.data_updated_at.is_some() && self.data.is_some()
  }
}
