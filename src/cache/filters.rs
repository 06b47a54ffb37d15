use std::fmt;
use std::sync::Arc;

use crate::key::QueryKey;
use crate::query::Query;
use crate::Payload;

/// Which invalidated queries a sweep refetches afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefetchMode {
  /// Only mark stale.
  None,
  /// Queries with at least one enabled observer.
  #[default]
  Active,
  Inactive,
  All,
}

impl RefetchMode {
  pub fn includes(&self, active: bool) -> bool {
    match self {
      RefetchMode::None => false,
      RefetchMode::Active => active,
      RefetchMode::Inactive => !active,
      RefetchMode::All => true,
    }
  }
}

type QueryPredicate<T, E> = Arc<dyn Fn(&Query<T, E>) -> bool + Send + Sync>;

/// Selects queries for lookups and client sweeps. Every set field must match.
pub struct QueryFilters<T, E> {
  /// Prefix filter; an empty key matches everything.
  pub key: Option<QueryKey>,
  /// Require the whole key to match rather than a prefix.
  pub exact: bool,
  pub stale: Option<bool>,
  pub fetching: Option<bool>,
  pub active: Option<bool>,
  pub predicate: Option<QueryPredicate<T, E>>,
}

impl<T, E> QueryFilters<T, E> {
  /// Matches every query.
  pub fn all() -> Self {
    Self {
      key: None,
      exact: false,
      stale: None,
      fetching: None,
      active: None,
      predicate: None,
    }
  }

  pub fn key(key: impl Into<QueryKey>) -> Self {
    Self {
      key: Some(key.into()),
      ..Self::all()
    }
  }

  pub fn exact(mut self) -> Self {
    self.exact = true;
    self
  }

  pub fn stale(mut self, stale: bool) -> Self {
    self.stale = Some(stale);
    self
  }

  pub fn fetching(mut self, fetching: bool) -> Self {
    self.fetching = Some(fetching);
    self
  }

  pub fn active(mut self, active: bool) -> Self {
    self.active = Some(active);
    self
  }

  pub fn predicate(mut self, f: impl Fn(&Query<T, E>) -> bool + Send + Sync + 'static) -> Self {
    self.predicate = Some(Arc::new(f));
    self
  }
}

impl<T: Payload, E: Payload> QueryFilters<T, E> {
  pub fn matches(&self, query: &Query<T, E>) -> bool {
    if let Some(key) = &self.key {
      let hit = if self.exact {
        query.key() == key
      } else {
        query.key().matches(key)
      };
      if !hit {
        return false;
      }
    }
    if self.stale.is_some_and(|stale| query.is_stale() != stale) {
      return false;
    }
    if self.fetching.is_some_and(|fetching| query.is_fetching() != fetching) {
      return false;
    }
    if self.active.is_some_and(|active| query.is_active() != active) {
      return false;
    }
    self.predicate.as_ref().map_or(true, |f| f(query))
  }
}

impl<T, E> Default for QueryFilters<T, E> {
  fn default() -> Self {
    Self::all()
  }
}

impl<T, E> Clone for QueryFilters<T, E> {
  fn clone(&self) -> Self {
    Self {
      key: self.key.clone(),
      exact: self.exact,
      stale: self.stale,
      fetching: self.fetching,
      active: self.active,
      predicate: self.predicate.clone(),
    }
  }
}

impl<T, E> From<QueryKey> for QueryFilters<T, E> {
  fn from(key: QueryKey) -> Self {
    Self::key(key)
  }
}

impl<T, E> fmt::Debug for QueryFilters<T, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryFilters")
      .field("key", &self.key)
      .field("exact", &self.exact)
      .field("stale", &self.stale)
      .field("fetching", &self.fetching)
      .field("active", &self.active)
      .field("predicate", &self.predicate.is_some())
      .finish()
  }
}
