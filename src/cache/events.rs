use crate::state::{FetchStatus, QueryStatus};

/// Change notifications published by a query cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryCacheEvent {
  Added {
    hash: String,
  },
  Removed {
    hash: String,
  },
  /// A query's state snapshot changed.
  Updated {
    hash: String,
    status: QueryStatus,
    fetch_status: FetchStatus,
  },
  ObserverAdded {
    hash: String,
    observers: usize,
  },
  ObserverRemoved {
    hash: String,
    observers: usize,
  },
}

impl QueryCacheEvent {
  pub fn hash(&self) -> &str {
    match self {
      QueryCacheEvent::Added { hash }
      | QueryCacheEvent::Removed { hash }
      | QueryCacheEvent::Updated { hash, .. }
      | QueryCacheEvent::ObserverAdded { hash, .. }
      | QueryCacheEvent::ObserverRemoved { hash, .. } => hash,
    }
  }
}
