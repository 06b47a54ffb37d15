//! Durable snapshots of query data.
//!
//! A [`Persister`] stores [`PersistedQuery`] rows; the [`PersistenceManager`]
//! decides which queries are written, and seeds a cache from storage on
//! hydrate.

mod manager;
mod memory;
mod sqlite;

pub use manager::{PersistOptions, PersistenceManager};
pub use memory::InMemoryPersister;
pub use sqlite::SqlitePersister;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::key::QueryKey;
use crate::state::QueryStatus;

/// One stored query snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedQuery {
  pub key: QueryKey,
  /// Canonical key hash, namespaced by the registration's key prefix.
  pub key_hash: String,
  /// Serialized payload.
  pub payload: String,
  pub status: QueryStatus,
  /// When the payload was originally fetched.
  pub data_updated_at: DateTime<Utc>,
  pub persisted_at: DateTime<Utc>,
}

/// Filter handed to [`Persister::remove_queries`].
pub type PersistedFilter<'a> = &'a (dyn Fn(&PersistedQuery) -> bool + Send + Sync);

/// Storage backend for query snapshots, keyed by `key_hash`.
#[async_trait]
pub trait Persister: Send + Sync {
  /// Prepare the backend. Called once before first use.
  async fn init(&self) -> Result<()> {
    Ok(())
  }

  /// Insert or replace the entry stored under `entry.key_hash`.
  async fn persist_query(&self, entry: PersistedQuery) -> Result<()>;

  async fn restore_query(&self, key_hash: &str) -> Result<Option<PersistedQuery>>;

  async fn restore_all(&self) -> Result<Vec<PersistedQuery>>;

  async fn remove_query(&self, key_hash: &str) -> Result<()>;

  /// Remove every entry `filter` accepts, returning how many went.
  async fn remove_queries(&self, filter: PersistedFilter<'_>) -> Result<usize>;

  async fn clear(&self) -> Result<()>;

  /// Release the backend. Later calls may fail.
  async fn close(&self) -> Result<()> {
    Ok(())
  }
}
