use std::collections::BTreeMap;

use async_trait::async_trait;
use color_eyre::Result;
use parking_lot::Mutex;

use super::{PersistedFilter, PersistedQuery, Persister};

/// Keeps snapshots in a map. Useful as a test double and for hosts that
/// only want persistence within one process lifetime.
#[derive(Debug, Default)]
pub struct InMemoryPersister {
  entries: Mutex<BTreeMap<String, PersistedQuery>>,
}

impl InMemoryPersister {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.entries.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.lock().is_empty()
  }
}

#[async_trait]
impl Persister for InMemoryPersister {
  async fn persist_query(&self, entry: PersistedQuery) -> Result<()> {
    self.entries.lock().insert(entry.key_hash.clone(), entry);
    Ok(())
  }

  async fn restore_query(&self, key_hash: &str) -> Result<Option<PersistedQuery>> {
    Ok(self.entries.lock().get(key_hash).cloned())
  }

  async fn restore_all(&self) -> Result<Vec<PersistedQuery>> {
    Ok(self.entries.lock().values().cloned().collect())
  }

  async fn remove_query(&self, key_hash: &str) -> Result<()> {
    self.entries.lock().remove(key_hash);
    Ok(())
  }

  async fn remove_queries(&self, filter: PersistedFilter<'_>) -> Result<usize> {
    let mut entries = self.entries.lock();
    let before = entries.len();
    entries.retain(|_, entry| !filter(entry));
    Ok(before - entries.len())
  }

  async fn clear(&self) -> Result<()> {
    self.entries.lock().clear();
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::key::QueryKey;
  use crate::query_key;
  use crate::state::QueryStatus;
  use chrono::Utc;

  fn entry(key: QueryKey, payload: &str) -> PersistedQuery {
    PersistedQuery {
      key_hash: key.hash(),
      key,
      payload: payload.to_string(),
      status: QueryStatus::Success,
      data_updated_at: Utc::now(),
      persisted_at: Utc::now(),
    }
  }

  #[tokio::test]
  async fn test_persist_replaces_by_hash() {
    let persister = InMemoryPersister::new();
    persister.persist_query(entry(query_key!["a"], "1")).await.unwrap();
    persister.persist_query(entry(query_key!["a"], "2")).await.unwrap();

    assert_eq!(persister.len(), 1);
    let restored = persister.restore_query(r#"["a"]"#).await.unwrap().unwrap();
    assert_eq!(restored.payload, "2");
  }

  #[tokio::test]
  async fn test_remove_queries_by_filter() {
    let persister = InMemoryPersister::new();
    persister.persist_query(entry(query_key!["todos", 1], "a")).await.unwrap();
    persister.persist_query(entry(query_key!["todos", 2], "b")).await.unwrap();
    persister.persist_query(entry(query_key!["users"], "c")).await.unwrap();

    let todos = query_key!["todos"];
    let removed = persister
      .remove_queries(&|e: &PersistedQuery| e.key.matches(&todos))
      .await
      .unwrap();

    assert_eq!(removed, 2);
    let left = persister.restore_all().await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].key, query_key!["users"]);

    persister.clear().await.unwrap();
    assert!(persister.is_empty());
  }
}
