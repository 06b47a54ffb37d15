use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use super::mutation::{Mutation, MutationEntry, MutationOptions, MutationStatus};
use crate::cache::DEFAULT_EVENT_CAPACITY;
use crate::key::QueryKey;
use crate::Payload;

/// Change notifications published by a mutation cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationCacheEvent {
  Added { id: u64 },
  Updated { id: u64, status: MutationStatus },
  Removed { id: u64 },
}

type MutationPredicate = Arc<dyn Fn(&dyn MutationEntry) -> bool + Send + Sync>;

/// Selects mutations. Every set field must match.
#[derive(Clone, Default)]
pub struct MutationFilters {
  pub pending: Option<bool>,
  /// Prefix match against the mutation key.
  pub mutation_key: Option<QueryKey>,
  pub predicate: Option<MutationPredicate>,
}

impl MutationFilters {
  pub fn all() -> Self {
    Self::default()
  }

  pub fn pending(mut self, pending: bool) -> Self {
    self.pending = Some(pending);
    self
  }

  pub fn mutation_key(mut self, key: impl Into<QueryKey>) -> Self {
    self.mutation_key = Some(key.into());
    self
  }

  pub fn predicate(mut self, f: impl Fn(&dyn MutationEntry) -> bool + Send + Sync + 'static) -> Self {
    self.predicate = Some(Arc::new(f));
    self
  }

  pub fn matches(&self, mutation: &dyn MutationEntry) -> bool {
    if let Some(pending) = self.pending {
      if (mutation.status() == MutationStatus::Pending) != pending {
        return false;
      }
    }
    if let Some(filter) = &self.mutation_key {
      match mutation.mutation_key() {
        Some(key) if key.matches(filter) => {}
        _ => return false,
      }
    }
    self.predicate.as_ref().map_or(true, |f| f(mutation))
  }
}

impl fmt::Debug for MutationFilters {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MutationFilters")
      .field("pending", &self.pending)
      .field("mutation_key", &self.mutation_key)
      .field("predicate", &self.predicate.is_some())
      .finish()
  }
}

struct Inner {
  mutations: RwLock<BTreeMap<u64, Arc<dyn MutationEntry>>>,
  next_id: AtomicU64,
  events: broadcast::Sender<MutationCacheEvent>,
}

/// Registry of every mutation built through it, in creation order.
///
/// Nothing is deduplicated: each built mutation is independent.
#[derive(Clone)]
pub struct MutationCache {
  inner: Arc<Inner>,
}

impl MutationCache {
  pub fn new() -> Self {
    Self::with_capacity(DEFAULT_EVENT_CAPACITY)
  }

  pub fn with_capacity(event_capacity: usize) -> Self {
    let (events, _) = broadcast::channel(event_capacity.max(1));
    Self {
      inner: Arc::new(Inner {
        mutations: RwLock::new(BTreeMap::new()),
        next_id: AtomicU64::new(1),
        events,
      }),
    }
  }

  pub fn build<D, E, V, C>(&self, options: MutationOptions<D, E, V, C>) -> Arc<Mutation<D, E, V, C>>
  where
    D: Payload,
    E: Payload,
    V: Payload,
    C: Payload,
  {
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    let mutation = Arc::new(Mutation::new(id, options, Some(self.inner.events.clone())));
    self
      .inner
      .mutations
      .write()
      .insert(id, Arc::clone(&mutation) as Arc<dyn MutationEntry>);
    debug!(mutation = id, "mutation added");
    let _ = self.inner.events.send(MutationCacheEvent::Added { id });
    mutation
  }

  /// Typed lookup; `None` if the id is unknown or the types differ.
  pub fn get<D, E, V, C>(&self, id: u64) -> Option<Arc<Mutation<D, E, V, C>>>
  where
    D: Payload,
    E: Payload,
    V: Payload,
    C: Payload,
  {
    let entry = self.inner.mutations.read().get(&id).cloned()?;
    entry.as_any().downcast::<Mutation<D, E, V, C>>().ok()
  }

  pub fn find_all(&self, filters: &MutationFilters) -> Vec<Arc<dyn MutationEntry>> {
    let all: Vec<_> = self.inner.mutations.read().values().cloned().collect();
    all.into_iter().filter(|m| filters.matches(m.as_ref())).collect()
  }

  pub fn remove(&self, id: u64) -> bool {
    let removed = self.inner.mutations.write().remove(&id).is_some();
    if removed {
      let _ = self.inner.events.send(MutationCacheEvent::Removed { id });
    }
    removed
  }

  pub fn clear(&self) {
    let removed = std::mem::take(&mut *self.inner.mutations.write());
    for id in removed.into_keys() {
      let _ = self.inner.events.send(MutationCacheEvent::Removed { id });
    }
  }

  pub fn len(&self) -> usize {
    self.inner.mutations.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.inner.mutations.read().is_empty()
  }

  /// Number of mutations currently pending.
  pub fn pending_count(&self) -> usize {
    self.find_all(&MutationFilters::all().pending(true)).len()
  }

  pub fn subscribe_events(&self) -> broadcast::Receiver<MutationCacheEvent> {
    self.inner.events.subscribe()
  }
}

impl Default for MutationCache {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for MutationCache {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MutationCache")
      .field("mutations", &self.len())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query_key;
  use std::time::Duration;

  fn slow_options(key: QueryKey) -> MutationOptions<u32, String, u32, ()> {
    MutationOptions::new()
      .mutation_key(key)
      .mutation_fn(|n: u32| async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(n)
      })
  }

  #[tokio::test(start_paused = true)]
  async fn test_find_all_by_status_and_key() {
    let cache = MutationCache::new();
    let add = cache.build(slow_options(query_key!["todos", "add"]));
    let remove = cache.build(slow_options(query_key!["todos", "remove"]));
    let other = cache.build(slow_options(query_key!["users"]));
    assert_eq!(cache.len(), 3);

    let running = tokio::spawn({
      let add = add.clone();
      async move { add.mutate(1).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(cache.pending_count(), 1);
    let pending = cache.find_all(&MutationFilters::all().pending(true));
    assert_eq!(pending[0].id(), add.id());

    let todos = cache.find_all(&MutationFilters::all().mutation_key(query_key!["todos"]));
    assert_eq!(todos.len(), 2);

    let by_id = cache.find_all(&MutationFilters::all().predicate({
      let id = other.id();
      move |m| m.id() == id
    }));
    assert_eq!(by_id.len(), 1);

    assert_eq!(running.await.unwrap(), Ok(1));
    assert_eq!(cache.pending_count(), 0);
    assert!(remove.state().is_idle());
  }

  #[test]
  fn test_build_never_deduplicates() {
    let cache = MutationCache::new();
    let a = cache.build(slow_options(query_key!["same"]));
    let b = cache.build(slow_options(query_key!["same"]));
    assert_ne!(a.id(), b.id());
    assert!(b.id() > a.id());
    assert_eq!(cache.len(), 2);
  }

  #[test]
  fn test_typed_get_and_remove() {
    let cache = MutationCache::new();
    let mutation = cache.build(slow_options(query_key!["x"]));
    let id = mutation.id();

    assert!(cache.get::<u32, String, u32, ()>(id).is_some());
    assert!(cache.get::<String, String, u32, ()>(id).is_none());

    let mut events = cache.subscribe_events();
    assert!(cache.remove(id));
    assert!(!cache.remove(id));
    assert_eq!(events.try_recv().unwrap(), MutationCacheEvent::Removed { id });

    cache.build(slow_options(query_key!["y"]));
    cache.clear();
    assert!(cache.is_empty());
  }
}
