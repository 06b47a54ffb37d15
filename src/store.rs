//! Long-lived query handles for services.
//!
//! A [`QueryStore`] keeps a started observer alive outside any UI lifetime,
//! so a service can own a subscription to a key for as long as it lives.

use std::fmt;
use std::sync::Arc;

use crate::error::QueryResult;
use crate::key::QueryKey;
use crate::observer::{QueryObserver, QueryObserverResult};
use crate::query::Query;
use crate::subscription::Subscription;
use crate::Payload;

pub struct QueryStore<T: Payload, E: Payload> {
  observer: QueryObserver<T, E>,
}

impl<T: Payload, E: Payload> QueryStore<T, E> {
  /// Wrap `observer`, starting it.
  pub(crate) fn new(observer: QueryObserver<T, E>) -> Self {
    observer.start();
    Self { observer }
  }

  pub fn key(&self) -> QueryKey {
    self.observer.options().key
  }

  pub fn data(&self) -> Option<T> {
    self.observer.get_current_result().data
  }

  pub fn result(&self) -> QueryObserverResult<T, E> {
    self.observer.get_current_result()
  }

  pub fn query(&self) -> Arc<Query<T, E>> {
    self.observer.query()
  }

  pub async fn refetch(&self) -> QueryResult<T, E> {
    self.observer.refetch().await
  }

  /// Overwrite the cached data, as if fetched now.
  pub fn set_data(&self, data: T) {
    self.observer.query().set_data(data, None);
  }

  pub fn subscribe(
    &self,
    listener: impl Fn(&QueryObserverResult<T, E>) + Send + Sync + 'static,
  ) -> Subscription {
    self.observer.subscribe(listener)
  }

  /// Detach from the query. Dropping the store does the same.
  pub fn dispose(&self) {
    self.observer.destroy();
  }
}

impl<T: Payload, E: Payload> fmt::Debug for QueryStore<T, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryStore")
      .field("observer", &self.observer)
      .finish()
  }
}
