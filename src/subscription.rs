use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A state-change callback.
pub type Listener<S> = Arc<dyn Fn(&S) + Send + Sync>;

/// Identifies one attached observer or listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl ObserverId {
  pub fn next() -> Self {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    Self(NEXT.fetch_add(1, Ordering::Relaxed))
  }
}

/// Detaches a listener when dropped or when [`Subscription::unsubscribe`] is called.
#[must_use = "dropping a Subscription detaches the listener immediately"]
pub struct Subscription {
  unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
  pub(crate) fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
    Self {
      unsubscribe: Some(Box::new(unsubscribe)),
    }
  }

  pub fn unsubscribe(mut self) {
    if let Some(f) = self.unsubscribe.take() {
      f();
    }
  }

  /// Keep the listener attached for the lifetime of its source.
  pub fn detach(mut self) {
    self.unsubscribe = None;
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(f) = self.unsubscribe.take() {
      f();
    }
  }
}

impl fmt::Debug for Subscription {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Subscription")
      .field("active", &self.unsubscribe.is_some())
      .finish()
  }
}
