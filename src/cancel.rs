//! Cooperative cancellation.
//!
//! A [`CancellationToken`] never interrupts running work. Fetch functions and
//! the retry loop poll it (or await [`CancellationToken::cancelled`]) and stop
//! on their own.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

type CancelListener = Box<dyn FnOnce() + Send>;

struct Inner {
  cancelled: AtomicBool,
  listeners: Mutex<Vec<CancelListener>>,
  notify: Notify,
}

/// A shared cancel flag with one-shot listeners.
#[derive(Clone)]
pub struct CancellationToken {
  inner: Arc<Inner>,
}

impl CancellationToken {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Inner {
        cancelled: AtomicBool::new(false),
        listeners: Mutex::new(Vec::new()),
        notify: Notify::new(),
      }),
    }
  }

  pub fn is_cancelled(&self) -> bool {
    self.inner.cancelled.load(Ordering::Acquire)
  }

  /// Cancel the token.
  ///
  /// Listeners run once, in registration order, on the calling thread.
  /// Cancelling an already cancelled token does nothing.
  pub fn cancel(&self) {
    let listeners = {
      let mut listeners = self.inner.listeners.lock();
      if self.inner.cancelled.swap(true, Ordering::AcqRel) {
        return;
      }
      std::mem::take(&mut *listeners)
    };

    self.inner.notify.notify_waiters();

    for listener in listeners {
      listener();
    }
  }

  /// Register a listener. Fires immediately if the token is already cancelled.
  pub fn on_cancel(&self, listener: impl FnOnce() + Send + 'static) {
    {
      let mut listeners = self.inner.listeners.lock();
      if !self.is_cancelled() {
        listeners.push(Box::new(listener));
        return;
      }
    }
    listener();
  }

  /// Resolve once the token is cancelled.
  pub async fn cancelled(&self) {
    let notified = self.inner.notify.notified();
    tokio::pin!(notified);
    // Register interest before checking the flag so a concurrent cancel is not missed
    notified.as_mut().enable();
    if self.is_cancelled() {
      return;
    }
    notified.await;
  }
}

impl Default for CancellationToken {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for CancellationToken {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CancellationToken")
      .field("cancelled", &self.is_cancelled())
      .finish_non_exhaustive()
  }
}
