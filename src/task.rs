//! Cancellable task handle: the reference-counted wrapper shared by the
//! thread pool, the poller's inbox, and the delay map.
//!
//! A handle has a strong and a weak observer of the same boxed closure.
//! The submitter keeps the handle (or a clone of it) and may call
//! [`Operation::cancel`] to clear the strong side; the executor dispatches
//! through the weak side and silently gets `T::default()` once the strong
//! side is gone. Because dispatch upgrades its own `Arc` before calling,
//! an in-flight call started before a concurrent `cancel()` still runs to
//! completion — cancellation only prevents calls that have not yet started.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// A boxed, `Send`, zero-argument closure returning `T`.
type Thunk<T> = dyn FnMut() -> T + Send + 'static;

struct Shared<T> {
    thunk: Mutex<Box<Thunk<T>>>,
}

/// A cancellable handle to a zero-argument closure.
///
/// Cloning an `Operation` clones the handle, not the closure: all clones
/// observe the same cancellation state. This mirrors the strong/weak pair
/// pattern used throughout the reactor for task submission (`async`/
/// `async_first`) and delayed tasks.
pub struct Operation<T = ()> {
    strong: Arc<Mutex<Option<Arc<Shared<T>>>>>,
    weak: Weak<Shared<T>>,
}

impl<T> Clone for Operation<T> {
    fn clone(&self) -> Self {
        Self {
            strong: Arc::clone(&self.strong),
            weak: self.weak.clone(),
        }
    }
}

impl<T> fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("live", &self.is_live())
            .finish()
    }
}

impl<T: Default> Operation<T> {
    /// Wrap a closure in a new, live task handle.
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut() -> T + Send + 'static,
    {
        let shared = Arc::new(Shared {
            thunk: Mutex::new(Box::new(f)),
        });
        let weak = Arc::downgrade(&shared);
        Self {
            strong: Arc::new(Mutex::new(Some(shared))),
            weak,
        }
    }

    /// Clear the strong side. Future dispatches observe `is_live() == false`
    /// and return `T::default()` instead of invoking the closure.
    ///
    /// A dispatch that already upgraded the weak side before this call
    /// still runs to completion; this only prevents calls that have not
    /// started yet.
    pub fn cancel(&self) {
        *self.strong.lock() = None;
    }

    /// True if the strong side is still present, i.e. the closure would
    /// still run if dispatched right now.
    pub fn is_live(&self) -> bool {
        self.strong.lock().is_some()
    }

    /// Invoke the closure through the weak side. Returns `T::default()`
    /// if the handle has been cancelled.
    pub fn call(&self) -> T {
        match self.weak.upgrade() {
            Some(shared) => (shared.thunk.lock())(),
            None => T::default(),
        }
    }
}

static_assertions::assert_impl_all!(Operation<()>: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn live_handle_invokes_closure() {
        let op = Operation::new(|| 42i32);
        assert!(op.is_live());
        assert_eq!(op.call(), 42);
    }

    #[test]
    fn cancel_before_call_returns_default() {
        let op = Operation::new(|| 42i32);
        op.cancel();
        assert!(!op.is_live());
        assert_eq!(op.call(), 0);
    }

    #[test]
    fn clone_shares_cancellation_state() {
        let op = Operation::new(|| ());
        let clone = op.clone();
        clone.cancel();
        assert!(!op.is_live());
    }

    #[test]
    fn mutates_captured_state_across_calls() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let op = Operation::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        op.call();
        op.call();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn in_flight_call_completes_after_concurrent_cancel() {
        // Upgrading the weak side happens before cancel() can observe it;
        // the call still completes once started.
        let op = Operation::new(|| 7i32);
        let weak = op.weak.clone();
        let shared = weak.upgrade().unwrap();
        op.cancel();
        assert!(!op.is_live());
        assert_eq!((shared.thunk.lock())(), 7);
    }
}
