//! A joinable registry of named worker threads.
//!
//! Used by the task-queue thread pool to detect whether the calling thread
//! already belongs to the pool (the `maySync` fast path) and to join every
//! worker on shutdown.

use std::collections::HashMap;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;

/// Registry of spawned worker threads, keyed by `ThreadId`.
pub struct ThreadGroup {
    threads: Mutex<HashMap<ThreadId, JoinHandle<()>>>,
}

impl ThreadGroup {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn `f` on a new thread and register it under its `ThreadId`.
    pub fn create_thread<F>(&self, name: impl Into<String>, f: F) -> std::io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new().name(name.into()).spawn(f)?;
        self.threads.lock().insert(handle.thread().id(), handle);
        Ok(())
    }

    /// Whether the calling thread is a member of this group.
    pub fn is_this_thread_in(&self) -> bool {
        let current = thread::current().id();
        self.threads.lock().contains_key(&current)
    }

    /// Number of registered threads.
    pub fn size(&self) -> usize {
        self.threads.lock().len()
    }

    /// Join every registered thread, draining the registry.
    ///
    /// # Panics
    ///
    /// Panics if called from a thread that is itself a member of this
    /// group — joining one's own thread would deadlock.
    pub fn join_all(&self) {
        assert!(
            !self.is_this_thread_in(),
            "ThreadGroup::join_all called from a member thread"
        );
        let handles: Vec<_> = self.threads.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Default for ThreadGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn create_and_join_all() {
        let group = Arc::new(ThreadGroup::new());
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let c = Arc::clone(&counter);
            group.create_thread("tg-test", move || {
                c.fetch_add(1, Ordering::SeqCst);
            }).unwrap();
        }
        group.join_all();
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert_eq!(group.size(), 0);
    }

    #[test]
    fn is_this_thread_in_detects_membership() {
        let group = Arc::new(ThreadGroup::new());
        let g = Arc::clone(&group);
        let (tx, rx) = std::sync::mpsc::channel();
        group.create_thread("tg-test", move || {
            tx.send(g.is_this_thread_in()).unwrap();
            // Keep the thread briefly to avoid racing join_all below.
        }).unwrap();
        assert!(rx.recv().unwrap());
        group.join_all();
        assert!(!group.is_this_thread_in());
    }
}
