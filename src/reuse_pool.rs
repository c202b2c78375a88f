//! Thread-safe object reuse pool.
//!
//! Recycles short-lived heap objects through smart handles. Handles carry
//! a weak back-reference to the pool (so an outliving handle degrades to
//! plain deletion) and an atomic "quit" flag a caller can set to force
//! deletion instead of recycling. The free list is guarded by a
//! test-and-set spin flag sized for microsecond-scale critical sections:
//! on contention, `obtain`/`recycle` fall through to allocating/deleting
//! directly rather than spinning.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::error::{LatticeError, Result};

const DEFAULT_CAPACITY: usize = 8;

/// Configuration for a [`ReusePool`], currently just its free-list bound.
#[derive(Debug, Clone, Copy)]
pub struct ReusePoolConfig {
    /// Maximum number of recycled objects the free list holds before
    /// excess handles are destroyed instead of queued.
    pub capacity: usize,
}

impl Default for ReusePoolConfig {
    fn default() -> Self {
        Self { capacity: DEFAULT_CAPACITY }
    }
}

impl ReusePoolConfig {
    /// Start from the default capacity (8).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the free-list capacity.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

struct Inner<T: Send + 'static> {
    capacity: usize,
    // Guarded solely by `busy`: every access happens between a successful
    // `try_acquire` and the matching `store(false, ..)`. No separate lock
    // wraps it, since that would make `busy` redundant.
    free_list: UnsafeCell<VecDeque<Box<T>>>,
    busy: AtomicBool,
    allocator: Box<dyn Fn() -> Result<Box<T>> + Send + Sync>,
}

// SAFETY: `free_list` is only ever touched while `busy` has been
// successfully test-and-set, which admits at most one thread at a time.
unsafe impl<T: Send + 'static> Sync for Inner<T> {}

/// A bounded free-list pool of recyclable heap objects of type `T`.
pub struct ReusePool<T: Send + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Clone for ReusePool<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Send + 'static> ReusePool<T> {
    /// Create a pool with the default capacity (8), sourcing new objects
    /// from `allocator` when the free list is empty.
    pub fn new<F>(allocator: F) -> Self
    where
        F: Fn() -> Result<Box<T>> + Send + Sync + 'static,
    {
        Self::with_capacity(DEFAULT_CAPACITY, allocator)
    }

    /// Create a pool with an explicit free-list capacity.
    pub fn with_capacity<F>(capacity: usize, allocator: F) -> Self
    where
        F: Fn() -> Result<Box<T>> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                capacity,
                free_list: UnsafeCell::new(VecDeque::new()),
                busy: AtomicBool::new(false),
                allocator: Box::new(allocator),
            }),
        }
    }

    /// Create a pool from a [`ReusePoolConfig`].
    pub fn with_config<F>(config: ReusePoolConfig, allocator: F) -> Self
    where
        F: Fn() -> Result<Box<T>> + Send + Sync + 'static,
    {
        Self::with_capacity(config.capacity, allocator)
    }

    /// Number of objects currently sitting in the free list. Reports 0
    /// under contention on the spin flag rather than waiting for it.
    pub fn len(&self) -> usize {
        if try_acquire(&self.inner.busy) {
            // SAFETY: we hold the spin flag.
            let n = unsafe { &*self.inner.free_list.get() }.len();
            self.inner.busy.store(false, Ordering::Release);
            n
        } else {
            0
        }
    }

    /// Whether the free list currently holds no recycled objects.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Obtain a handle: pop the most-recently-recycled object (LIFO) if the
    /// free list is non-empty, otherwise allocate a fresh one. Under
    /// contention on the spin flag, allocates fresh rather than waiting.
    pub fn obtain(&self) -> Result<PoolHandle<T>> {
        let object = if try_acquire(&self.inner.busy) {
            // SAFETY: we hold the spin flag.
            let popped = unsafe { &mut *self.inner.free_list.get() }.pop_back();
            self.inner.busy.store(false, Ordering::Release);
            match popped {
                Some(obj) => obj,
                None => (self.inner.allocator)()?,
            }
        } else {
            (self.inner.allocator)()?
        };

        Ok(PoolHandle {
            object: Some(object),
            pool: Arc::downgrade(&self.inner),
            quit: Arc::new(AtomicBool::new(false)),
        })
    }

    fn recycle(&self, object: Box<T>, quit: bool) {
        if quit {
            drop(object);
            return;
        }
        if try_acquire(&self.inner.busy) {
            // SAFETY: we hold the spin flag.
            let list = unsafe { &mut *self.inner.free_list.get() };
            if list.len() >= self.inner.capacity {
                self.inner.busy.store(false, Ordering::Release);
                drop(object);
            } else {
                list.push_back(object);
                self.inner.busy.store(false, Ordering::Release);
            }
        } else {
            // Contended: do not spin, just delete.
            drop(object);
        }
    }
}

/// Test-and-set acquire: returns `true` if this call won the flag.
fn try_acquire(flag: &AtomicBool) -> bool {
    flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
}

/// A handle to a pooled object. Recycles into the pool on drop unless
/// [`PoolHandle::quit`] has been called, in which case the object is
/// destroyed instead.
pub struct PoolHandle<T: Send + 'static> {
    object: Option<Box<T>>,
    pool: Weak<Inner<T>>,
    quit: Arc<AtomicBool>,
}

impl<T: Send + 'static> PoolHandle<T> {
    /// Divert this handle's object to plain deletion instead of recycling
    /// when the handle is dropped.
    pub fn quit(&self, flag: bool) {
        self.quit.store(flag, Ordering::SeqCst);
    }
}

impl<T: Send + 'static> std::ops::Deref for PoolHandle<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.object.as_ref().expect("object taken before drop")
    }
}

impl<T: Send + 'static> std::ops::DerefMut for PoolHandle<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.object.as_mut().expect("object taken before drop")
    }
}

impl<T: Send + 'static> Drop for PoolHandle<T> {
    fn drop(&mut self) {
        let Some(object) = self.object.take() else { return };
        let quit = self.quit.load(Ordering::SeqCst);
        match self.pool.upgrade() {
            Some(inner) => {
                let pool = ReusePool { inner };
                pool.recycle(object, quit);
            }
            None => drop(object),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_pool(cap: usize) -> (ReusePool<i32>, Arc<AtomicUsize>) {
        let allocs = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&allocs);
        let pool = ReusePool::with_capacity(cap, move || {
            a.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(0))
        });
        (pool, allocs)
    }

    #[test]
    fn obtain_allocates_when_empty() {
        let (pool, allocs) = counting_pool(8);
        let _h = pool.obtain().unwrap();
        assert_eq!(allocs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn recycled_object_is_reused() {
        let (pool, allocs) = counting_pool(8);
        {
            let _h = pool.obtain().unwrap();
        }
        assert_eq!(pool.len(), 1);
        let _h2 = pool.obtain().unwrap();
        assert_eq!(allocs.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn excess_handles_beyond_capacity_are_destroyed_not_queued() {
        let (pool, _allocs) = counting_pool(4);
        let handles: Vec<_> = (0..8).map(|_| pool.obtain().unwrap()).collect();
        drop(handles);
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn quit_flagged_handle_is_destroyed_regardless_of_capacity() {
        let (pool, _allocs) = counting_pool(8);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let h = pool.obtain().unwrap();
                h.quit(i % 2 == 0);
                h
            })
            .collect();
        drop(handles);
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn allocator_failure_propagates_to_obtain() {
        let pool: ReusePool<i32> =
            ReusePool::new(|| Err(LatticeError::ReusePoolAllocation("boom".into())));
        assert!(pool.obtain().is_err());
    }

    #[test]
    fn concurrent_obtain_and_release_never_duplicates_objects() {
        let (pool, _allocs) = counting_pool(8);
        let mut handles = Vec::new();
        for t in 0..4 {
            let p = pool.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let h = p.obtain().unwrap();
                    h.quit(t % 2 == 0);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(pool.len() <= 8);
    }
}
