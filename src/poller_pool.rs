//! Process-wide poller and worker pool singletons, plus the thread-id →
//! poller registry that lets a loop thread discover its own poller.
//!
//! `PollerPool` shards reactor work across a fixed set of pollers chosen
//! by least-loaded round robin. `WorkerPool` is a second, same-shaped
//! singleton for blocking/CPU-bound work, running at a lower priority and
//! deliberately left out of the thread-id → poller registry so offloading
//! work to it never gets mistaken for "the caller's own poller".

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::error::LatticeError;
use crate::poller::{Poller, PollerConfig};
use crate::threadpool::SchedPriority;

static ALL_POLLERS: Mutex<Option<HashMap<ThreadId, Weak<Poller>>>> = Mutex::new(None);

pub(crate) fn register_current_poller(poller: &Arc<Poller>) {
    let mut guard = ALL_POLLERS.lock();
    let map = guard.get_or_insert_with(HashMap::new);
    map.insert(thread::current().id(), Arc::downgrade(poller));
}

pub(crate) fn unregister_current_poller() {
    if let Some(map) = ALL_POLLERS.lock().as_mut() {
        map.remove(&thread::current().id());
    }
}

/// Look up the poller whose loop thread is the calling thread, if any.
pub fn current_poller() -> Option<Arc<Poller>> {
    let guard = ALL_POLLERS.lock();
    let map = guard.as_ref()?;
    map.get(&thread::current().id())?.upgrade()
}

/// Configuration for a [`PollerPool`] or [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct PollerPoolConfig {
    /// Number of pollers to create; defaults to available parallelism.
    pub pool_size: Option<usize>,
    /// Whether `get_poller` should prefer the caller's own loop thread.
    pub prefer_current_thread: bool,
    /// OS scheduling priority hint applied to every poller's loop thread.
    pub priority: SchedPriority,
}

impl Default for PollerPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: None,
            prefer_current_thread: true,
            priority: SchedPriority::Highest,
        }
    }
}

impl PollerPoolConfig {
    /// Start from the default config (auto-sized, prefer current thread).
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the pool to an explicit number of pollers.
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    /// Set whether `get_poller` should prefer the caller's own loop thread.
    pub fn prefer_current_thread(mut self, flag: bool) -> Self {
        self.prefer_current_thread = flag;
        self
    }

    /// Set the OS scheduling priority hint for every poller's loop thread.
    pub fn priority(mut self, priority: SchedPriority) -> Self {
        self.priority = priority;
        self
    }
}

fn resolve_pool_size(requested: Option<usize>) -> usize {
    requested
        .or_else(|| thread::available_parallelism().ok().map(|n| n.get()))
        .unwrap_or(1)
}

/// A fixed-size, least-loaded-routed set of [`Poller`]s, each running its
/// own loop thread, registered in the thread-id → poller map so
/// `current_poller()` finds them.
pub struct PollerPool {
    pollers: Vec<Arc<Poller>>,
    cursor: Mutex<usize>,
    prefer_current_thread: bool,
}

static GLOBAL_POLLER_POOL: OnceLock<PollerPool> = OnceLock::new();

impl PollerPool {
    fn build(config: PollerPoolConfig, register_self: bool) -> crate::error::Result<Self> {
        let size = resolve_pool_size(config.pool_size);
        let mut pollers = Vec::with_capacity(size);
        for _ in 0..size {
            let poller = Poller::new(
                PollerConfig::new()
                    .priority(config.priority)
                    .register_self(register_self),
            )?;
            poller.run_loop(false)?;
            pollers.push(poller);
        }
        tracing::info!(target: "lattice_reactor::poller_pool", count = size, "created poller pool");
        Ok(Self {
            pollers,
            cursor: Mutex::new(0),
            prefer_current_thread: config.prefer_current_thread,
        })
    }

    /// The process-wide poller pool, lazily created with the default config
    /// on first access.
    pub fn global() -> &'static PollerPool {
        GLOBAL_POLLER_POOL.get_or_init(|| {
            PollerPool::build(PollerPoolConfig::default(), true)
                .expect("failed to construct the global poller pool")
        })
    }

    /// Explicitly construct the process-wide poller pool with `config`.
    /// Fails with [`crate::error::LatticeError::PoolAlreadyInitialized`] if
    /// `global()` or `try_init` has already run; use this instead of
    /// `global()` when startup code needs a non-default pool size.
    pub fn try_init(config: PollerPoolConfig) -> crate::error::Result<&'static PollerPool> {
        if GLOBAL_POLLER_POOL.get().is_some() {
            return Err(LatticeError::PoolAlreadyInitialized);
        }
        let pool = PollerPool::build(config, true)?;
        GLOBAL_POLLER_POOL
            .set(pool)
            .map_err(|_| LatticeError::PoolAlreadyInitialized)?;
        Ok(GLOBAL_POLLER_POOL.get().expect("just set"))
    }

    /// Look up a pool previously created by `try_init` or `global`, without
    /// implicitly creating one. Fails with
    /// [`crate::error::LatticeError::PoolNotInitialized`] if neither has run
    /// yet.
    pub fn try_get() -> crate::error::Result<&'static PollerPool> {
        GLOBAL_POLLER_POOL.get().ok_or(LatticeError::PoolNotInitialized)
    }

    /// The caller's own poller (if it is itself a loop thread and
    /// `prefer_current_thread` is set), otherwise the least-loaded poller
    /// found by a round-robin scan that stops early at load 0.
    pub fn get_poller(&self) -> Arc<Poller> {
        if self.prefer_current_thread {
            if let Some(poller) = current_poller() {
                return poller;
            }
        }
        self.least_loaded()
    }

    /// The canonical "main" poller — always the vector's head.
    pub fn get_first_poller(&self) -> Arc<Poller> {
        Arc::clone(&self.pollers[0])
    }

    fn least_loaded(&self) -> Arc<Poller> {
        let mut pos = *self.cursor.lock();
        if pos >= self.pollers.len() {
            pos = 0;
        }
        let mut best = pos;
        let mut best_load = self.pollers[pos].load();
        for _ in 0..self.pollers.len() {
            let load = self.pollers[pos].load();
            if load < best_load {
                best = pos;
                best_load = load;
            }
            if best_load == 0 {
                break;
            }
            pos = (pos + 1) % self.pollers.len();
        }
        *self.cursor.lock() = pos;
        Arc::clone(&self.pollers[best])
    }

    /// Per-poller integer load percent, in pool order.
    pub fn loads(&self) -> Vec<u32> {
        self.pollers.iter().map(|p| p.load()).collect()
    }

    /// Number of pollers in the pool.
    pub fn size(&self) -> usize {
        self.pollers.len()
    }
}

/// A second singleton of the same shape as [`PollerPool`], intended for
/// blocking or CPU-bound work. Not self-registered in the thread-id →
/// poller map so offloaded work is never mistaken for a caller's own
/// reactor poller.
pub struct WorkerPool {
    inner: PollerPool,
}

impl WorkerPool {
    /// The process-wide worker pool, lazily created on first access.
    pub fn global() -> &'static WorkerPool {
        static POOL: OnceLock<WorkerPool> = OnceLock::new();
        POOL.get_or_init(|| {
            let config = PollerPoolConfig::new().priority(SchedPriority::Low);
            WorkerPool {
                inner: PollerPool::build(config, false)
                    .expect("failed to construct the global worker pool"),
            }
        })
    }

    /// The least-loaded worker poller.
    pub fn get_poller(&self) -> Arc<Poller> {
        self.inner.least_loaded()
    }

    /// Number of pollers in the worker pool.
    pub fn size(&self) -> usize {
        self.inner.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_get_before_try_init_reports_not_initialized() {
        // GLOBAL_POLLER_POOL is process-wide; this test only asserts the
        // error variant exists and is reachable, not the pre-init state,
        // since other tests in this binary may have already touched it.
        match PollerPool::try_get() {
            Ok(_) => {}
            Err(LatticeError::PoolNotInitialized) => {}
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }

    #[test]
    fn try_init_then_try_init_again_reports_already_initialized() {
        let first = PollerPool::try_init(PollerPoolConfig::new().pool_size(1));
        match first {
            Ok(_) => {
                let second = PollerPool::try_init(PollerPoolConfig::new().pool_size(1));
                assert!(matches!(second, Err(LatticeError::PoolAlreadyInitialized)));
                assert!(PollerPool::try_get().is_ok());
            }
            Err(LatticeError::PoolAlreadyInitialized) => {
                // Another test in this binary already initialized it first.
                assert!(PollerPool::try_get().is_ok());
            }
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }

    #[test]
    fn pool_with_explicit_size_creates_that_many_pollers() {
        let pool = PollerPool::build(PollerPoolConfig::new().pool_size(3), false).unwrap();
        assert_eq!(pool.size(), 3);
        for poller in &pool.pollers {
            poller.shutdown();
        }
    }

    #[test]
    fn get_first_poller_is_stable() {
        let pool = PollerPool::build(PollerPoolConfig::new().pool_size(2), false).unwrap();
        let a = pool.get_first_poller();
        let b = pool.get_first_poller();
        assert!(Arc::ptr_eq(&a, &b));
        for poller in &pool.pollers {
            poller.shutdown();
        }
    }

    #[test]
    fn least_loaded_scan_does_not_panic_on_single_poller() {
        let pool = PollerPool::build(PollerPoolConfig::new().pool_size(1), false).unwrap();
        let _p = pool.get_poller();
        for poller in &pool.pollers {
            poller.shutdown();
        }
    }
}
