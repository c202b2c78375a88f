//! Task-queue thread pool: FIFO/LIFO submission with a priority hint,
//! bounded-wait workers gated by a semaphore, and a same-thread fast path
//! for submissions made from inside the pool itself.
//!
//! This is deliberately not a work-stealing pool. Tasks are dispatched
//! strictly off one shared queue; the priority hint only affects the OS
//! scheduling priority each worker thread runs at, not task ordering.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{LatticeError, Result};
use crate::semaphore::Semaphore;
use crate::task::Operation;
use crate::thread_group::ThreadGroup;

/// Scheduling priority hint, mapped onto one of five interpolated OS
/// priority levels for the platform's default scheduling class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SchedPriority {
    Lowest = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    Highest = 4,
}

impl Default for SchedPriority {
    fn default() -> Self {
        Self::Highest
    }
}

/// Best-effort application of `priority` to the calling thread via
/// `pthread_setschedparam`, interpolating between the platform's minimum
/// and maximum priority for `SCHED_OTHER`. Returns `false` if the
/// platform refuses (never fatal — priority is purely a hint).
#[cfg(unix)]
pub fn set_thread_priority(priority: SchedPriority) -> bool {
    // SAFETY: sched_get_priority_{min,max} take a fixed, valid policy
    // constant and return a plain integer; pthread_setschedparam is given
    // a sched_param built entirely from that integer range and the
    // current thread's own handle.
    unsafe {
        let min = libc::sched_get_priority_min(libc::SCHED_OTHER);
        let max = libc::sched_get_priority_max(libc::SCHED_OTHER);
        if min == -1 || max == -1 {
            return false;
        }
        let levels = [
            min,
            min + (max - min) / 4,
            min + (max - min) / 2,
            min + (max - min) * 3 / 4,
            max,
        ];
        let mut params: libc::sched_param = std::mem::zeroed();
        params.sched_priority = levels[priority as usize];
        libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_OTHER, &params) == 0
    }
}

#[cfg(not(unix))]
pub fn set_thread_priority(_priority: SchedPriority) -> bool {
    false
}

/// Configuration for a [`ThreadPool`].
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Number of worker threads to spawn.
    pub num_threads: usize,
    /// OS scheduling priority hint applied to every worker thread.
    pub priority: SchedPriority,
    /// Whether `ThreadPool::new` should start the workers immediately.
    pub auto_run: bool,
    /// Name prefix for spawned worker threads.
    pub thread_name: String,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            num_threads: 1,
            priority: SchedPriority::Highest,
            auto_run: true,
            thread_name: "lattice-pool".to_string(),
        }
    }
}

impl ThreadPoolConfig {
    /// Start from the default config (1 thread, highest priority, auto-run).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    pub fn num_threads(mut self, n: usize) -> Self {
        self.num_threads = n;
        self
    }

    /// Set the OS scheduling priority hint.
    pub fn priority(mut self, p: SchedPriority) -> Self {
        self.priority = p;
        self
    }

    /// Set whether workers start immediately on construction.
    pub fn auto_run(mut self, run: bool) -> Self {
        self.auto_run = run;
        self
    }

    /// Set the worker thread name prefix.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

struct TaskQueue {
    queue: Mutex<VecDeque<Operation<()>>>,
    sem: Semaphore,
}

impl TaskQueue {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            sem: Semaphore::new(),
        }
    }

    fn push_back(&self, op: Operation<()>) {
        self.queue.lock().push_back(op);
        self.sem.post(1);
    }

    fn push_front(&self, op: Operation<()>) {
        self.queue.lock().push_front(op);
        self.sem.post(1);
    }

    /// Posts `n` tokens with no matching queue entries, so `n` blocked
    /// `get_operation` calls each wake up and observe "no task".
    fn push_exit(&self, n: usize) {
        self.sem.post(n);
    }

    /// Blocks until a token is available, then pops the front entry.
    /// Returns `None` if the token corresponds to a shutdown signal rather
    /// than a real task (the queue was empty when the token was posted).
    fn get_operation(&self) -> Option<Operation<()>> {
        self.sem.wait();
        self.queue.lock().pop_front()
    }

    /// Non-blocking variant of [`Self::get_operation`], for draining a pool
    /// that was never started (`auto_run(false)`, zero worker threads).
    fn get_operation_nonblocking(&self) -> Option<Operation<()>> {
        if !self.sem.try_wait() {
            return None;
        }
        self.queue.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

/// A FIFO/LIFO task-queue thread pool with a priority hint and a
/// same-thread fast path for submissions made from inside the pool.
pub struct ThreadPool {
    queue: Arc<TaskQueue>,
    threads: Arc<ThreadGroup>,
    num_threads: usize,
    priority: SchedPriority,
}

impl ThreadPool {
    /// Construct and, unless `config.auto_run` is false, start the pool.
    pub fn new(config: ThreadPoolConfig) -> Result<Self> {
        let pool = Self {
            queue: Arc::new(TaskQueue::new()),
            threads: Arc::new(ThreadGroup::new()),
            num_threads: config.num_threads,
            priority: config.priority,
        };
        if config.auto_run {
            pool.start(&config.thread_name)?;
        }
        Ok(pool)
    }

    /// Spawn `num_threads` workers, each pulling from the shared queue.
    pub fn start(&self, thread_name: &str) -> Result<()> {
        for i in 0..self.num_threads {
            let queue = Arc::clone(&self.queue);
            let priority = self.priority;
            let name = format!("{thread_name}-{i}");
            self.threads
                .create_thread(name, move || worker_loop(queue, priority))
                .map_err(LatticeError::ThreadSpawn)?;
        }
        Ok(())
    }

    /// Enqueue at the tail. Runs inline (bypassing the queue) if the
    /// caller already belongs to this pool and `may_sync` is true.
    pub fn spawn<F>(&self, f: F, may_sync: bool) -> Option<Operation<()>>
    where
        F: FnMut() + Send + 'static,
    {
        if may_sync && self.threads.is_this_thread_in() {
            let mut f = f;
            f();
            return None;
        }
        let op = Operation::new(f);
        self.queue.push_back(op.clone());
        Some(op)
    }

    /// Enqueue at the head, ahead of any already-pending tasks.
    pub fn spawn_first<F>(&self, f: F, may_sync: bool) -> Option<Operation<()>>
    where
        F: FnMut() + Send + 'static,
    {
        if may_sync && self.threads.is_this_thread_in() {
            let mut f = f;
            f();
            return None;
        }
        let op = Operation::new(f);
        self.queue.push_front(op.clone());
        Some(op)
    }

    /// Number of tasks currently queued (not counting in-flight work).
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Post one no-op shutdown token per worker thread. Idempotent only
    /// in the sense that calling it more than once over-posts tokens;
    /// callers should call this exactly once before `join`.
    pub fn shutdown(&self) {
        self.queue.push_exit(self.num_threads);
    }

    /// Join every worker thread. Must not be called from a worker thread
    /// of this pool.
    pub fn join(&self) {
        self.threads.join_all();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
        self.join();
    }
}

fn worker_loop(queue: Arc<TaskQueue>, priority: SchedPriority) {
    if !set_thread_priority(priority) {
        tracing::debug!(
            target: "lattice_reactor::threadpool",
            ?priority,
            "failed to apply thread priority (best-effort, ignored)"
        );
    }
    loop {
        let Some(op) = queue.get_operation() else {
            break;
        };
        op.call();
    }
}

static_assertions::assert_impl_all!(ThreadPool: Send, Sync);

static NEXT_TASK_ID: AtomicUsize = AtomicUsize::new(0);

/// Allocate a process-unique task identifier, for callers that want to
/// correlate submissions with completions out of band.
pub fn next_task_id() -> usize {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn spawn_runs_task_off_pool_thread() {
        let pool = ThreadPool::new(ThreadPoolConfig::new().num_threads(2)).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.spawn(move || tx.send(()).unwrap(), true);
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn fifo_ordering_is_preserved() {
        let pool = ThreadPool::new(ThreadPoolConfig::new().num_threads(1)).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let order = Arc::clone(&order);
            pool.spawn(move || order.lock().push(i), true);
        }
        pool.shutdown();
        pool.join();
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn spawn_first_runs_ahead_of_pending_async() {
        let pool = ThreadPool::new(ThreadPoolConfig::new().num_threads(0).auto_run(false)).unwrap();
        // With zero running workers, queue up tasks, then drain manually.
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        pool.spawn(move || o1.lock().push("async"), false);
        let o2 = Arc::clone(&order);
        pool.spawn_first(move || o2.lock().push("first"), false);
        // Drain synchronously from the test thread.
        while let Some(op) = pool.queue.get_operation_nonblocking() {
            op.call();
        }
        assert_eq!(*order.lock(), vec!["first", "async"]);
    }

    #[test]
    fn cancelled_task_never_executes() {
        let pool = ThreadPool::new(ThreadPoolConfig::new().num_threads(1)).unwrap();
        let ran = Arc::new(StdAtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let op = pool.spawn(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }, false).unwrap();
        op.cancel();
        pool.shutdown();
        pool.join();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn same_thread_fast_path_executes_inline() {
        let pool = Arc::new(ThreadPool::new(ThreadPoolConfig::new().num_threads(1)).unwrap());
        let (tx, rx) = mpsc::channel();
        let inner_pool = Arc::clone(&pool);
        pool.spawn(move || {
            let pending_before = inner_pool.pending();
            let result = inner_pool.spawn(|| (), true);
            tx.send((pending_before, result.is_none())).unwrap();
        }, true);
        let (pending_before, ran_inline) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(pending_before, 0);
        assert!(ran_inline);
    }

    #[test]
    fn shutdown_then_join_terminates_all_workers() {
        let pool = ThreadPool::new(ThreadPoolConfig::new().num_threads(4)).unwrap();
        pool.shutdown();
        pool.join();
        assert_eq!(pool.threads.size(), 0);
    }
}
