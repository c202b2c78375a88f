//! The reactor: one event poller per loop thread, multiplexing FD
//! readiness, an inbox of submitted closures, and a delay map of timed
//! tasks against a single kernel wait.
//!
//! Every field that the run loop touches directly (`events`, `delay_map`,
//! the backend) is only ever mutated from the loop thread; the `Mutex`
//! wrappers around them exist to satisfy `Send`/`Sync` for an `Arc<Poller>`
//! shared across threads; they are never contended in practice because
//! cross-thread requests are always marshalled through the `inbox`.

pub mod backend;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{LatticeError, Result};
use crate::load::LoadMeter;
use crate::pipe::Pipe;
use crate::poller_pool::{register_current_poller, unregister_current_poller};
use crate::semaphore::Semaphore;
use crate::task::Operation;
use crate::threadpool::{set_thread_priority, SchedPriority};
use crate::timestamp::monotonic_millis;

pub use backend::{EventMask, Multiplexer};

/// Callback invoked with the delivered event bitmask.
pub type EventCallback = Box<dyn FnMut(EventMask) + Send>;
/// Callback invoked once, with whether `delete_event` found and removed the FD.
pub type DeleteCallback = Box<dyn FnOnce(bool) + Send>;

const DEFAULT_SHARED_BUFFER_CAPACITY: usize = 1 + 64 * 1024;
const DEFAULT_MAX_LOAD_SAMPLES: usize = 64;
const DEFAULT_MAX_LOAD_WINDOW: Duration = Duration::from_secs(2);

/// Configuration for a [`Poller`].
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// OS scheduling priority hint applied to the loop thread.
    pub priority: SchedPriority,
    /// Whether the loop thread registers itself in the process-wide
    /// thread-id → poller map (see [`crate::poller_pool::current_poller`]).
    pub register_self: bool,
    /// Maximum number of sleep/run samples retained by the load meter.
    pub max_load_samples: usize,
    /// Maximum elapsed-time span retained by the load meter.
    pub max_load_window: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            priority: SchedPriority::Highest,
            register_self: true,
            max_load_samples: DEFAULT_MAX_LOAD_SAMPLES,
            max_load_window: DEFAULT_MAX_LOAD_WINDOW,
        }
    }
}

impl PollerConfig {
    /// Start from the default config (highest priority, self-registering).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the OS scheduling priority hint.
    pub fn priority(mut self, p: SchedPriority) -> Self {
        self.priority = p;
        self
    }

    /// Set whether the loop thread registers itself as `current_poller()`.
    pub fn register_self(mut self, flag: bool) -> Self {
        self.register_self = flag;
        self
    }

    /// Set the load meter's retained sample count.
    pub fn max_load_samples(mut self, samples: usize) -> Self {
        self.max_load_samples = samples;
        self
    }

    /// Set the load meter's retained time window.
    pub fn max_load_window(mut self, window: Duration) -> Self {
        self.max_load_window = window;
        self
    }
}

enum InboxEntry {
    Task(Operation<()>),
    Shutdown,
}

/// The reactor. One loop thread owns the event map, the delay map, and
/// the multiplexer; every other thread talks to it through `inbox`.
pub struct Poller {
    exit_flag: AtomicBool,
    loop_thread_id: Mutex<Option<ThreadId>>,
    config: PollerConfig,
    started: Semaphore,
    pipe: Pipe,
    inbox: Mutex<VecDeque<InboxEntry>>,
    events: Mutex<HashMap<RawFd, EventCallback>>,
    delay_map: Mutex<BTreeMap<u64, Vec<Operation<u64>>>>,
    backend: Mutex<backend::DefaultBackend>,
    shared_buffer: Mutex<Option<Vec<u8>>>,
    load: LoadMeter,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Poller {
    /// Construct a poller. The caller still owns scheduling it a loop
    /// thread via [`Poller::run_loop`].
    pub fn new(config: PollerConfig) -> Result<Arc<Self>> {
        let pipe = Pipe::new()?;
        let backend = backend::DefaultBackend::new()?;

        let poller = Arc::new(Self {
            exit_flag: AtomicBool::new(false),
            loop_thread_id: Mutex::new(None),
            started: Semaphore::new(),
            pipe,
            inbox: Mutex::new(VecDeque::new()),
            events: Mutex::new(HashMap::new()),
            delay_map: Mutex::new(BTreeMap::new()),
            backend: Mutex::new(backend),
            shared_buffer: Mutex::new(None),
            load: LoadMeter::new(config.max_load_samples, config.max_load_window),
            thread_handle: Mutex::new(None),
            config,
        });

        let read_fd = poller.pipe.read_fd();
        let pipe_poller = Arc::clone(&poller);
        poller
            .backend
            .lock()
            .register(read_fd, EventMask::READ | EventMask::LEVEL_TRIGGERED)
            .map_err(|_| LatticeError::PollerConstruction("failed to register wakeup pipe".into()))?;
        poller.events.lock().insert(
            read_fd,
            Box::new(move |_mask| pipe_poller.on_pipe_event()),
        );

        Ok(poller)
    }

    /// Register `fd` for `mask` events. Inline on the loop thread,
    /// otherwise marshalled through the inbox.
    pub fn add_event(self: &Arc<Self>, fd: RawFd, mask: EventMask, callback: EventCallback) -> Result<()> {
        if self.exit_flag.load(Ordering::SeqCst) {
            return Err(LatticeError::PollerExited);
        }
        if self.is_current_thread() {
            self.backend.lock().register(fd, mask)?;
            self.events.lock().insert(fd, callback);
            return Ok(());
        }
        let me = Arc::clone(self);
        let callback = std::sync::Mutex::new(Some(callback));
        self.async_task(
            move || {
                if let Some(cb) = callback.lock().unwrap().take() {
                    let _ = me.add_event(fd, mask, cb);
                }
            },
            false,
        );
        Ok(())
    }

    /// Change the interest bits for an already-registered `fd`. Never
    /// touches `EPOLLEXCLUSIVE` — that flag is ADD-only per `epoll(7)` and
    /// is only ever applied inside `add_event`.
    pub fn modify_event(self: &Arc<Self>, fd: RawFd, mask: EventMask) -> Result<()> {
        if self.exit_flag.load(Ordering::SeqCst) {
            return Err(LatticeError::PollerExited);
        }
        if self.is_current_thread() {
            return self.backend.lock().modify(fd, mask);
        }
        let me = Arc::clone(self);
        self.async_task(move || { let _ = me.modify_event(fd, mask); }, false);
        Ok(())
    }

    /// Unregister `fd`. `callback` is invoked on the loop thread with
    /// whether the FD was actually found and removed.
    pub fn delete_event(self: &Arc<Self>, fd: RawFd, callback: Option<DeleteCallback>) {
        if self.is_current_thread() {
            let found = self.events.lock().remove(&fd).is_some();
            let _ = self.backend.lock().unregister(fd);
            if let Some(cb) = callback {
                cb(found);
            }
            return;
        }
        let me = Arc::clone(self);
        let callback = std::sync::Mutex::new(Some(callback));
        self.async_task(
            move || me.delete_event(fd, callback.lock().unwrap().take().flatten()),
            false,
        );
    }

    /// True if the calling thread is this poller's loop thread.
    pub fn is_current_thread(&self) -> bool {
        Some(thread::current().id()) == *self.loop_thread_id.lock()
    }

    /// Enqueue `f` at the inbox tail. If `may_sync` and the caller is
    /// already the loop thread, runs inline instead.
    pub fn async_task<F>(self: &Arc<Self>, f: F, may_sync: bool) -> Option<Operation<()>>
    where
        F: FnMut() + Send + 'static,
    {
        self.async_l(f, may_sync, false)
    }

    /// Enqueue `f` at the inbox head, ahead of any pending `async_task`
    /// submissions.
    pub fn async_first<F>(self: &Arc<Self>, f: F, may_sync: bool) -> Option<Operation<()>>
    where
        F: FnMut() + Send + 'static,
    {
        self.async_l(f, may_sync, true)
    }

    fn async_l<F>(self: &Arc<Self>, f: F, may_sync: bool, first: bool) -> Option<Operation<()>>
    where
        F: FnMut() + Send + 'static,
    {
        if may_sync && self.is_current_thread() {
            let mut f = f;
            f();
            return None;
        }
        let op = Operation::new(f);
        {
            let mut inbox = self.inbox.lock();
            if first {
                inbox.push_front(InboxEntry::Task(op.clone()));
            } else {
                inbox.push_back(InboxEntry::Task(op.clone()));
            }
        }
        let _ = self.pipe.wake();
        Some(op)
    }

    /// Submit `f` and block until it has run, even if it panics — a
    /// drop-guard posts the release semaphore regardless of outcome.
    pub fn sync<F>(self: &Arc<Self>, f: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.sync_l(f, false)
    }

    /// Like [`Poller::sync`] but enqueues at the inbox head.
    pub fn sync_first<F>(self: &Arc<Self>, f: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.sync_l(f, true)
    }

    fn sync_l<F>(self: &Arc<Self>, mut f: F, first: bool)
    where
        F: FnMut() + Send + 'static,
    {
        if self.is_current_thread() {
            f();
            return;
        }
        let sem = Arc::new(Semaphore::new());
        let release = Arc::clone(&sem);
        let wrapped = move || {
            struct ReleaseGuard(Arc<Semaphore>);
            impl Drop for ReleaseGuard {
                fn drop(&mut self) {
                    self.0.post(1);
                }
            }
            let _guard = ReleaseGuard(Arc::clone(&release));
            f();
        };
        if first {
            self.async_first(wrapped, false);
        } else {
            self.async_task(wrapped, false);
        }
        sem.wait();
    }

    /// Schedule `op` to first run `delay_ms` from now. `op` returns the
    /// number of milliseconds until its next run, or 0 to stop.
    pub fn start_delay<F>(self: &Arc<Self>, delay_ms: u64, op: F) -> Operation<u64>
    where
        F: FnMut() -> u64 + Send + 'static,
    {
        let handle = Operation::new(op);
        let deadline = monotonic_millis() + delay_ms;
        let me = Arc::clone(self);
        let scheduled = handle.clone();
        self.async_first(
            move || {
                me.delay_map.lock().entry(deadline).or_default().push(scheduled.clone());
            },
            false,
        );
        handle
    }

    /// Lazily allocate (once) and return a per-poller scratch buffer,
    /// reused across callbacks. Must be called from the loop thread.
    pub fn shared_buffer(&self) -> &Mutex<Option<Vec<u8>>> {
        let mut guard = self.shared_buffer.lock();
        if guard.is_none() {
            *guard = Some(Vec::with_capacity(DEFAULT_SHARED_BUFFER_CAPACITY));
        }
        drop(guard);
        &self.shared_buffer
    }

    /// Current integer load percent, consulted by the poller pool's
    /// least-loaded selection.
    pub fn load(&self) -> u32 {
        self.load.load()
    }

    fn on_pipe_event(&self) {
        self.pipe.drain();
        let swapped: VecDeque<InboxEntry> = {
            let mut inbox = self.inbox.lock();
            std::mem::take(&mut *inbox)
        };
        for entry in swapped {
            match entry {
                InboxEntry::Task(op) => {
                    op.call();
                }
                InboxEntry::Shutdown => {
                    self.exit_flag.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    /// Destructive flush-then-merge of every due delay-map entry; returns
    /// the number of milliseconds until the next remaining deadline, or 0
    /// if none remain.
    fn flush_delay_operations(&self, now: u64) -> u64 {
        let due: BTreeMap<u64, Vec<Operation<u64>>> = {
            let mut map = self.delay_map.lock();
            let remaining = map.split_off(&(now + 1));
            std::mem::replace(&mut *map, remaining)
        };

        let mut rearmed: Vec<(u64, Operation<u64>)> = Vec::new();
        for (_, ops) in due {
            for op in ops {
                let interval = op.call();
                if interval > 0 {
                    rearmed.push((now + interval, op));
                }
            }
        }

        let mut map = self.delay_map.lock();
        for (deadline, op) in rearmed {
            map.entry(deadline).or_default().push(op);
        }
        match map.keys().next() {
            Some(&deadline) => deadline.saturating_sub(now),
            None => 0,
        }
    }

    fn get_min_delay(&self) -> u64 {
        let now = monotonic_millis();
        let earliest = self.delay_map.lock().keys().next().copied();
        match earliest {
            None => 0,
            Some(deadline) if deadline > now => deadline - now,
            Some(_) => self.flush_delay_operations(now),
        }
    }

    /// Start this poller's run loop. When `blocked` is false, spawns a
    /// new thread running the loop and blocks the caller until that
    /// thread has signalled readiness; when `blocked` is true, runs the
    /// loop on the calling thread directly (used by the spawned thread
    /// itself, and by callers that want to dedicate their own thread).
    pub fn run_loop(self: &Arc<Self>, blocked: bool) -> Result<()> {
        if !blocked {
            let me = Arc::clone(self);
            let handle = thread::Builder::new()
                .name("lattice-poller".to_string())
                .spawn(move || {
                    let _ = me.run_loop(true);
                })
                .map_err(LatticeError::ThreadSpawn)?;
            *self.thread_handle.lock() = Some(handle);
            self.started.wait();
            return Ok(());
        }

        set_thread_priority(self.config.priority);
        *self.loop_thread_id.lock() = Some(thread::current().id());
        if self.config.register_self {
            register_current_poller(self);
        }
        self.started.post(1);
        self.exit_flag.store(false, Ordering::SeqCst);

        let mut ready = Vec::new();
        while !self.exit_flag.load(Ordering::SeqCst) {
            let min_delay = self.get_min_delay();
            self.load.start_sleep();
            ready.clear();
            let timeout_ms = if min_delay == 0 { -1 } else { min_delay.min(i32::MAX as u64) as i32 };
            let wait_result = self.backend.lock().wait(timeout_ms, &mut ready);
            self.load.wake_up();

            let Ok(()) = wait_result else { continue };

            for &(fd, mask) in &ready {
                // Take the callback out of `events` before invoking it: the
                // callback runs arbitrary code (including, for the pipe's
                // own entry, draining the inbox and running marshalled
                // add_event/delete_event calls inline on this same thread),
                // which would re-lock `events` and deadlock on a
                // non-reentrant mutex if the lock were still held here.
                let Some(mut cb) = self.events.lock().remove(&fd) else {
                    let _ = self.backend.lock().unregister(fd);
                    continue;
                };
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(mask)));
                if let Err(payload) = result {
                    let message = panic_message(&payload);
                    tracing::warn!(target: "lattice_reactor::poller", fd, %message, "FD callback panicked, suppressed");
                }
                self.events.lock().entry(fd).or_insert(cb);
            }
        }

        if self.config.register_self {
            unregister_current_poller();
        }
        Ok(())
    }

    /// Idempotent shutdown request: posts a sentinel inbox entry that
    /// sets the exit flag once drained, then joins the loop thread if one
    /// was spawned via `run_loop(false)`.
    pub fn shutdown(self: &Arc<Self>) {
        if self.is_current_thread() {
            self.exit_flag.store(true, Ordering::SeqCst);
        } else {
            self.inbox.lock().push_back(InboxEntry::Shutdown);
            let _ = self.pipe.wake();
        }
        if let Some(handle) = self.thread_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

static_assertions::assert_impl_all!(Poller: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration as StdDuration;

    #[test]
    fn async_task_runs_on_loop_thread() {
        let poller = Poller::new(PollerConfig::new().register_self(false)).unwrap();
        poller.run_loop(false).unwrap();
        let (tx, rx) = mpsc::channel();
        let loop_id = Arc::clone(&poller);
        poller.async_task(
            move || tx.send(loop_id.is_current_thread()).unwrap(),
            true,
        );
        assert!(rx.recv_timeout(StdDuration::from_secs(1)).unwrap());
        poller.shutdown();
    }

    #[test]
    fn async_submission_order_is_preserved() {
        let poller = Poller::new(PollerConfig::new().register_self(false)).unwrap();
        poller.run_loop(false).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();
        for i in 0..20 {
            let order = Arc::clone(&order);
            let tx = tx.clone();
            poller.async_task(
                move || {
                    order.lock().push(i);
                    if i == 19 {
                        tx.send(()).unwrap();
                    }
                },
                false,
            );
        }
        rx.recv_timeout(StdDuration::from_secs(1)).unwrap();
        assert_eq!(*order.lock(), (0..20).collect::<Vec<_>>());
        poller.shutdown();
    }

    #[test]
    fn sync_blocks_until_task_runs() {
        let poller = Poller::new(PollerConfig::new().register_self(false)).unwrap();
        poller.run_loop(false).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        poller.sync(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        poller.shutdown();
    }

    #[test]
    fn start_delay_dispatches_after_deadline() {
        let poller = Poller::new(PollerConfig::new().register_self(false)).unwrap();
        poller.run_loop(false).unwrap();
        let (tx, rx) = mpsc::channel();
        let start = std::time::Instant::now();
        poller.start_delay(20, move || {
            tx.send(start.elapsed()).unwrap();
            0
        });
        let elapsed = rx.recv_timeout(StdDuration::from_secs(1)).unwrap();
        assert!(elapsed >= StdDuration::from_millis(20));
        poller.shutdown();
    }

    #[test]
    fn cancelled_delay_never_dispatches() {
        let poller = Poller::new(PollerConfig::new().register_self(false)).unwrap();
        poller.run_loop(false).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let handle = poller.start_delay(50, move || {
            r.fetch_add(1, Ordering::SeqCst);
            0
        });
        std::thread::sleep(StdDuration::from_millis(10));
        handle.cancel();
        std::thread::sleep(StdDuration::from_millis(80));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        poller.shutdown();
    }

    #[test]
    fn pipe_readiness_invokes_registered_callback() {
        let poller = Poller::new(PollerConfig::new().register_self(false)).unwrap();
        poller.run_loop(false).unwrap();
        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        let (tx, rx) = mpsc::channel();
        poller
            .add_event(
                std::os::fd::AsRawFd::as_raw_fd(&read_fd),
                EventMask::READ | EventMask::LEVEL_TRIGGERED,
                Box::new(move |mask| {
                    tx.send(mask.contains(EventMask::READ)).unwrap();
                }),
            )
            .unwrap();
        nix::unistd::write(&write_fd, &[1u8]).unwrap();
        assert!(rx.recv_timeout(StdDuration::from_secs(1)).unwrap());
        poller.shutdown();
    }
}
