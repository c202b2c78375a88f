//! A reactor-style event poller, a pool of such pollers, and a
//! thread-safe object reuse pool.
//!
//! This crate provides:
//!
//! - **Event poller** ([`poller`]): a single-owning-thread reactor
//!   multiplexing FD readiness, an inbox of cross-thread submitted
//!   closures, and a delay map of timed tasks against one kernel wait.
//! - **Poller pool / worker pool** ([`poller_pool`]): process-wide
//!   singletons that shard work across a fixed set of pollers by load.
//! - **Task-queue thread pool** ([`threadpool`]): a simpler FIFO/LIFO
//!   pool for blocking or CPU-bound work.
//! - **Reuse pool** ([`reuse_pool`]): a bounded free list of recyclable
//!   heap objects behind cancellation-safe smart handles.
//! - **Task handle** ([`task`]): the cancellable closure wrapper shared by
//!   the poller's inbox, delay map, and the thread pool.
//!
//! # Poller Example
//!
//! ```no_run
//! use lattice_reactor::poller::{Poller, PollerConfig};
//!
//! let poller = Poller::new(PollerConfig::new()).unwrap();
//! poller.run_loop(false).unwrap();
//!
//! poller.async_task(|| println!("ran on the loop thread"), true);
//! poller.start_delay(100, || {
//!     println!("fires once after 100ms");
//!     0
//! });
//!
//! poller.shutdown();
//! ```
//!
//! # Reuse Pool Example
//!
//! ```
//! use lattice_reactor::reuse_pool::ReusePool;
//!
//! let pool = ReusePool::new(|| Ok(Box::new(Vec::<u8>::with_capacity(4096))));
//! {
//!     let mut handle = pool.obtain().unwrap();
//!     handle.push(1);
//! } // recycled back into the free list here
//! assert_eq!(pool.len(), 1);
//! ```

#![warn(missing_docs)]
#![allow(clippy::type_complexity)]

pub mod error;
pub mod load;
pub mod logging;
pub mod pipe;
pub mod poller;
pub mod poller_pool;
pub mod reuse_pool;
pub mod semaphore;
pub mod stats;
pub mod task;
pub mod thread_check;
pub mod thread_group;
pub mod threadpool;
pub mod timestamp;

pub use error::{LatticeError, Result};
pub use poller::{EventMask, Poller, PollerConfig};
pub use poller_pool::{PollerPool, PollerPoolConfig, WorkerPool};
pub use reuse_pool::{PoolHandle, ReusePool, ReusePoolConfig};
pub use task::Operation;
pub use thread_check::{
    are_thread_checks_enabled, is_main_thread, main_thread_id, set_thread_checks_enabled,
    ThreadAffinity,
};
pub use threadpool::{SchedPriority, ThreadPool, ThreadPoolConfig};
