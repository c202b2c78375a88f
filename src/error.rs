//! Error types for the lattice reactor core.

use thiserror::Error;

/// The unified error type for reactor, thread-pool, and reuse-pool operations.
#[derive(Debug, Error)]
pub enum LatticeError {
    /// The kernel refused a registration (`epoll_ctl`/`select` setup failed).
    #[error("kernel refused FD registration (fd={fd}): {source}")]
    PollerRegistrationFailed {
        fd: std::os::raw::c_int,
        #[source]
        source: std::io::Error,
    },

    /// The underlying multiplexer (epoll instance, select table) could not be constructed.
    #[error("failed to construct poller: {0}")]
    PollerConstruction(String),

    /// The self-pipe used to wake the poller could not be constructed.
    #[error("failed to construct wakeup pipe: {0}")]
    PipeConstruction(#[source] std::io::Error),

    /// The reuse pool's allocator closure failed.
    #[error("reuse pool allocator failed: {0}")]
    ReusePoolAllocation(String),

    /// A worker or loop thread could not be spawned.
    #[error("failed to spawn thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    /// The poller's loop has already exited; new registrations cannot be serviced.
    #[error("poller loop has already exited")]
    PollerExited,

    /// `try_init` was called on a process-wide singleton that already has a value.
    #[error("pool already initialized")]
    PoolAlreadyInitialized,

    /// `try_get` was called on a process-wide singleton before any `try_init`/`global`.
    #[error("pool not initialized")]
    PoolNotInitialized,
}

/// A specialized `Result` for reactor-core operations.
pub type Result<T> = std::result::Result<T, LatticeError>;
