//! Logging facilities.
//!
//! This crate uses `tracing` for structured logging. Install a subscriber
//! to see output:
//!
//! ```ignore
//! tracing_subscriber::fmt::init();
//! ```

/// Span names used throughout the crate for tracing.
pub mod span_names {
    /// Poller run-loop span.
    pub const POLLER_LOOP: &str = "lattice_reactor::poller_loop";
    /// Delay-map processing span.
    pub const TIMER: &str = "lattice_reactor::timer";
    /// Thread-pool worker span.
    pub const WORKER: &str = "lattice_reactor::worker";
}

/// Target names for log filtering.
pub mod targets {
    /// Core crate target.
    pub const CORE: &str = "lattice_reactor";
    /// Poller target.
    pub const POLLER: &str = "lattice_reactor::poller";
    /// Thread-pool target.
    pub const THREADPOOL: &str = "lattice_reactor::threadpool";
    /// Reuse pool target.
    pub const REUSE_POOL: &str = "lattice_reactor::reuse_pool";
}

/// A guard that emits a tracing span for as long as it is held, for
/// bracketing the cost of a poller iteration or worker dispatch.
#[derive(Debug)]
pub struct PerfSpan {
    #[allow(dead_code)]
    span: tracing::span::EnteredSpan,
}

impl PerfSpan {
    /// Enter a new performance span named `name`, active until dropped.
    pub fn new(name: &'static str) -> Self {
        let span = tracing::info_span!(target: "lattice_reactor::perf", "perf", operation = name);
        Self {
            span: span.entered(),
        }
    }
}

/// Macros for common tracing patterns, wrapping `tracing`'s macros with a
/// consistent target.
#[macro_export]
macro_rules! lattice_trace {
    ($($arg:tt)*) => {
        tracing::trace!(target: "lattice_reactor", $($arg)*)
    };
}

#[macro_export]
macro_rules! lattice_debug {
    ($($arg:tt)*) => {
        tracing::debug!(target: "lattice_reactor", $($arg)*)
    };
}

#[macro_export]
macro_rules! lattice_info {
    ($($arg:tt)*) => {
        tracing::info!(target: "lattice_reactor", $($arg)*)
    };
}

#[macro_export]
macro_rules! lattice_warn {
    ($($arg:tt)*) => {
        tracing::warn!(target: "lattice_reactor", $($arg)*)
    };
}

#[macro_export]
macro_rules! lattice_error {
    ($($arg:tt)*) => {
        tracing::error!(target: "lattice_reactor", $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perf_span_compiles_and_drops_cleanly() {
        let _span = PerfSpan::new("test_operation");
    }
}
