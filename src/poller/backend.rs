//! Kernel multiplexer backends.
//!
//! `EpollBackend` is used on Linux; every other Unix target falls back to
//! `SelectBackend`, which rebuilds its FD sets from the registration table
//! on every iteration — the only way it picks up cross-thread
//! `add`/`modify`/`delete` calls without a second notification channel.

use std::os::fd::RawFd;

use crate::error::{LatticeError, Result};

/// Abstract readiness mask: read, write, error, and a level-triggered hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask(pub u32);

impl EventMask {
    /// Readable without blocking.
    pub const READ: Self = Self(1 << 0);
    /// Writable without blocking.
    pub const WRITE: Self = Self(1 << 1);
    /// An error or hangup condition.
    pub const ERROR: Self = Self(1 << 2);
    /// Request level-triggered delivery instead of edge-triggered.
    pub const LEVEL_TRIGGERED: Self = Self(1 << 3);

    /// Whether every bit set in `other` is also set in `self`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Bitwise union of two masks.
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for EventMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// A kernel-backed (or portable) readiness multiplexer.
///
/// All methods are called only from the poller's own loop thread; the
/// poller itself is responsible for marshalling cross-thread requests
/// through its inbox before reaching this trait.
pub trait Multiplexer: Send {
    /// Start watching `fd` for the readiness events in `mask`.
    fn register(&mut self, fd: RawFd, mask: EventMask) -> Result<()>;
    /// Change the readiness events watched for an already-registered `fd`.
    fn modify(&mut self, fd: RawFd, mask: EventMask) -> Result<()>;
    /// Stop watching `fd`. Not an error if `fd` was never registered.
    fn unregister(&mut self, fd: RawFd) -> Result<()>;
    /// Block for at most `timeout_ms` (0 = return immediately if nothing is
    /// ready, -1 = block indefinitely), appending `(fd, mask)` pairs for
    /// every descriptor that became ready.
    fn wait(&mut self, timeout_ms: i32, out: &mut Vec<(RawFd, EventMask)>) -> Result<()>;
}

#[cfg(target_os = "linux")]
mod epoll_backend {
    use super::*;
    use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
    use std::collections::HashSet;

    fn to_epoll_flags(mask: EventMask, exclusive: bool) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if mask.contains(EventMask::READ) {
            flags |= EpollFlags::EPOLLIN;
        }
        if mask.contains(EventMask::WRITE) {
            flags |= EpollFlags::EPOLLOUT;
        }
        if mask.contains(EventMask::ERROR) {
            flags |= EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP;
        }
        if !mask.contains(EventMask::LEVEL_TRIGGERED) {
            flags |= EpollFlags::EPOLLET;
        }
        if exclusive {
            flags |= EpollFlags::EPOLLEXCLUSIVE;
        }
        flags
    }

    fn from_epoll_flags(flags: EpollFlags) -> EventMask {
        let mut mask = EventMask::default();
        if flags.contains(EpollFlags::EPOLLIN) {
            mask = mask | EventMask::READ;
        }
        if flags.contains(EpollFlags::EPOLLOUT) {
            mask = mask | EventMask::WRITE;
        }
        if flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
            mask = mask | EventMask::ERROR;
        }
        mask
    }

    /// Linux `epoll`-backed multiplexer. `EPOLLEXCLUSIVE` is applied only
    /// at registration time; `modify` never sets it, matching `epoll(7)`'s
    /// own restriction that the flag is ADD-only.
    pub struct EpollBackend {
        epoll: Epoll,
        registered: HashSet<RawFd>,
    }

    impl EpollBackend {
        /// Create a fresh, empty `epoll` instance.
        pub fn new() -> Result<Self> {
            let epoll = Epoll::new(EpollCreateFlags::empty())
                .map_err(|e| LatticeError::PollerConstruction(e.to_string()))?;
            Ok(Self {
                epoll,
                registered: HashSet::new(),
            })
        }
    }

    impl Multiplexer for EpollBackend {
        fn register(&mut self, fd: RawFd, mask: EventMask) -> Result<()> {
            let flags = to_epoll_flags(mask, true);
            let event = EpollEvent::new(flags, fd as u64);
            self.epoll
                .add(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, event)
                .map_err(|e| LatticeError::PollerRegistrationFailed {
                    fd,
                    source: std::io::Error::from_raw_os_error(e as i32),
                })?;
            self.registered.insert(fd);
            Ok(())
        }

        fn modify(&mut self, fd: RawFd, mask: EventMask) -> Result<()> {
            let flags = to_epoll_flags(mask, false);
            let mut event = EpollEvent::new(flags, fd as u64);
            self.epoll
                .modify(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, &mut event)
                .map_err(|e| LatticeError::PollerRegistrationFailed {
                    fd,
                    source: std::io::Error::from_raw_os_error(e as i32),
                })
        }

        fn unregister(&mut self, fd: RawFd) -> Result<()> {
            self.registered.remove(&fd);
            // Deletion failure (fd already closed/gone) is not fatal.
            let _ = self
                .epoll
                .delete(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) });
            Ok(())
        }

        fn wait(&mut self, timeout_ms: i32, out: &mut Vec<(RawFd, EventMask)>) -> Result<()> {
            let timeout = if timeout_ms < 0 {
                EpollTimeout::NONE
            } else {
                EpollTimeout::try_from(timeout_ms).unwrap_or(EpollTimeout::NONE)
            };
            let mut events = vec![EpollEvent::empty(); 128];
            let n = self
                .epoll
                .wait(&mut events, timeout)
                .map_err(|e| LatticeError::PollerConstruction(e.to_string()))?;
            for event in &events[..n] {
                let fd = event.data() as i32;
                out.push((fd, from_epoll_flags(event.events())));
            }
            Ok(())
        }
    }
}

#[cfg(target_os = "linux")]
pub use epoll_backend::EpollBackend;

#[cfg(target_os = "linux")]
pub type DefaultBackend = EpollBackend;

mod select_backend {
    use super::*;
    use nix::sys::select::FdSet;
    use nix::sys::time::{TimeVal, TimeValLike};
    use std::collections::HashMap;

    /// Portable fallback built on `select(2)`. Rebuilds its `FdSet`s from
    /// the registration table on every call to `wait`, so cross-thread
    /// table mutations are always picked up without a separate
    /// notification path.
    pub struct SelectBackend {
        interest: HashMap<RawFd, EventMask>,
    }

    impl SelectBackend {
        /// Create a backend with an empty registration table.
        pub fn new() -> Result<Self> {
            Ok(Self {
                interest: HashMap::new(),
            })
        }
    }

    impl Multiplexer for SelectBackend {
        fn register(&mut self, fd: RawFd, mask: EventMask) -> Result<()> {
            self.interest.insert(fd, mask);
            Ok(())
        }

        fn modify(&mut self, fd: RawFd, mask: EventMask) -> Result<()> {
            self.interest.insert(fd, mask);
            Ok(())
        }

        fn unregister(&mut self, fd: RawFd) -> Result<()> {
            self.interest.remove(&fd);
            Ok(())
        }

        fn wait(&mut self, timeout_ms: i32, out: &mut Vec<(RawFd, EventMask)>) -> Result<()> {
            let mut read_set = FdSet::new();
            let mut write_set = FdSet::new();
            let mut error_set = FdSet::new();
            let mut max_fd = -1;

            for (&fd, &mask) in &self.interest {
                if mask.contains(EventMask::READ) {
                    read_set.insert(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) });
                }
                if mask.contains(EventMask::WRITE) {
                    write_set.insert(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) });
                }
                error_set.insert(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) });
                max_fd = max_fd.max(fd);
            }

            if max_fd < 0 {
                // Nothing registered; still honor the timeout so the
                // caller's delay-map deadlines are respected.
                if timeout_ms > 0 {
                    std::thread::sleep(std::time::Duration::from_millis(timeout_ms as u64));
                }
                return Ok(());
            }

            let mut timeout = if timeout_ms < 0 {
                None
            } else {
                Some(TimeVal::milliseconds(timeout_ms as i64))
            };

            let n = nix::sys::select::select(
                max_fd + 1,
                Some(&mut read_set),
                Some(&mut write_set),
                Some(&mut error_set),
                timeout.as_mut(),
            )
            .map_err(|e| LatticeError::PollerConstruction(e.to_string()))?;

            if n <= 0 {
                return Ok(());
            }

            for (&fd, _) in &self.interest {
                let mut mask = EventMask::default();
                if read_set.contains(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }) {
                    mask = mask | EventMask::READ;
                }
                if write_set.contains(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }) {
                    mask = mask | EventMask::WRITE;
                }
                if error_set.contains(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }) {
                    mask = mask | EventMask::ERROR;
                }
                if mask.0 != 0 {
                    out.push((fd, mask));
                }
            }
            Ok(())
        }
    }
}

pub use select_backend::SelectBackend;

#[cfg(not(target_os = "linux"))]
pub type DefaultBackend = SelectBackend;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_mask_union_and_contains() {
        let mask = EventMask::READ | EventMask::WRITE;
        assert!(mask.contains(EventMask::READ));
        assert!(mask.contains(EventMask::WRITE));
        assert!(!mask.contains(EventMask::ERROR));
    }
}
