//! Self-pipe wake-up: a non-blocking mechanism to interrupt a poller blocked
//! in its multiplexer wait. Payload bytes are meaningless — the write is
//! purely to make the read end readable.

use std::os::fd::{AsRawFd, RawFd};

use crate::error::{LatticeError, Result};

/// A pipe whose read end is non-blocking and registered with a poller's
/// multiplexer; writes from any thread wake that poller out of its wait.
pub struct Pipe {
    read_fd: std::os::fd::OwnedFd,
    write_fd: std::os::fd::OwnedFd,
}

impl Pipe {
    /// Create a new pipe. The read end is set non-blocking; both ends are
    /// close-on-exec.
    pub fn new() -> Result<Self> {
        use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
        use nix::unistd::pipe;

        let (read_fd, write_fd) = pipe().map_err(|e| {
            LatticeError::PipeConstruction(std::io::Error::from_raw_os_error(e as i32))
        })?;

        for fd in [&read_fd, &write_fd] {
            let fd_flags = fcntl(fd, FcntlArg::F_GETFD).map_err(|e| {
                LatticeError::PipeConstruction(std::io::Error::from_raw_os_error(e as i32))
            })?;
            let fd_flags = FdFlag::from_bits_truncate(fd_flags) | FdFlag::FD_CLOEXEC;
            fcntl(fd, FcntlArg::F_SETFD(fd_flags)).map_err(|e| {
                LatticeError::PipeConstruction(std::io::Error::from_raw_os_error(e as i32))
            })?;
        }

        let flags = fcntl(&read_fd, FcntlArg::F_GETFL)
            .map_err(|e| LatticeError::PipeConstruction(std::io::Error::from_raw_os_error(e as i32)))?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(&read_fd, FcntlArg::F_SETFL(flags))
            .map_err(|e| LatticeError::PipeConstruction(std::io::Error::from_raw_os_error(e as i32)))?;

        Ok(Self { read_fd, write_fd })
    }

    /// Raw fd of the read end, for registration with a multiplexer.
    pub fn read_fd(&self) -> RawFd {
        self.read_fd.as_raw_fd()
    }

    /// Write one wakeup byte, retrying through `EINTR`.
    pub fn wake(&self) -> Result<()> {
        use nix::errno::Errno;
        use nix::unistd::write;

        loop {
            match write(&self.write_fd, &[0u8]) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Ok(()), // pipe buffer saturated; already pending wakeup
                Err(e) => {
                    return Err(LatticeError::PipeConstruction(std::io::Error::from_raw_os_error(e as i32)))
                }
            }
        }
    }

    /// Drain every pending byte from the read end, retrying through
    /// `EINTR` and stopping at `EAGAIN` (no more data).
    pub fn drain(&self) {
        use nix::errno::Errno;
        use nix::unistd::read;

        let mut buf = [0u8; 256];
        loop {
            match read(self.read_fd.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => break,
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_then_drain_roundtrips() {
        let pipe = Pipe::new().unwrap();
        pipe.wake().unwrap();
        pipe.wake().unwrap();
        pipe.drain();
    }

    #[test]
    fn drain_on_empty_pipe_does_not_block() {
        let pipe = Pipe::new().unwrap();
        pipe.drain();
    }
}
