//! Exclusively-owned OS pipes.
//!
//! [`ScopedPipe`] is the foundational IPC and redirection primitive for
//! the isolation engine: a connected read/write descriptor pair with
//! explicit close and "install as fd N" operations. It denotes unique
//! ownership of kernel resources, so it is movable but never copyable,
//! and whatever ends remain open are released on drop.
//!
//! Double-closing an end is an error by design, never a silent no-op:
//! repeated close surfaces descriptor-accounting bugs in the engine
//! instead of masking them.

use std::os::unix::io::RawFd;

use nix::unistd;

use crate::errors::HarnessError;

/// Sentinel for a handle that has been closed or moved away.
const ABSENT: RawFd = -1;

/// An exclusively-owned pipe. Created already connected via [`open`];
/// the "open twice" misuse of a two-phase API is unrepresentable.
///
/// [`open`]: ScopedPipe::open
#[derive(Debug)]
pub struct ScopedPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl ScopedPipe {
    /// Atomically creates a connected read/write descriptor pair.
    pub fn open() -> Result<Self, HarnessError> {
        let (read_fd, write_fd) =
            unistd::pipe().map_err(|source| HarnessError::Resource { source })?;
        Ok(Self { read_fd, write_fd })
    }

    /// The read-end descriptor, if still held.
    pub fn read_fd(&self) -> Option<RawFd> {
        (self.read_fd != ABSENT).then_some(self.read_fd)
    }

    /// The write-end descriptor, if still held.
    pub fn write_fd(&self) -> Option<RawFd> {
        (self.write_fd != ABSENT).then_some(self.write_fd)
    }

    /// Closes the read end. Errors with `InvalidHandle` if it is no
    /// longer held.
    pub fn close_read(&mut self) -> Result<(), HarnessError> {
        Self::close_end(&mut self.read_fd)
    }

    /// Closes the write end. Errors with `InvalidHandle` if it is no
    /// longer held.
    pub fn close_write(&mut self) -> Result<(), HarnessError> {
        Self::close_end(&mut self.write_fd)
    }

    /// Makes `target` refer to this pipe's read end, then closes the
    /// original handle, transferring ownership into the slot. No-op
    /// success when `target` already is the held descriptor.
    pub fn install_read(&mut self, target: RawFd) -> Result<(), HarnessError> {
        Self::install_end(&mut self.read_fd, target)
    }

    /// Makes `target` refer to this pipe's write end, then closes the
    /// original handle. Used by the isolation engine to splice the
    /// child's stdout/stderr slots onto capture pipes.
    pub fn install_write(&mut self, target: RawFd) -> Result<(), HarnessError> {
        Self::install_end(&mut self.write_fd, target)
    }

    fn close_end(fd: &mut RawFd) -> Result<(), HarnessError> {
        if *fd == ABSENT {
            return Err(HarnessError::InvalidHandle);
        }
        unistd::close(*fd).map_err(|source| HarnessError::Resource { source })?;
        *fd = ABSENT;
        Ok(())
    }

    fn install_end(fd: &mut RawFd, target: RawFd) -> Result<(), HarnessError> {
        if *fd == ABSENT {
            return Err(HarnessError::InvalidHandle);
        }
        if *fd == target {
            return Ok(());
        }
        unistd::dup2(*fd, target).map_err(|source| HarnessError::Resource { source })?;
        Self::close_end(fd)
    }
}

impl Drop for ScopedPipe {
    fn drop(&mut self) {
        // Best-effort release; a destructor must not fail the process.
        if self.read_fd != ABSENT {
            let _ = unistd::close(self.read_fd);
        }
        if self.write_fd != ABSENT {
            let _ = unistd::close(self.write_fd);
        }
    }
}
