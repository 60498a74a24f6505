//! Handle on a spawned child
//!
//! Owns the pid, the parent's ends of any pipes or PTY, and a cached
//! [`ProcessStatus`]. The status only moves forward: once a wait call
//! observes termination it is cached and never queried again.
//!
//! All mutating calls take `&mut self`, so a handle has exactly one writer.
//! Callers that need to share one across threads wrap it in a lock.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::alloc::{Pty, WindowSize};
use crate::error::{Error, Result};
use crate::plan::ParentEnds;
use crate::status::{decode, wait_raw, ProcessStatus};

fn set_nonblocking(fd: RawFd, nonblocking: bool) -> Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?);
    let new_flags = if nonblocking {
        flags | OFlag::O_NONBLOCK
    } else {
        flags & !OFlag::O_NONBLOCK
    };
    fcntl(fd, FcntlArg::F_SETFL(new_flags)).map_err(io::Error::from)?;
    Ok(())
}

/// Writable end of the child's stdin
#[derive(Debug)]
pub struct ChildStdin {
    inner: File,
}

/// Readable end of the child's stdout
#[derive(Debug)]
pub struct ChildStdout {
    inner: File,
}

/// Readable end of the child's stderr
#[derive(Debug)]
pub struct ChildStderr {
    inner: File,
}

impl Write for ChildStdin {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Read for ChildStdout {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Read for ChildStderr {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

macro_rules! stream_common {
    ($($ty:ident),*) => {$(
        impl $ty {
            /// Set non-blocking mode on the underlying descriptor
            pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
                set_nonblocking(self.inner.as_raw_fd(), nonblocking)
            }

            /// Give up the wrapper and keep the file
            pub fn into_inner(self) -> File {
                self.inner
            }
        }

        impl AsRawFd for $ty {
            fn as_raw_fd(&self) -> RawFd {
                self.inner.as_raw_fd()
            }
        }

        impl AsFd for $ty {
            fn as_fd(&self) -> BorrowedFd<'_> {
                self.inner.as_fd()
            }
        }
    )*};
}

stream_common!(ChildStdin, ChildStdout, ChildStderr);

/// A spawned child process
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Pid,
    status: ProcessStatus,
    closed: bool,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    pty: Option<Pty>,
}

impl ProcessHandle {
    pub(crate) fn new(pid: Pid, ends: ParentEnds) -> Self {
        Self {
            pid,
            status: ProcessStatus::Running,
            closed: false,
            stdin: ends.stdin.map(|inner| ChildStdin { inner }),
            stdout: ends.stdout.map(|inner| ChildStdout { inner }),
            stderr: ends.stderr.map(|inner| ChildStderr { inner }),
            pty: ends.pty,
        }
    }

    /// Get the child process ID
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Last known status, without querying the kernel
    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Check whether the child has terminated, without blocking
    ///
    /// `Running` is returned as-is and not cached; a terminal status is
    /// cached and returned from then on.
    pub fn poll_status(&mut self) -> Result<ProcessStatus> {
        if self.status.is_terminal() {
            return Ok(self.status);
        }
        match wait_raw(self.pid, true)? {
            Some(raw) => self.resolve(raw),
            None => Ok(ProcessStatus::Running),
        }
    }

    /// Block until the child terminates
    ///
    /// Returns the cached status immediately once the child has been reaped.
    pub fn wait_status(&mut self) -> Result<ProcessStatus> {
        if self.status.is_terminal() {
            return Ok(self.status);
        }
        match wait_raw(self.pid, false)? {
            Some(raw) => self.resolve(raw),
            // A blocking waitpid only returns 0 if the kernel misbehaves
            None => Err(Error::UnexpectedStatus {
                pid: self.pid,
                raw: 0,
            }),
        }
    }

    /// Check if the child process is still running
    pub fn is_running(&mut self) -> Result<bool> {
        Ok(self.poll_status()?.is_running())
    }

    /// Send a signal to the child process
    ///
    /// Once the child has been reaped its pid may belong to someone else, so
    /// this becomes a no-op.
    pub fn send_signal(&self, signal: Signal) -> Result<()> {
        if self.status.is_terminal() {
            tracing::trace!(pid = %self.pid, ?signal, "child already reaped, not signalling");
            return Ok(());
        }
        kill(self.pid, signal).map_err(|source| Error::Signal {
            pid: self.pid,
            source,
        })
    }

    /// Kill the child process
    pub fn kill(&self) -> Result<()> {
        self.send_signal(Signal::SIGKILL)
    }

    /// Release every stream and reap the child
    ///
    /// Streams are closed first so a child blocked on a full or empty pipe
    /// sees EOF/EPIPE and can exit. Without `force` this then blocks until
    /// the child terminates; with `force` it only polls. The handle counts as
    /// closed either way, and calling this again does nothing.
    pub fn close(&mut self, force: bool) -> Result<ProcessStatus> {
        if self.closed {
            return Ok(self.status);
        }

        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
        self.pty = None;

        let result = if force {
            self.poll_status()
        } else {
            self.wait_status()
        };
        self.closed = true;

        tracing::debug!(pid = %self.pid, force, status = %self.status, "closed child handle");
        result
    }

    pub fn stdin(&mut self) -> Option<&mut ChildStdin> {
        self.stdin.as_mut()
    }

    pub fn stdout(&mut self) -> Option<&mut ChildStdout> {
        self.stdout.as_mut()
    }

    pub fn stderr(&mut self) -> Option<&mut ChildStderr> {
        self.stderr.as_mut()
    }

    /// Move the stdin writer out; dropping it sends EOF to the child
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// The PTY master, when any stream was wired to one
    pub fn pty(&self) -> Option<&Pty> {
        self.pty.as_ref()
    }

    /// Set the PTY window size and send SIGWINCH to the child
    pub fn resize(&self, size: WindowSize) -> Result<()> {
        let pty = self.pty.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "child has no pty")
        })?;
        pty.set_window_size(size)?;
        self.send_signal(Signal::SIGWINCH)
    }

    fn resolve(&mut self, raw: i32) -> Result<ProcessStatus> {
        let status = decode(self.pid, raw)?;
        tracing::debug!(pid = %self.pid, %status, "child terminated");
        self.status = status;
        Ok(status)
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Best-effort reap; never block in drop
        match self.close(true) {
            Ok(ProcessStatus::Running) => {
                tracing::debug!(pid = %self.pid, "dropped handle of a running child");
            },
            Ok(_) => {},
            Err(e) => tracing::warn!(pid = %self.pid, "failed to reap child on drop: {}", e),
        }
    }
}
