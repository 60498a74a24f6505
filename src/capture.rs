//! Run a program to completion and collect its output

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::AsFd;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use serde::Serialize;

use crate::command::SpawnRequest;
use crate::error::Result;
use crate::handle::ProcessHandle;
use crate::status::ProcessStatus;
use crate::stream::StreamRedirection;

/// Status and output of a finished child
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Captured {
    pub status: ProcessStatus,
    /// Everything the child wrote to stdout (lossy UTF-8)
    pub stdout: String,
    /// Everything the child wrote to stderr; empty when stderr was inherited
    pub stderr: String,
}

/// Spawn with stdin closed and stdout piped, wait, and return the output
///
/// stderr is piped too when `capture_stderr` is set, otherwise inherited.
/// Any redirections already on `request` are replaced. The child is always
/// reaped before this returns, including when reading its output fails.
pub fn capture(request: SpawnRequest, capture_stderr: bool) -> Result<Captured> {
    let stderr = if capture_stderr {
        StreamRedirection::Pipe
    } else {
        StreamRedirection::Inherit
    };
    let mut child = request
        .stdin(StreamRedirection::Close)
        .stdout(StreamRedirection::Pipe)
        .stderr(stderr)
        .spawn()?;

    let output = communicate(&mut child);
    // Reap before looking at the read result so a failed read leaves no zombie
    let status = child.close(false);
    let (stdout, stderr) = output?;

    Ok(Captured {
        status: status?,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

/// Shorthand for [`capture`] with both stdout and stderr piped
pub fn capture_output(request: SpawnRequest) -> Result<Captured> {
    capture(request, true)
}

/// Read the child's stdout and stderr to the end
///
/// Takes whichever of the two streams the handle still holds, pipe or PTY,
/// and drains them together so neither can fill up. Streams the handle does
/// not hold come back empty. The child is not waited for.
pub fn communicate(child: &mut ProcessHandle) -> Result<(Vec<u8>, Vec<u8>)> {
    read_pipes(
        child.take_stdout().map(|s| s.into_inner()),
        child.take_stderr().map(|s| s.into_inner()),
    )
}

/// Drain both pipes until EOF, without letting either fill up
fn read_pipes(stdout: Option<File>, stderr: Option<File>) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut sources = [(stdout, Vec::new()), (stderr, Vec::new())];
    let mut buf = [0u8; 8192];

    loop {
        let open: Vec<usize> = (0..sources.len())
            .filter(|&i| sources[i].0.is_some())
            .collect();
        if open.is_empty() {
            break;
        }

        let ready: Vec<bool> = {
            let mut fds: Vec<PollFd> = sources
                .iter()
                .filter_map(|(file, _)| file.as_ref())
                .map(|file| PollFd::new(file.as_fd(), PollFlags::POLLIN))
                .collect();
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {},
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e).into()),
            }
            fds.iter()
                .map(|fd| {
                    fd.revents().is_some_and(|r| {
                        r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                    })
                })
                .collect()
        };

        for (index, is_ready) in open.into_iter().zip(ready) {
            if !is_ready {
                continue;
            }
            let (file, out) = &mut sources[index];
            let Some(reader) = file.as_mut() else {
                continue;
            };
            match reader.read(&mut buf) {
                Ok(0) => *file = None,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                // A PTY master reads EIO once the last slave is closed
                Err(e) if e.raw_os_error() == Some(libc::EIO) => *file = None,
                Err(e) => return Err(e.into()),
            }
        }
    }

    let [(_, stdout), (_, stderr)] = sources;
    Ok((stdout, stderr))
}
