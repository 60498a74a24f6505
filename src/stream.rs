//! Standard stream slots and their redirections
//!
//! Each of the child's three standard streams is redirected independently.
//! A [`StreamRedirection`] says where the slot should point once the child
//! execs; the planner turns it into descriptor actions.

use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::str::FromStr;

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

/// Permission bits used when a redirection creates a file
pub const DEFAULT_CREATE_MODE: libc::mode_t = 0o644;

/// One of the three standard stream slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdin,
    Stdout,
    Stderr,
}

impl Stream {
    /// All slots in the order they are planned
    pub const ALL: [Stream; 3] = [Stream::Stdin, Stream::Stdout, Stream::Stderr];

    /// Canonical descriptor number of the slot in the child
    pub fn fd(self) -> RawFd {
        match self {
            Stream::Stdin => libc::STDIN_FILENO,
            Stream::Stdout => libc::STDOUT_FILENO,
            Stream::Stderr => libc::STDERR_FILENO,
        }
    }

    /// Whether the child reads from this slot
    pub fn is_input(self) -> bool {
        matches!(self, Stream::Stdin)
    }

    /// Open flags used for `/dev/null` and PTY slaves on this slot
    pub(crate) fn device_flags(self) -> OFlag {
        if self.is_input() {
            OFlag::O_RDONLY
        } else {
            OFlag::O_WRONLY
        }
    }

    /// Open flags used for a file redirection when the caller gave none
    pub(crate) fn default_file_flags(self) -> OFlag {
        if self.is_input() {
            OFlag::O_RDONLY
        } else {
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stream::Stdin => "stdin",
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        };
        f.write_str(name)
    }
}

/// Source descriptor for [`StreamRedirection::Descriptor`]
#[derive(Debug)]
pub enum Descriptor {
    /// Caller keeps ownership; the descriptor is only duplicated into the slot
    Borrowed(RawFd),
    /// Ownership moves into the spawn; both the child and the parent close it
    Owned(OwnedFd),
}

impl Descriptor {
    pub fn raw(&self) -> RawFd {
        match self {
            Descriptor::Borrowed(fd) => *fd,
            Descriptor::Owned(fd) => fd.as_raw_fd(),
        }
    }
}

/// Where a child's standard stream points after spawn
#[derive(Debug, Default)]
pub enum StreamRedirection {
    /// Keep the parent's descriptor for this slot
    #[default]
    Inherit,
    /// Close the slot in the child before exec
    Close,
    /// Open a file onto the slot inside the child
    Path {
        path: PathBuf,
        /// `None` means read-only for stdin, write/create/truncate otherwise
        flags: Option<OFlag>,
        mode: Mode,
    },
    /// Duplicate an existing descriptor onto the slot
    Descriptor(Descriptor),
    /// Open the null device onto the slot
    Null,
    /// Connect the slot to a fresh pipe; the parent keeps the other end
    Pipe,
    /// Connect the slot to the (shared) PTY slave; the parent keeps the master
    Pty,
}

impl StreamRedirection {
    /// Redirect to a file with the slot's default flags
    pub fn file(path: impl Into<PathBuf>) -> Self {
        StreamRedirection::Path {
            path: path.into(),
            flags: None,
            mode: Mode::from_bits_truncate(DEFAULT_CREATE_MODE),
        }
    }

    /// Append to a file, creating it if missing
    pub fn append(path: impl Into<PathBuf>) -> Self {
        StreamRedirection::Path {
            path: path.into(),
            flags: Some(OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND),
            mode: Mode::from_bits_truncate(DEFAULT_CREATE_MODE),
        }
    }

    /// Redirect to a file with explicit open flags and creation mode
    pub fn file_with(path: impl Into<PathBuf>, flags: OFlag, mode: Mode) -> Self {
        StreamRedirection::Path {
            path: path.into(),
            flags: Some(flags),
            mode,
        }
    }

    /// Duplicate a descriptor the caller keeps owning
    pub fn fd(fd: RawFd) -> Self {
        StreamRedirection::Descriptor(Descriptor::Borrowed(fd))
    }

    /// Hand an owned descriptor (file, socket, pipe end) to the child
    pub fn owned(fd: impl Into<OwnedFd>) -> Self {
        StreamRedirection::Descriptor(Descriptor::Owned(fd.into()))
    }

    pub fn is_pty(&self) -> bool {
        matches!(self, StreamRedirection::Pty)
    }

    /// Whether the parent ends up holding an I/O endpoint for this slot
    pub fn has_parent_end(&self) -> bool {
        matches!(self, StreamRedirection::Pipe | StreamRedirection::Pty)
    }
}

impl From<std::fs::File> for StreamRedirection {
    fn from(file: std::fs::File) -> Self {
        StreamRedirection::owned(file)
    }
}

/// Error returned when parsing a redirection string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown redirection '{0}' (expected inherit, null, close, pipe, pty, file:PATH, append:PATH or fd:N)")]
pub struct ParseRedirectionError(pub String);

impl FromStr for StreamRedirection {
    type Err = ParseRedirectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inherit" => return Ok(StreamRedirection::Inherit),
            "null" => return Ok(StreamRedirection::Null),
            "close" => return Ok(StreamRedirection::Close),
            "pipe" => return Ok(StreamRedirection::Pipe),
            "pty" => return Ok(StreamRedirection::Pty),
            _ => {},
        }

        match s.split_once(':') {
            Some(("file", path)) if !path.is_empty() => Ok(StreamRedirection::file(path)),
            Some(("append", path)) if !path.is_empty() => Ok(StreamRedirection::append(path)),
            Some(("fd", n)) => n
                .parse()
                .map(StreamRedirection::fd)
                .map_err(|_| ParseRedirectionError(s.to_string())),
            _ => Err(ParseRedirectionError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_slots() {
        assert_eq!(Stream::Stdin.fd(), 0);
        assert_eq!(Stream::Stdout.fd(), 1);
        assert_eq!(Stream::Stderr.fd(), 2);
        assert!(Stream::Stdin.is_input());
        assert!(!Stream::Stderr.is_input());
    }

    #[test]
    fn test_default_file_flags() {
        assert_eq!(Stream::Stdin.default_file_flags(), OFlag::O_RDONLY);
        let out = Stream::Stdout.default_file_flags();
        assert!(out.contains(OFlag::O_CREAT));
        assert!(out.contains(OFlag::O_TRUNC));
    }

    #[test]
    fn test_parse_keywords() {
        assert!(matches!("pipe".parse::<StreamRedirection>(), Ok(StreamRedirection::Pipe)));
        assert!(matches!("pty".parse::<StreamRedirection>(), Ok(StreamRedirection::Pty)));
        assert!(matches!("null".parse::<StreamRedirection>(), Ok(StreamRedirection::Null)));
        assert!(matches!("close".parse::<StreamRedirection>(), Ok(StreamRedirection::Close)));
        assert!(matches!("inherit".parse::<StreamRedirection>(), Ok(StreamRedirection::Inherit)));
    }

    #[test]
    fn test_parse_file_and_fd() {
        match "append:/tmp/log".parse::<StreamRedirection>().unwrap() {
            StreamRedirection::Path { path, flags, .. } => {
                assert_eq!(path, PathBuf::from("/tmp/log"));
                assert!(flags.unwrap().contains(OFlag::O_APPEND));
            },
            other => panic!("unexpected {:?}", other),
        }
        match "fd:2".parse::<StreamRedirection>().unwrap() {
            StreamRedirection::Descriptor(Descriptor::Borrowed(2)) => {},
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("fd:x".parse::<StreamRedirection>().is_err());
        assert!("file:".parse::<StreamRedirection>().is_err());
        assert!("socket".parse::<StreamRedirection>().is_err());
    }
}
