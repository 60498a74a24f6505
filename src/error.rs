//! Error types for spawn operations

use std::io;

use nix::unistd::Pid;
use thiserror::Error;

use crate::stream::Stream;

/// Spawn error type
#[derive(Error, Debug)]
pub enum Error {
    /// A pipe or PTY could not be allocated (descriptor exhaustion, system limits)
    #[error("Failed to allocate {resource}: {source}")]
    ResourceAllocation {
        resource: &'static str,
        #[source]
        source: nix::Error,
    },

    /// A stream redirection was rejected while planning
    #[error("Invalid redirection for {stream}: {reason}")]
    Redirection { stream: Stream, reason: String },

    /// Program, argument, environment or path contained an interior NUL byte
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// fork or exec failed; no child is left behind
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: nix::Error,
    },

    /// waitpid failed for a child this handle owns
    #[error("Failed to wait for child {pid}: {source}")]
    Wait {
        pid: Pid,
        #[source]
        source: nix::Error,
    },

    /// waitpid returned a status word that is neither an exit nor a signal death
    #[error("Unexpected wait status {raw:#x} for child {pid}")]
    UnexpectedStatus { pid: Pid, raw: i32 },

    /// kill failed
    #[error("Failed to signal child {pid}: {source}")]
    Signal {
        pid: Pid,
        #[source]
        source: nix::Error,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for spawn operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn allocation(resource: &'static str) -> impl FnOnce(nix::Error) -> Self {
        move |source| Error::ResourceAllocation { resource, source }
    }

    pub(crate) fn redirection(stream: Stream, reason: impl Into<String>) -> Self {
        Error::Redirection {
            stream,
            reason: reason.into(),
        }
    }
}
