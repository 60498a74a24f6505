//! Mochi Spawn Library
//!
//! Starts child processes with fine-grained control over their standard
//! streams and process attributes, then tracks them to completion.
//!
//! - `stream`: per-stream redirection choices
//! - `alloc`: pipes, PTYs and window sizes
//! - `plan`: turns redirections into a child-side file action plan
//! - `command`: the spawn request builder, argv and environment
//! - `spawn`: fork/setup/exec
//! - `status` / `handle`: waiting, signalling and closing children
//! - `capture`: run-to-completion with collected output
//! - `config`: JSON spawn configuration
//!
//! ```no_run
//! use mochi_spawn::{SpawnRequest, StreamRedirection};
//! use std::io::Read;
//!
//! let mut child = SpawnRequest::new("ls")
//!     .arg("-l")
//!     .stdout(StreamRedirection::Pipe)
//!     .spawn()?;
//! let mut listing = String::new();
//! child.stdout().unwrap().read_to_string(&mut listing)?;
//! let status = child.close(false)?;
//! # Ok::<(), mochi_spawn::Error>(())
//! ```

pub mod alloc;
pub mod capture;
pub mod command;
pub mod config;
pub mod error;
pub mod handle;
pub mod plan;
mod spawn;
pub mod status;
pub mod stream;

pub use alloc::{Pipe, Pty, WindowSize};
pub use capture::{capture, capture_output, communicate, Captured};
pub use command::{Environment, Program, SpawnRequest};
pub use config::{EnvPolicy, SpawnConfig};
pub use error::{Error, Result};
pub use handle::{ChildStderr, ChildStdin, ChildStdout, ProcessHandle};
pub use plan::{FileAction, FileActionPlan, ParentEnds, Plan, RedirectionPlanner};
pub use status::{decode, ProcessStatus, SETUP_FAILURE_STATUS};
pub use stream::{Descriptor, Stream, StreamRedirection};
