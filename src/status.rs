//! Process status and wait-status decoding
//!
//! A child is `Running` until a wait call observes its termination, after
//! which it is `Exited` or `Signaled` for good.

use std::fmt;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use serde::ser::{Serialize, SerializeStruct, Serializer};

use crate::error::{Error, Result};

/// Exit status a child uses when its pre-exec setup fails
///
/// Setup failures (setsid, chdir, setuid, file actions) are not reported in
/// any more detail than this.
pub const SETUP_FAILURE_STATUS: i32 = 127;

/// Lifecycle state of a child process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessStatus {
    /// Not yet observed to terminate
    Running,
    /// Terminated normally with this exit code (0-255)
    Exited(i32),
    /// Terminated by a signal; the flag tells whether it dumped core
    Signaled(i32, bool),
}

impl ProcessStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessStatus::Running)
    }

    /// Exited or signaled; never changes again
    pub fn is_terminal(&self) -> bool {
        !self.is_running()
    }

    /// Exited with code 0
    pub fn success(&self) -> bool {
        matches!(self, ProcessStatus::Exited(0))
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ProcessStatus::Exited(code) => Some(*code),
            _ => None,
        }
    }

    /// The terminating signal, when it is one nix knows by name
    pub fn signal(&self) -> Option<Signal> {
        match self {
            ProcessStatus::Signaled(signal, _) => Signal::try_from(*signal).ok(),
            _ => None,
        }
    }

    pub fn core_dumped(&self) -> bool {
        matches!(self, ProcessStatus::Signaled(_, true))
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Exited(code) => write!(f, "exited with status {}", code),
            ProcessStatus::Signaled(signal, core) => {
                match Signal::try_from(*signal) {
                    Ok(sig) => write!(f, "killed by {}", sig)?,
                    Err(_) => write!(f, "killed by signal {}", signal)?,
                }
                if *core {
                    write!(f, " (core dumped)")?;
                }
                Ok(())
            },
        }
    }
}

impl Serialize for ProcessStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ProcessStatus::Running => {
                let mut state = serializer.serialize_struct("ProcessStatus", 1)?;
                state.serialize_field("state", "running")?;
                state.end()
            },
            ProcessStatus::Exited(code) => {
                let mut state = serializer.serialize_struct("ProcessStatus", 2)?;
                state.serialize_field("state", "exited")?;
                state.serialize_field("code", code)?;
                state.end()
            },
            ProcessStatus::Signaled(signal, core_dumped) => {
                let mut state = serializer.serialize_struct("ProcessStatus", 3)?;
                state.serialize_field("state", "signaled")?;
                state.serialize_field("signal", signal)?;
                state.serialize_field("core_dumped", core_dumped)?;
                state.end()
            },
        }
    }
}

/// Decode a raw waitpid status word
///
/// Only exits and signal deaths are expected: the handle never asks for
/// stopped or continued notifications. Anything else is reported as
/// [`Error::UnexpectedStatus`] instead of being guessed at.
pub fn decode(pid: Pid, raw: i32) -> Result<ProcessStatus> {
    if libc::WIFEXITED(raw) {
        Ok(ProcessStatus::Exited(libc::WEXITSTATUS(raw)))
    } else if libc::WIFSIGNALED(raw) {
        Ok(ProcessStatus::Signaled(libc::WTERMSIG(raw), libc::WCOREDUMP(raw)))
    } else {
        Err(Error::UnexpectedStatus { pid, raw })
    }
}

/// Wait for `pid`, optionally without blocking
///
/// Returns `None` when `nohang` is set and the child is still alive.
pub(crate) fn wait_raw(pid: Pid, nohang: bool) -> Result<Option<i32>> {
    let options = if nohang { libc::WNOHANG } else { 0 };
    let mut raw: libc::c_int = 0;
    loop {
        // SAFETY: raw is a valid out-pointer for the duration of the call
        let ret = unsafe { libc::waitpid(pid.as_raw(), &mut raw, options) };
        match Errno::result(ret) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(raw)),
            Err(Errno::EINTR) => continue,
            Err(source) => return Err(Error::Wait { pid, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pid() -> Pid {
        Pid::from_raw(1234)
    }

    #[test]
    fn test_decode_exit() {
        assert_eq!(decode(pid(), 7 << 8).unwrap(), ProcessStatus::Exited(7));
        assert_eq!(decode(pid(), 0).unwrap(), ProcessStatus::Exited(0));
    }

    #[test]
    fn test_decode_signal() {
        assert_eq!(decode(pid(), 9).unwrap(), ProcessStatus::Signaled(9, false));
        assert_eq!(
            decode(pid(), 11 | 0x80).unwrap(),
            ProcessStatus::Signaled(11, true)
        );
    }

    #[test]
    fn test_decode_rejects_stopped() {
        // WIFSTOPPED: low byte 0x7f, stop signal in the next byte
        let stopped = (libc::SIGSTOP << 8) | 0x7f;
        assert!(matches!(
            decode(pid(), stopped),
            Err(Error::UnexpectedStatus { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_continued() {
        assert!(matches!(
            decode(pid(), 0xffff),
            Err(Error::UnexpectedStatus { .. })
        ));
    }

    #[test]
    fn test_status_helpers() {
        assert!(ProcessStatus::Running.is_running());
        assert!(ProcessStatus::Exited(0).success());
        assert!(!ProcessStatus::Exited(1).success());
        assert_eq!(ProcessStatus::Exited(3).code(), Some(3));
        assert_eq!(ProcessStatus::Signaled(9, false).code(), None);
        assert_eq!(
            ProcessStatus::Signaled(9, false).signal(),
            Some(Signal::SIGKILL)
        );
        assert!(ProcessStatus::Signaled(6, true).core_dumped());
    }

    #[test]
    fn test_display() {
        assert_eq!(ProcessStatus::Exited(2).to_string(), "exited with status 2");
        assert_eq!(
            ProcessStatus::Signaled(9, false).to_string(),
            "killed by SIGKILL"
        );
        assert_eq!(
            ProcessStatus::Signaled(6, true).to_string(),
            "killed by SIGABRT (core dumped)"
        );
    }

    #[test]
    fn test_serialize() {
        let json = serde_json::to_string(&ProcessStatus::Exited(0)).unwrap();
        assert_eq!(json, r#"{"state":"exited","code":0}"#);
        let json = serde_json::to_string(&ProcessStatus::Signaled(9, false)).unwrap();
        assert_eq!(json, r#"{"state":"signaled","signal":9,"core_dumped":false}"#);
    }

    proptest! {
        #[test]
        fn prop_exit_codes_decode(code in 0i32..=255) {
            prop_assert_eq!(decode(pid(), code << 8).unwrap(), ProcessStatus::Exited(code));
        }

        #[test]
        fn prop_signals_decode(signal in 1i32..=31, core in any::<bool>()) {
            let raw = signal | if core { 0x80 } else { 0 };
            prop_assert_eq!(decode(pid(), raw).unwrap(), ProcessStatus::Signaled(signal, core));
        }
    }
}
