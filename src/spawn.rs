//! Fork and exec with an ordered child-side setup
//!
//! Between fork and exec the child runs, strictly in this order:
//!
//! 1. `setsid` when a new session was requested (or a PTY forces one)
//! 2. `chdir` to the requested working directory
//! 3. `setgid`, then `setuid`
//! 4. effective-id reset to the real ids
//! 5. signal mask and disposition reset
//! 6. the [`FileActionPlan`]
//! 7. best-effort `TIOCSCTTY` on the first PTY slot
//!
//! then execs. Only a failed exec is reported back to the parent (through a
//! close-on-exec pipe, the same trick the standard library uses). Any
//! failure in steps 1-6 makes the child `_exit` with
//! [`SETUP_FAILURE_STATUS`]; the parent sees a child that exited at once and
//! nothing more. In particular a bad working directory, a refused `setuid`
//! or an unopenable redirection path all look the same.
//!
//! Everything the child touches is built before the fork. The child makes
//! only async-signal-safe calls: no allocation, no locks, no logging.

use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{fork, ForkResult, Gid, Pid, Uid};

use crate::alloc::Pipe;
use crate::command::{ChildSetup, ExecArgs};
use crate::error::{Error, Result};
use crate::handle::ProcessHandle;
use crate::plan::{FileActionPlan, RedirectionPlanner};
use crate::status::{wait_raw, SETUP_FAILURE_STATUS};
use crate::SpawnRequest;

/// Marks a well-formed exec failure report
const EXEC_FAILURE_FOOTER: [u8; 4] = *b"NOEX";

/// Signals put back to their default disposition when resetting
const RESET_SIGNALS: [libc::c_int; 7] = [
    libc::SIGPIPE,
    libc::SIGCHLD,
    libc::SIGHUP,
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGTERM,
    libc::SIGALRM,
];

/// Plan, build argv/envp, fork and exec
pub(crate) fn spawn(request: SpawnRequest) -> Result<ProcessHandle> {
    let (setup, [stdin, stdout, stderr]) = request.into_parts();
    let program = setup.display_name();

    // Owns every allocated descriptor: any early return below closes them
    let plan = RedirectionPlanner::new()
        .with_pty_size(setup.pty_size)
        .plan(stdin, stdout, stderr)?;
    let exec = ExecArgs::build(&setup)?;
    let attrs = ChildAttrs::new(&setup, plan.controlling_tty())?;

    let pid = Spawner::new(&program).spawn(&attrs, plan.actions(), &exec)?;

    let ends = plan.into_parent_ends();
    tracing::debug!(%pid, program = %program, "spawned child");
    Ok(ProcessHandle::new(pid, ends))
}

/// Process attributes applied in the child, flattened for use after fork
#[derive(Debug)]
pub(crate) struct ChildAttrs {
    new_session: bool,
    cwd: Option<CString>,
    uid: Option<Uid>,
    gid: Option<Gid>,
    reset_ids: bool,
    reset_signal_mask: bool,
    controlling_tty: Option<RawFd>,
}

impl ChildAttrs {
    pub(crate) fn new(setup: &ChildSetup, controlling_tty: Option<RawFd>) -> Result<Self> {
        let cwd = setup
            .cwd
            .as_ref()
            .map(|dir| {
                CString::new(dir.as_os_str().as_bytes()).map_err(|_| {
                    Error::InvalidArgument(format!(
                        "working directory contains a NUL byte: {}",
                        dir.display()
                    ))
                })
            })
            .transpose()?;

        Ok(Self {
            new_session: setup.new_session,
            cwd,
            uid: setup.uid,
            gid: setup.gid,
            reset_ids: setup.reset_ids,
            reset_signal_mask: setup.reset_signal_mask,
            controlling_tty: if setup.new_session {
                controlling_tty
            } else {
                None
            },
        })
    }
}

/// Runs the fork/setup/exec sequence for one program
#[derive(Debug)]
pub(crate) struct Spawner<'a> {
    program: &'a str,
}

impl<'a> Spawner<'a> {
    pub(crate) fn new(program: &'a str) -> Self {
        Self { program }
    }

    /// Fork, set the child up and exec it
    ///
    /// Returns once the child has exec'd (or died during setup). A failed
    /// exec is reaped here and returned as [`Error::Spawn`].
    pub(crate) fn spawn(
        &self,
        attrs: &ChildAttrs,
        actions: &FileActionPlan,
        exec: &ExecArgs,
    ) -> Result<Pid> {
        let report = Pipe::new()?;

        // SAFETY: the child branch only makes async-signal-safe calls on
        // data prepared before the fork, and never returns
        match unsafe { fork() }.map_err(|source| self.error(source))? {
            ForkResult::Child => unsafe {
                exec_child(attrs, actions, exec, report.write.as_raw_fd())
            },
            ForkResult::Parent { child } => {
                drop(report.write);
                self.await_exec(child, File::from(report.read))
            },
        }
    }

    /// Read the exec report: EOF means the exec happened
    fn await_exec(&self, pid: Pid, mut report: File) -> Result<Pid> {
        let mut bytes = [0u8; 8];
        loop {
            match report.read(&mut bytes) {
                Ok(0) => return Ok(pid),
                Ok(8) if bytes[4..] == EXEC_FAILURE_FOOTER => {
                    let errno = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                    wait_raw(pid, false)?;
                    let source = Errno::from_raw(errno);
                    tracing::debug!(program = %self.program, %source, "exec failed");
                    return Err(self.error(source));
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.abandon(pid);
                    return Err(e.into());
                },
                Ok(n) => {
                    self.abandon(pid);
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("malformed exec report ({} bytes)", n),
                    )
                    .into());
                },
            }
        }
    }

    /// Kill and reap a child whose exec state is unknown
    fn abandon(&self, pid: Pid) {
        let _ = kill(pid, Signal::SIGKILL);
        let _ = wait_raw(pid, false);
    }

    fn error(&self, source: Errno) -> Error {
        Error::Spawn {
            program: self.program.to_string(),
            source,
        }
    }
}

/// Child side of the fork
///
/// # Safety
///
/// Must only run in a freshly forked child.
unsafe fn exec_child(
    attrs: &ChildAttrs,
    actions: &FileActionPlan,
    exec: &ExecArgs,
    report: RawFd,
) -> ! {
    if setup_child(attrs, actions).is_err() {
        libc::_exit(SETUP_FAILURE_STATUS);
    }

    libc::execve(exec.path.as_ptr(), exec.argv.as_ptr(), exec.envp.as_ptr());

    let errno = (Errno::last() as i32).to_be_bytes();
    let bytes = [
        errno[0],
        errno[1],
        errno[2],
        errno[3],
        EXEC_FAILURE_FOOTER[0],
        EXEC_FAILURE_FOOTER[1],
        EXEC_FAILURE_FOOTER[2],
        EXEC_FAILURE_FOOTER[3],
    ];
    // Writes up to PIPE_BUF bytes are atomic
    libc::write(report, bytes.as_ptr().cast(), bytes.len());
    libc::_exit(SETUP_FAILURE_STATUS)
}

unsafe fn setup_child(
    attrs: &ChildAttrs,
    actions: &FileActionPlan,
) -> std::result::Result<(), Errno> {
    if attrs.new_session {
        Errno::result(libc::setsid())?;
    }

    if let Some(cwd) = &attrs.cwd {
        Errno::result(libc::chdir(cwd.as_ptr()))?;
    }

    if let Some(gid) = attrs.gid {
        Errno::result(libc::setgid(gid.as_raw()))?;
    }
    if let Some(uid) = attrs.uid {
        // Drop supplementary groups when we are allowed to
        match Errno::result(libc::setgroups(0, std::ptr::null())) {
            Ok(_) | Err(Errno::EPERM) => {},
            Err(e) => return Err(e),
        }
        Errno::result(libc::setuid(uid.as_raw()))?;
    }

    if attrs.reset_ids {
        Errno::result(libc::setegid(libc::getgid()))?;
        Errno::result(libc::seteuid(libc::getuid()))?;
    }

    if attrs.reset_signal_mask {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        Errno::result(libc::sigprocmask(
            libc::SIG_SETMASK,
            &set,
            std::ptr::null_mut(),
        ))?;
        for signal in RESET_SIGNALS {
            libc::signal(signal, libc::SIG_DFL);
        }
    }

    actions.apply()?;

    if let Some(tty) = attrs.controlling_tty {
        // Linux already attached the slave when it was opened without
        // O_NOCTTY; other systems need the ioctl
        libc::ioctl(tty, libc::TIOCSCTTY as _, 0);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::ProcessStatus;
    use crate::stream::StreamRedirection;

    #[test]
    fn test_exec_failure_is_spawn_error() {
        let err = SpawnRequest::new("/nonexistent/program").spawn().unwrap_err();
        match err {
            Error::Spawn { program, source } => {
                assert_eq!(program, "/nonexistent/program");
                assert_eq!(source, Errno::ENOENT);
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_exec_permission_denied() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("not-executable");
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();

        let err = SpawnRequest::new(&script).spawn().unwrap_err();
        assert!(matches!(
            err,
            Error::Spawn {
                source: Errno::EACCES,
                ..
            }
        ));
    }

    #[test]
    fn test_bad_cwd_is_setup_failure() {
        let mut child = SpawnRequest::new("/bin/sh")
            .arg("-c")
            .arg("exit 0")
            .current_dir("/nonexistent/directory")
            .spawn()
            .expect("setup failures are not spawn errors");
        assert_eq!(
            child.wait_status().unwrap(),
            ProcessStatus::Exited(SETUP_FAILURE_STATUS)
        );
    }

    #[test]
    fn test_unopenable_redirection_is_setup_failure() {
        let mut child = SpawnRequest::new("/bin/sh")
            .arg("-c")
            .arg("exit 0")
            .stdin(StreamRedirection::file("/nonexistent/input"))
            .spawn()
            .unwrap();
        assert_eq!(
            child.wait_status().unwrap(),
            ProcessStatus::Exited(SETUP_FAILURE_STATUS)
        );
    }

    #[test]
    fn test_child_attrs_ignore_tty_without_session() {
        let (setup, _) = SpawnRequest::new("/bin/true").into_parts();
        let attrs = ChildAttrs::new(&setup, Some(1)).unwrap();
        assert!(attrs.controlling_tty.is_none());
        assert!(!attrs.new_session);
    }
}
