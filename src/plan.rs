//! Redirection planning
//!
//! Turns the three [`StreamRedirection`]s of a request into:
//!
//! - a [`FileActionPlan`], the ordered open/dup2/close list the child runs
//!   between fork and exec, and
//! - the parent's side of every pipe and PTY, plus the child halves the
//!   parent must close once the spawn call returns.
//!
//! Pipes and PTYs are allocated here, before any process exists, so an
//! allocation failure aborts with nothing to clean up but the [`Plan`]
//! itself, which closes everything it holds on drop.

use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::stat::Mode;

use crate::alloc::{lift_above_stdio, Pipe, Pty, WindowSize};
use crate::error::{Error, Result};
use crate::stream::{Descriptor, Stream, StreamRedirection, DEFAULT_CREATE_MODE};

/// Platform null device
pub const NULL_DEVICE: &str = "/dev/null";

/// One descriptor operation run inside the child
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileAction {
    /// Open `path` and make the result descriptor `fd`
    Open {
        fd: RawFd,
        path: CString,
        flags: OFlag,
        mode: Mode,
    },
    /// `dup2(src, dst)`
    Dup2 { src: RawFd, dst: RawFd },
    /// `close(fd)`
    Close { fd: RawFd },
}

/// Ordered list of [`FileAction`]s
///
/// Actions run in exactly the order they were pushed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FileActionPlan {
    actions: Vec<FileAction>,
}

impl FileActionPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, fd: RawFd, path: CString, flags: OFlag, mode: Mode) {
        self.actions.push(FileAction::Open {
            fd,
            path,
            flags,
            mode,
        });
    }

    pub fn dup2(&mut self, src: RawFd, dst: RawFd) {
        self.actions.push(FileAction::Dup2 { src, dst });
    }

    pub fn close(&mut self, fd: RawFd) {
        self.actions.push(FileAction::Close { fd });
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FileAction> {
        self.actions.iter()
    }

    /// Run every action in order
    ///
    /// # Safety
    ///
    /// Only call this in a freshly forked child. It touches the process-wide
    /// descriptor table and sticks to async-signal-safe calls: no allocation,
    /// no locks, no logging.
    pub(crate) unsafe fn apply(&self) -> std::result::Result<(), Errno> {
        for action in &self.actions {
            match action {
                FileAction::Open {
                    fd,
                    path,
                    flags,
                    mode,
                } => {
                    let opened = retry(|| {
                        libc::open(path.as_ptr(), flags.bits(), mode.bits() as libc::c_uint)
                    })?;
                    if opened != *fd {
                        retry(|| libc::dup2(opened, *fd))?;
                        libc::close(opened);
                    }
                },
                FileAction::Dup2 { src, dst } if src == dst => {
                    // dup2 onto itself is a no-op, so drop close-on-exec by hand
                    let flags = retry(|| libc::fcntl(*src, libc::F_GETFD))?;
                    retry(|| libc::fcntl(*src, libc::F_SETFD, flags & !libc::FD_CLOEXEC))?;
                },
                FileAction::Dup2 { src, dst } => {
                    retry(|| libc::dup2(*src, *dst))?;
                },
                FileAction::Close { fd } => {
                    // EBADF here only means the slot was already closed
                    libc::close(*fd);
                },
            }
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a FileActionPlan {
    type Item = &'a FileAction;
    type IntoIter = std::slice::Iter<'a, FileAction>;

    fn into_iter(self) -> Self::IntoIter {
        self.actions.iter()
    }
}

/// Retry a raw libc call on EINTR
fn retry(mut f: impl FnMut() -> libc::c_int) -> std::result::Result<libc::c_int, Errno> {
    loop {
        match Errno::result(f()) {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

/// The parent's I/O endpoints produced by planning
#[derive(Debug, Default)]
pub struct ParentEnds {
    /// Writable end feeding the child's stdin
    pub stdin: Option<File>,
    /// Readable end of the child's stdout
    pub stdout: Option<File>,
    /// Readable end of the child's stderr
    pub stderr: Option<File>,
    /// Shared PTY master, when any slot asked for one
    pub pty: Option<Pty>,
}

impl ParentEnds {
    fn set(&mut self, stream: Stream, file: File) {
        let slot = match stream {
            Stream::Stdin => &mut self.stdin,
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        };
        *slot = Some(file);
    }

    pub fn get(&self, stream: Stream) -> Option<&File> {
        match stream {
            Stream::Stdin => self.stdin.as_ref(),
            Stream::Stdout => self.stdout.as_ref(),
            Stream::Stderr => self.stderr.as_ref(),
        }
    }
}

/// Output of [`RedirectionPlanner::plan`]
///
/// Owns every descriptor allocated for the spawn. Dropping it closes all of
/// them, which is the cleanup path for any failure before or during spawn.
#[derive(Debug, Default)]
pub struct Plan {
    actions: FileActionPlan,
    parent: ParentEnds,
    /// Child halves of pipes and handed-over descriptors; the parent closes
    /// these as soon as the spawn call returns
    child_ends: Vec<OwnedFd>,
    /// First slot wired to the PTY slave
    controlling_tty: Option<RawFd>,
}

impl Plan {
    pub fn actions(&self) -> &FileActionPlan {
        &self.actions
    }

    pub fn parent(&self) -> &ParentEnds {
        &self.parent
    }

    pub fn uses_pty(&self) -> bool {
        self.parent.pty.is_some()
    }

    pub fn controlling_tty(&self) -> Option<RawFd> {
        self.controlling_tty
    }

    /// Number of child-side descriptors still open in the parent
    pub fn child_end_count(&self) -> usize {
        self.child_ends.len()
    }

    /// Close the child halves and hand back the parent's endpoints
    pub(crate) fn into_parent_ends(self) -> ParentEnds {
        let Plan {
            parent, child_ends, ..
        } = self;
        drop(child_ends);
        parent
    }
}

/// Builds a [`Plan`] from three stream redirections
#[derive(Debug, Clone, Copy, Default)]
pub struct RedirectionPlanner {
    pty_size: Option<WindowSize>,
}

impl RedirectionPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial window size applied to a PTY when one is allocated
    pub fn with_pty_size(mut self, size: Option<WindowSize>) -> Self {
        self.pty_size = size;
        self
    }

    /// Plan stdin, stdout and stderr, in that order
    ///
    /// Later slots see the effect of earlier ones, so `stderr` duplicated
    /// from fd 1 lands wherever `stdout` was sent.
    pub fn plan(
        &self,
        stdin: StreamRedirection,
        stdout: StreamRedirection,
        stderr: StreamRedirection,
    ) -> Result<Plan> {
        let redirections = [(Stream::Stdin, stdin), (Stream::Stdout, stdout), (Stream::Stderr, stderr)];

        // Check borrowed descriptors before allocating anything, so a stale
        // number cannot be satisfied by one of our own fresh pipes
        for (stream, redirection) in &redirections {
            if let StreamRedirection::Descriptor(source) = redirection {
                validate_descriptor(*stream, source)?;
            }
        }

        let mut plan = Plan::default();
        for (stream, redirection) in redirections {
            self.plan_stream(&mut plan, stream, redirection)?;
        }

        if let Some(pty) = &plan.parent.pty {
            plan.actions.close(pty.master_fd());
        }

        tracing::debug!(
            actions = plan.actions.len(),
            pty = plan.uses_pty(),
            "planned redirections"
        );
        Ok(plan)
    }

    fn plan_stream(
        &self,
        plan: &mut Plan,
        stream: Stream,
        redirection: StreamRedirection,
    ) -> Result<()> {
        let slot = stream.fd();

        match redirection {
            StreamRedirection::Inherit => {},
            StreamRedirection::Close => plan.actions.close(slot),
            StreamRedirection::Null => {
                let flags = if stream.is_input() {
                    stream.device_flags()
                } else {
                    stream.device_flags() | OFlag::O_CREAT
                };
                plan.actions.open(
                    slot,
                    path_cstring(stream, NULL_DEVICE.as_bytes())?,
                    flags,
                    Mode::from_bits_truncate(DEFAULT_CREATE_MODE),
                );
            },
            StreamRedirection::Path { path, flags, mode } => {
                let flags = flags.unwrap_or_else(|| stream.default_file_flags());
                plan.actions.open(
                    slot,
                    path_cstring(stream, path.as_os_str().as_bytes())?,
                    flags,
                    mode,
                );
            },
            StreamRedirection::Descriptor(Descriptor::Borrowed(fd)) => {
                plan.actions.dup2(fd, slot);
            },
            StreamRedirection::Descriptor(Descriptor::Owned(fd)) => {
                // An owned 0..=2 would be clobbered by an earlier slot's dup2
                let fd = lift_above_stdio(fd).map_err(Error::allocation("descriptor"))?;
                let src = fd.as_raw_fd();
                plan.actions.dup2(src, slot);
                plan.actions.close(src);
                plan.child_ends.push(fd);
            },
            StreamRedirection::Pipe => {
                let pipe = Pipe::new()?;
                let (parent_end, child_end) = if stream.is_input() {
                    (pipe.write, pipe.read)
                } else {
                    (pipe.read, pipe.write)
                };
                plan.actions.dup2(child_end.as_raw_fd(), slot);
                plan.actions.close(child_end.as_raw_fd());
                plan.actions.close(parent_end.as_raw_fd());
                plan.parent.set(stream, File::from(parent_end));
                plan.child_ends.push(child_end);
            },
            StreamRedirection::Pty => {
                // One master for every slot that asks: they share a terminal
                let pty = match plan.parent.pty.take() {
                    Some(pty) => pty,
                    None => self.open_pty()?,
                };
                let slave = path_cstring(stream, pty.slave_path().as_bytes())?;
                let master = pty.duplicate_master()?;
                plan.parent.pty = Some(pty);

                plan.actions.open(slot, slave, stream.device_flags(), Mode::empty());
                plan.parent.set(stream, master);
                plan.controlling_tty.get_or_insert(slot);
            },
        }
        Ok(())
    }

    fn open_pty(&self) -> Result<Pty> {
        let pty = Pty::open()?;
        if let Some(size) = self.pty_size {
            pty.set_window_size(size)?;
        }
        Ok(pty)
    }
}

fn validate_descriptor(stream: Stream, source: &Descriptor) -> Result<()> {
    let fd = source.raw();
    if fd < 0 {
        return Err(Error::redirection(stream, format!("negative descriptor {}", fd)));
    }
    if let Descriptor::Borrowed(fd) = source {
        fcntl(*fd, FcntlArg::F_GETFD)
            .map_err(|e| Error::redirection(stream, format!("descriptor {} is not open: {}", fd, e)))?;
    }
    Ok(())
}

fn path_cstring(stream: Stream, bytes: &[u8]) -> Result<CString> {
    CString::new(bytes).map_err(|_| Error::redirection(stream, "path contains a NUL byte"))
}
