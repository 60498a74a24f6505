//! Spawn requests and the argv/envp they materialize into

use std::ffi::{CStr, CString, OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::unistd::{access, AccessFlags, Gid, Uid};

use crate::alloc::WindowSize;
use crate::error::{Error, Result};
use crate::handle::ProcessHandle;
use crate::stream::{Stream, StreamRedirection};

/// Shell used for [`Program::Shell`]
pub const SYSTEM_SHELL: &str = "/bin/sh";

/// Search path used when neither the child nor the parent has `PATH`
const DEFAULT_PATH: &str = "/usr/bin:/bin";

/// What to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Program {
    /// A program path, or a bare name looked up in `PATH`
    Path(PathBuf),
    /// A command line run by the system shell via `sh -c`
    Shell(String),
}

/// Environment handed to the child
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Environment {
    /// The current process environment, unmodified
    #[default]
    Inherit,
    /// No variables at all
    Clear,
    /// Exactly these pairs, in this order
    Explicit(Vec<(OsString, OsString)>),
}

impl Program {
    /// Human-readable program name for logs and errors
    pub fn display_name(&self) -> String {
        match self {
            Program::Path(path) => path.display().to_string(),
            Program::Shell(command) => command.clone(),
        }
    }
}

impl From<bool> for Environment {
    fn from(inherit: bool) -> Self {
        if inherit {
            Environment::Inherit
        } else {
            Environment::Clear
        }
    }
}

impl<K, V> FromIterator<(K, V)> for Environment
where
    K: Into<OsString>,
    V: Into<OsString>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Environment::Explicit(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Everything needed to start one child process
///
/// Built with chained setters and consumed by [`SpawnRequest::spawn`].
#[derive(Debug)]
pub struct SpawnRequest {
    program: Program,
    args: Vec<OsString>,
    environment: Environment,
    env_overrides: Vec<(OsString, OsString)>,
    stdin: StreamRedirection,
    stdout: StreamRedirection,
    stderr: StreamRedirection,
    new_session: bool,
    cwd: Option<PathBuf>,
    uid: Option<Uid>,
    gid: Option<Gid>,
    reset_ids: bool,
    reset_signal_mask: bool,
    pty_size: Option<WindowSize>,
}

impl SpawnRequest {
    /// Run `program` directly
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self::with_program(Program::Path(program.into()))
    }

    /// Run `command` through the system shell
    pub fn shell(command: impl Into<String>) -> Self {
        Self::with_program(Program::Shell(command.into()))
    }

    pub fn with_program(program: Program) -> Self {
        Self {
            program,
            args: Vec::new(),
            environment: Environment::Inherit,
            env_overrides: Vec::new(),
            stdin: StreamRedirection::Inherit,
            stdout: StreamRedirection::Inherit,
            stderr: StreamRedirection::Inherit,
            new_session: false,
            cwd: None,
            uid: None,
            gid: None,
            reset_ids: false,
            reset_signal_mask: true,
            pty_size: None,
        }
    }

    /// Add an argument
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    /// Choose the base environment
    pub fn environment(mut self, environment: impl Into<Environment>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Set one variable on top of the base environment
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env_overrides
            .push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        self
    }

    pub fn stdin(mut self, redirection: StreamRedirection) -> Self {
        self.stdin = redirection;
        self
    }

    pub fn stdout(mut self, redirection: StreamRedirection) -> Self {
        self.stdout = redirection;
        self
    }

    pub fn stderr(mut self, redirection: StreamRedirection) -> Self {
        self.stderr = redirection;
        self
    }

    /// Redirect one slot by name
    pub fn redirect(self, stream: Stream, redirection: StreamRedirection) -> Self {
        match stream {
            Stream::Stdin => self.stdin(redirection),
            Stream::Stdout => self.stdout(redirection),
            Stream::Stderr => self.stderr(redirection),
        }
    }

    /// Make the child a session leader (setsid)
    pub fn new_session(mut self, new_session: bool) -> Self {
        self.new_session = new_session;
        self
    }

    /// Change directory in the child before exec
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn uid(mut self, uid: Uid) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn gid(mut self, gid: Gid) -> Self {
        self.gid = Some(gid);
        self
    }

    /// Reset the effective uid/gid to the real ones in the child
    pub fn reset_ids(mut self, reset: bool) -> Self {
        self.reset_ids = reset;
        self
    }

    /// Empty the signal mask and restore default dispositions in the child
    pub fn reset_signal_mask(mut self, reset: bool) -> Self {
        self.reset_signal_mask = reset;
        self
    }

    /// Initial window size of the PTY, if one is requested
    pub fn pty_size(mut self, size: WindowSize) -> Self {
        self.pty_size = Some(size);
        self
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    pub fn get_cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn get_uid(&self) -> Option<Uid> {
        self.uid
    }

    pub fn get_gid(&self) -> Option<Gid> {
        self.gid
    }

    pub fn get_reset_ids(&self) -> bool {
        self.reset_ids
    }

    pub fn get_reset_signal_mask(&self) -> bool {
        self.reset_signal_mask
    }

    pub fn get_pty_size(&self) -> Option<WindowSize> {
        self.pty_size
    }

    /// Whether any slot is wired to a PTY
    pub fn uses_pty(&self) -> bool {
        self.stdin.is_pty() || self.stdout.is_pty() || self.stderr.is_pty()
    }

    /// Whether the child becomes a session leader
    ///
    /// Always true when a PTY is requested: only a session leader can take
    /// the slave as its controlling terminal.
    pub fn is_new_session(&self) -> bool {
        self.new_session || self.uses_pty()
    }

    /// Plan the redirections, fork and exec
    pub fn spawn(self) -> Result<ProcessHandle> {
        crate::spawn::spawn(self)
    }

    /// Split into the process setup and the three redirections
    pub(crate) fn into_parts(self) -> (ChildSetup, [StreamRedirection; 3]) {
        let new_session = self.is_new_session();
        let setup = ChildSetup {
            program: self.program,
            args: self.args,
            environment: self.environment,
            env_overrides: self.env_overrides,
            new_session,
            cwd: self.cwd,
            uid: self.uid,
            gid: self.gid,
            reset_ids: self.reset_ids,
            reset_signal_mask: self.reset_signal_mask,
            pty_size: self.pty_size,
        };
        (setup, [self.stdin, self.stdout, self.stderr])
    }
}

/// The non-stream part of a request
#[derive(Debug, Clone)]
pub(crate) struct ChildSetup {
    pub program: Program,
    pub args: Vec<OsString>,
    pub environment: Environment,
    pub env_overrides: Vec<(OsString, OsString)>,
    pub new_session: bool,
    pub cwd: Option<PathBuf>,
    pub uid: Option<Uid>,
    pub gid: Option<Gid>,
    pub reset_ids: bool,
    pub reset_signal_mask: bool,
    pub pty_size: Option<WindowSize>,
}

impl ChildSetup {
    pub fn display_name(&self) -> String {
        self.program.display_name()
    }
}

/// A NULL-terminated `char *` array over owned C strings
///
/// The pointer array is built up front so the child can pass it straight to
/// execve without allocating.
#[derive(Debug)]
pub struct CStringArray {
    items: Vec<CString>,
    ptrs: Vec<*const libc::c_char>,
}

impl CStringArray {
    pub fn new(items: Vec<CString>) -> Self {
        let mut ptrs: Vec<*const libc::c_char> = items.iter().map(|s| s.as_ptr()).collect();
        ptrs.push(std::ptr::null());
        Self { items, ptrs }
    }

    pub fn as_ptr(&self) -> *const *const libc::c_char {
        self.ptrs.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CStr> {
        self.items.iter().map(|s| s.as_c_str())
    }
}

/// Resolved program path, argv and envp for exec
#[derive(Debug)]
pub struct ExecArgs {
    pub path: CString,
    pub argv: CStringArray,
    pub envp: CStringArray,
}

impl ExecArgs {
    /// Materialize argv and envp, resolving bare program names against `PATH`
    pub(crate) fn build(setup: &ChildSetup) -> Result<Self> {
        let env = environment_pairs(&setup.environment, &setup.env_overrides);

        let (path, argv) = match &setup.program {
            Program::Shell(command) => {
                let mut argv = vec![
                    OsString::from("sh"),
                    OsString::from("-c"),
                    OsString::from(command),
                    OsString::from("sh"),
                ];
                argv.extend(setup.args.iter().cloned());
                (PathBuf::from(SYSTEM_SHELL), argv)
            },
            Program::Path(program) => {
                let path = resolve_program(program, &env).ok_or_else(|| Error::Spawn {
                    program: program.display().to_string(),
                    source: Errno::ENOENT,
                })?;
                let mut argv = vec![program.as_os_str().to_owned()];
                argv.extend(setup.args.iter().cloned());
                (path, argv)
            },
        };

        let path = to_cstring(path.as_os_str().as_bytes(), "program path")?;
        let argv = argv
            .iter()
            .map(|a| to_cstring(a.as_bytes(), "argument"))
            .collect::<Result<Vec<_>>>()?;
        let envp = env
            .iter()
            .map(|(k, v)| env_entry(k, v))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            path,
            argv: CStringArray::new(argv),
            envp: CStringArray::new(envp),
        })
    }
}

/// Base environment with overrides layered on top; later keys win
fn environment_pairs(
    environment: &Environment,
    overrides: &[(OsString, OsString)],
) -> Vec<(OsString, OsString)> {
    let mut pairs: Vec<(OsString, OsString)> = match environment {
        Environment::Inherit => std::env::vars_os().collect(),
        Environment::Clear => Vec::new(),
        Environment::Explicit(pairs) => pairs.clone(),
    };

    for (key, value) in overrides {
        pairs.retain(|(k, _)| k != key);
        pairs.push((key.clone(), value.clone()));
    }
    pairs
}

fn env_entry(key: &OsStr, value: &OsStr) -> Result<CString> {
    if key.as_bytes().contains(&b'=') {
        return Err(Error::InvalidArgument(format!(
            "environment key {:?} contains '='",
            key
        )));
    }
    let mut entry = Vec::with_capacity(key.len() + 1 + value.len());
    entry.extend_from_slice(key.as_bytes());
    entry.push(b'=');
    entry.extend_from_slice(value.as_bytes());
    to_cstring(&entry, "environment entry")
}

fn to_cstring(bytes: &[u8], what: &str) -> Result<CString> {
    CString::new(bytes).map_err(|_| {
        Error::InvalidArgument(format!(
            "{} contains a NUL byte: {:?}",
            what,
            String::from_utf8_lossy(bytes)
        ))
    })
}

/// Find `program` the way execvp would
///
/// Names containing a slash are used as given; the exec itself reports
/// whether they exist. Bare names are searched in the child's `PATH`, then
/// the parent's, then a fixed default.
fn resolve_program(program: &Path, env: &[(OsString, OsString)]) -> Option<PathBuf> {
    if program.as_os_str().as_bytes().contains(&b'/') {
        return Some(program.to_path_buf());
    }
    if program.as_os_str().is_empty() {
        return None;
    }

    let search = env
        .iter()
        .find(|(k, _)| k == "PATH")
        .map(|(_, v)| v.clone())
        .or_else(|| std::env::var_os("PATH"))
        .unwrap_or_else(|| OsString::from(DEFAULT_PATH));

    std::env::split_paths(&search)
        .map(|dir| {
            if dir.as_os_str().is_empty() {
                PathBuf::from(".").join(program)
            } else {
                dir.join(program)
            }
        })
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.is_file() && access(path, AccessFlags::X_OK).is_ok()
}

/// Rebuild an `OsString` from an argv entry, for display and tests
pub fn os_string(arg: &CStr) -> OsString {
    OsString::from_vec(arg.to_bytes().to_vec())
}
