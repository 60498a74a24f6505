//! Serializable spawn configuration
//!
//! Lets a whole [`SpawnRequest`] be described in JSON, e.g. for `mochi-run
//! --config job.json`. Redirections use the same strings as the command line
//! (`pipe`, `null`, `file:PATH`, `fd:2`, ...).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid};
use serde::{Deserialize, Serialize};

use crate::alloc::WindowSize;
use crate::command::{Environment, SpawnRequest};
use crate::error::{Error, Result};
use crate::stream::{Stream, StreamRedirection};

/// Base environment selection
///
/// In JSON: `"inherit"`, `"clear"` or `{"explicit": {"KEY": "value"}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvPolicy {
    /// Start from the current process environment
    #[default]
    Inherit,
    /// Start from nothing
    Clear,
    /// Exactly these variables
    Explicit(BTreeMap<String, String>),
}

impl From<&EnvPolicy> for Environment {
    fn from(policy: &EnvPolicy) -> Self {
        match policy {
            EnvPolicy::Inherit => Environment::Inherit,
            EnvPolicy::Clear => Environment::Clear,
            EnvPolicy::Explicit(vars) => vars.iter().collect(),
        }
    }
}

/// A spawn described as data
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnConfig {
    /// Program path or bare name
    pub program: Option<PathBuf>,
    /// Shell command line; takes precedence over `program`
    pub shell: Option<String>,
    pub args: Vec<String>,
    pub env_policy: EnvPolicy,
    /// Variables set on top of the base environment
    pub env: BTreeMap<String, String>,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub cwd: Option<PathBuf>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub new_session: Option<bool>,
    pub reset_ids: Option<bool>,
    /// Reset the child's signal mask (default: true)
    pub reset_signal_mask: Option<bool>,
    pub pty_size: Option<WindowSize>,
}

impl SpawnConfig {
    /// Load a configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidArgument(format!("invalid spawn config: {}", e)))
    }

    /// Overlay `other` on top of `self`; fields set in `other` win
    pub fn merge(mut self, other: SpawnConfig) -> Self {
        if other.program.is_some() || other.shell.is_some() {
            self.program = other.program;
            self.shell = other.shell;
        }
        if !other.args.is_empty() {
            self.args = other.args;
        }
        if other.env_policy != EnvPolicy::default() {
            self.env_policy = other.env_policy;
        }
        self.env.extend(other.env);
        self.stdin = other.stdin.or(self.stdin);
        self.stdout = other.stdout.or(self.stdout);
        self.stderr = other.stderr.or(self.stderr);
        self.cwd = other.cwd.or(self.cwd);
        self.uid = other.uid.or(self.uid);
        self.gid = other.gid.or(self.gid);
        self.new_session = other.new_session.or(self.new_session);
        self.reset_ids = other.reset_ids.or(self.reset_ids);
        self.reset_signal_mask = other.reset_signal_mask.or(self.reset_signal_mask);
        self.pty_size = other.pty_size.or(self.pty_size);
        self
    }

    /// Build the request this configuration describes
    pub fn to_request(&self) -> Result<SpawnRequest> {
        let mut request = match (&self.shell, &self.program) {
            (Some(command), _) => SpawnRequest::shell(command.clone()),
            (None, Some(program)) => SpawnRequest::new(program.clone()),
            (None, None) => {
                return Err(Error::InvalidArgument(
                    "spawn config names neither a program nor a shell command".to_string(),
                ))
            },
        };

        request = request
            .args(&self.args)
            .environment(&self.env_policy)
            .new_session(self.new_session.unwrap_or(false))
            .reset_ids(self.reset_ids.unwrap_or(false))
            .reset_signal_mask(self.reset_signal_mask.unwrap_or(true));

        for (key, value) in &self.env {
            request = request.env(key, value);
        }

        for (stream, value) in [
            (Stream::Stdin, &self.stdin),
            (Stream::Stdout, &self.stdout),
            (Stream::Stderr, &self.stderr),
        ] {
            if let Some(value) = value {
                let redirection: StreamRedirection = value
                    .parse()
                    .map_err(|e| Error::redirection(stream, format!("{}", e)))?;
                request = request.redirect(stream, redirection);
            }
        }

        if let Some(cwd) = &self.cwd {
            request = request.current_dir(cwd.clone());
        }
        if let Some(uid) = self.uid {
            request = request.uid(Uid::from_raw(uid));
        }
        if let Some(gid) = self.gid {
            request = request.gid(Gid::from_raw(gid));
        }
        if let Some(size) = self.pty_size {
            request = request.pty_size(size);
        }
        Ok(request)
    }
}
