//! Declarative child-process configuration.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpawnerError};
use crate::topic::Topic;
use crate::util::getcwd;

/// Configuration for one supervised child process.
///
/// Immutable after construction; the manager keeps one state per unique
/// `name` and spawns processes from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Unique identifier for this config within a manager.
    pub name: String,
    /// Executable, or a full command line when `args` is absent.
    pub cmd: String,
    /// Explicit arguments. When `None`, `cmd` is split by shell-word
    /// rules and a multi-token split supplies both program and arguments.
    #[serde(default)]
    pub args: Option<Vec<String>>,
    /// Environment variables for the child.
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    /// Working directory; defaults to the supervisor's own.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Merge the supervisor's inherited environment into the child's.
    #[serde(default)]
    pub os_env: bool,
    /// Pipe stdout back as read events instead of inheriting it.
    #[serde(default)]
    pub capture_stdout: bool,
    /// Pipe stderr back as read events instead of inheriting it.
    #[serde(default)]
    pub capture_stderr: bool,
}

impl ProcessConfig {
    pub fn new(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        ProcessConfig {
            name: name.into(),
            cmd: cmd.into(),
            args: None,
            env: None,
            cwd: None,
            os_env: false,
            capture_stdout: false,
            capture_stderr: false,
        }
    }

    /// Topic carrying read events for processes of this config:
    /// `state.<name>.read` (chunks arrive on its `.<label>` children).
    pub fn read_evtype(&self) -> Topic {
        Topic::new(["state", self.name.as_str(), "read"])
    }

    /// Topic carrying exit events for processes of this config:
    /// `state.<name>.exit`.
    pub fn exit_evtype(&self) -> Topic {
        Topic::new(["state", self.name.as_str(), "exit"])
    }

    /// Resolve the program and argument vector.
    ///
    /// With explicit `args`, `cmd` is the program as-is. Otherwise `cmd`
    /// is split by shell-word rules; the first token becomes the program
    /// and the rest its arguments.
    pub fn command_line(&self) -> Result<(String, Vec<String>)> {
        if let Some(args) = &self.args {
            return Ok((self.cmd.clone(), args.clone()));
        }
        let mut tokens =
            shell_words::split(&self.cmd).map_err(|err| SpawnerError::InvalidCommand {
                cmd: self.cmd.clone(),
                reason: err.to_string(),
            })?;
        if tokens.is_empty() {
            return Err(SpawnerError::InvalidCommand {
                cmd: self.cmd.clone(),
                reason: "empty command".into(),
            });
        }
        let program = tokens.remove(0);
        Ok((program, tokens))
    }

    /// Build the child environment: config env, then the inherited
    /// environment when `os_env` is set, then the per-spawn overlay.
    pub fn build_env(&self, overlay: Option<&HashMap<String, String>>) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = self.env.clone().unwrap_or_default();
        if self.os_env {
            env.extend(std::env::vars());
        }
        if let Some(overlay) = overlay {
            env.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        env
    }

    /// Resolve the working directory, expanding a leading tilde and
    /// falling back to the supervisor's current directory.
    pub fn working_dir(&self) -> PathBuf {
        match &self.cwd {
            Some(cwd) => PathBuf::from(shellexpand::tilde(&cwd.to_string_lossy()).into_owned()),
            None => getcwd(),
        }
    }
}
