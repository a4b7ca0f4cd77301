//! Error types for the spawner.

use thiserror::Error;

/// Errors surfaced by the supervision core.
///
/// Variants hold owned, cloneable data so the same error can travel inside
/// event payloads and be returned again from repeated [`crate::Future`]
/// waits.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpawnerError {
    #[error("no process loaded under name: {name}")]
    ProcessNotFound { name: String },

    #[error("a process is already loaded under name: {name}")]
    ProcessConflict { name: String },

    #[error("process `{cmd}` failed (exit status {exit_status:?}, term signal {term_signal:?})")]
    ProcessFailed {
        cmd: String,
        exit_status: Option<i32>,
        term_signal: Option<i32>,
    },

    #[error("failed to spawn `{cmd}`: {reason}")]
    SpawnFailed { cmd: String, reason: String },

    #[error("invalid command line `{cmd}`: {reason}")]
    InvalidCommand { cmd: String, reason: String },

    #[error("failed to signal process {os_pid}: {reason}")]
    SignalFailed { os_pid: u32, reason: String },

    #[error("manager has been started already")]
    AlreadyStarted,

    #[error("manager is not running")]
    NotRunning,

    #[error("future was cancelled")]
    Cancelled,

    #[error("timed out waiting for a result")]
    WaitTimeout,

    #[error("invalid future state: {0}")]
    InvalidState(&'static str),

    #[error("buffer is closed")]
    BufferClosed,
}

pub type Result<T> = std::result::Result<T, SpawnerError>;
