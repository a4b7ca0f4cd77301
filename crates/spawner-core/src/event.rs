//! Event payloads delivered by the emitter.
//!
//! Events are a closed union of payloads, one variant per event family.
//! Listeners receive the full topic the event was published under together
//! with the payload, so a prefix subscriber can tell specific sub-events
//! apart.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SpawnerError;

/// Which stdio direction of a child process a stream event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamLabel {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamLabel::Stdin => "stdin",
            StreamLabel::Stdout => "stdout",
            StreamLabel::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event payload.
///
/// Lifecycle events (`Load` through `Reap`) describe manager and per-config
/// transitions; `Read` carries child output; `Exit` is terminal for one
/// process and carries either the exit status or the error that prevented
/// the spawn; `Write`/`Writelines` feed a child's stdin.
#[derive(Debug, Clone)]
pub enum Event {
    Load {
        name: String,
    },
    Unload {
        name: String,
    },
    Commit {
        name: String,
    },
    Start {
        name: String,
    },
    Stop {
        name: String,
    },
    Spawn {
        name: String,
        pid: u64,
        os_pid: u32,
    },
    Reap {
        name: String,
        pid: u64,
        os_pid: u32,
    },
    Read {
        name: String,
        pid: u64,
        stream: StreamLabel,
        data: Vec<u8>,
        error: Option<i32>,
    },
    Exit {
        name: String,
        pid: u64,
        exit_status: Option<i32>,
        term_signal: Option<i32>,
        once: bool,
        error: Option<SpawnerError>,
    },
    Write {
        data: Vec<u8>,
    },
    Writelines {
        lines: Vec<Vec<u8>>,
    },
}

impl Event {
    /// The config name this event refers to, when it refers to one.
    pub fn name(&self) -> Option<&str> {
        match self {
            Event::Load { name }
            | Event::Unload { name }
            | Event::Commit { name }
            | Event::Start { name }
            | Event::Stop { name }
            | Event::Spawn { name, .. }
            | Event::Reap { name, .. }
            | Event::Read { name, .. }
            | Event::Exit { name, .. } => Some(name),
            Event::Write { .. } | Event::Writelines { .. } => None,
        }
    }

    /// The internal process id this event refers to, when it refers to one.
    pub fn pid(&self) -> Option<u64> {
        match self {
            Event::Spawn { pid, .. }
            | Event::Reap { pid, .. }
            | Event::Read { pid, .. }
            | Event::Exit { pid, .. } => Some(*pid),
            _ => None,
        }
    }
}
