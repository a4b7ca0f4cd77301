//! Graceful-timeout watchdog.
//!
//! After a reap sends SIGTERM, the tracker holds one deadline entry per
//! process. If the process is still tracked when its deadline passes it
//! gets SIGKILL; a normal exit unchecks the entry first. Shutdown
//! registers an on-done callback to learn when the last entry drains.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::process::Process;

struct Entry {
    name: String,
    os_pid: u32,
    deadline: Instant,
}

#[derive(Default)]
pub(crate) struct ProcessTracker {
    entries: HashMap<u64, Entry>,
    done_callbacks: Vec<Box<dyn FnOnce()>>,
}

impl ProcessTracker {
    pub(crate) fn new() -> Self {
        ProcessTracker::default()
    }

    /// Arm a SIGKILL deadline for a just-signalled process.
    pub(crate) fn check(&mut self, process: &Process, timeout: Duration) {
        self.entries.insert(
            process.pid,
            Entry {
                name: process.name.clone(),
                os_pid: process.os_pid,
                deadline: Instant::now() + timeout,
            },
        );
    }

    /// Cancel the deadline for a process that exited on its own.
    pub(crate) fn uncheck(&mut self, pid: u64) {
        if self.entries.remove(&pid).is_some() {
            self.fire_done_if_empty();
        }
    }

    /// The earliest pending deadline, used to bound the loop's wait.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|entry| entry.deadline).min()
    }

    /// SIGKILL every entry whose deadline has passed.
    ///
    /// An entry that is still present is still running (exits uncheck),
    /// so no liveness probe is needed. SIGKILL is terminal: the entry is
    /// dropped either way and never retried.
    pub(crate) fn expire(&mut self, now: Instant) {
        let overdue: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(pid, _)| *pid)
            .collect();
        if overdue.is_empty() {
            return;
        }
        for pid in overdue {
            if let Some(entry) = self.entries.remove(&pid) {
                log::warn!(
                    "graceful timeout expired for `{}` (pid {pid}); sending SIGKILL",
                    entry.name
                );
                match kill(Pid::from_raw(entry.os_pid as i32), Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(err) => {
                        log::error!("failed to SIGKILL os pid {}: {err}", entry.os_pid);
                    }
                }
            }
        }
        self.fire_done_if_empty();
    }

    /// Register a callback fired once the entry set drains.
    ///
    /// Fires immediately when nothing is tracked.
    pub(crate) fn on_done(&mut self, callback: impl FnOnce() + 'static) {
        self.done_callbacks.push(Box::new(callback));
        self.fire_done_if_empty();
    }

    /// Drop all entries and callbacks.
    pub(crate) fn stop(&mut self) {
        self.entries.clear();
        self.done_callbacks.clear();
    }

    fn fire_done_if_empty(&mut self) {
        if self.entries.is_empty() {
            for callback in self.done_callbacks.drain(..) {
                callback();
            }
        }
    }
}
