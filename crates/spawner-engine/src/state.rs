//! Supervision record for one named config.

use std::collections::VecDeque;

use spawner_core::ProcessConfig;

use crate::process::Process;

/// One config plus the queue of its live processes.
///
/// `stopped` is set when an unload or session stop begins; a stopped
/// state never spawns again.
pub(crate) struct ProcessState {
    pub config: ProcessConfig,
    pub stopped: bool,
    queue: VecDeque<Process>,
}

impl ProcessState {
    pub(crate) fn new(config: ProcessConfig) -> Self {
        ProcessState {
            config,
            stopped: false,
            queue: VecDeque::new(),
        }
    }

    /// Whether any process of this config is live.
    pub(crate) fn active(&self) -> bool {
        !self.queue.is_empty()
    }

    pub(crate) fn enqueue(&mut self, process: Process) {
        self.queue.push_back(process);
    }

    pub(crate) fn get(&self, pid: u64) -> Option<&Process> {
        self.queue.iter().find(|process| process.pid == pid)
    }

    /// Remove one process by internal pid.
    pub(crate) fn remove(&mut self, pid: u64) -> Option<Process> {
        let index = self.queue.iter().position(|process| process.pid == pid)?;
        self.queue.remove(index)
    }

    /// Take every live process, oldest first. Used by reaps.
    pub(crate) fn drain(&mut self) -> Vec<Process> {
        self.queue.drain(..).collect()
    }
}
