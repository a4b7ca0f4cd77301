//! Convenience layer for test code.
//!
//! [`Spawner`] wraps a started [`Manager`] with one-call helpers: run a
//! command and collect its stdout (`check_output`), run it for its exit
//! status (`check_call`), or hold it open for the duration of a scope
//! (`spawn`). Each call loads an anonymous one-shot config, bridges its
//! read and exit events into a [`Future`], and unloads on the way out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use spawner_core::{Event, Future, ProcessConfig, Result, SpawnerError, StringBuffer};

use crate::emitter::ListenerId;
use crate::manager::Manager;

/// Default wait for a command's result.
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_ANON_ID: AtomicU64 = AtomicU64::new(1);

fn anonymous_name() -> String {
    format!("spawn-{}", NEXT_ANON_ID.fetch_add(1, Ordering::Relaxed))
}

/// High-level command helpers over a started [`Manager`].
pub struct Spawner {
    manager: Manager,
}

impl Spawner {
    pub fn new(manager: Manager) -> Self {
        Spawner { manager }
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    /// Run `cmd` to completion and return its stdout bytes.
    ///
    /// A non-zero exit or a spawn failure is returned as the matching
    /// error; stderr output goes to the logger.
    pub fn check_output(
        &self,
        cmd: &str,
        env: Option<HashMap<String, String>>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let waiter = ProcessWaiter::start(&self.manager, cmd, env, true)?;
        let result = waiter.result(timeout);
        waiter.finish();
        result
    }

    /// Run `cmd` to completion and return its exit status (always zero).
    ///
    /// Both stdout and stderr are consumed by the logger; a non-zero exit
    /// is returned as [`SpawnerError::ProcessFailed`].
    pub fn check_call(
        &self,
        cmd: &str,
        env: Option<HashMap<String, String>>,
        timeout: Option<Duration>,
    ) -> Result<i32> {
        let waiter = ProcessWaiter::start(&self.manager, cmd, env, false)?;
        let result = waiter.result(timeout).map(|_| 0);
        waiter.finish();
        result
    }

    /// Start `cmd` and keep it supervised until the guard is stopped or
    /// dropped; teardown reaps the process and awaits its exit.
    pub fn spawn(
        &self,
        cmd: &str,
        env: Option<HashMap<String, String>>,
        timeout: Option<Duration>,
    ) -> Result<SpawnGuard> {
        let waiter = ProcessWaiter::start(&self.manager, cmd, env, true)?;
        Ok(SpawnGuard {
            waiter: Some(waiter),
            timeout,
        })
    }
}

/// Scoped handle for one supervised command.
///
/// [`SpawnGuard::stop`] unloads the config (SIGTERM, graceful timeout,
/// SIGKILL if needed) and returns the stdout collected so far. Dropping
/// the guard does the same on a best-effort basis.
pub struct SpawnGuard {
    waiter: Option<ProcessWaiter>,
    timeout: Option<Duration>,
}

impl SpawnGuard {
    /// Wait for the process to exit on its own, without stopping it.
    pub fn result(&self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        match &self.waiter {
            Some(waiter) => waiter.result(timeout),
            None => Err(SpawnerError::NotRunning),
        }
    }

    /// Reap the process and return its collected stdout.
    pub fn stop(mut self) -> Result<Vec<u8>> {
        self.stop_inner()
    }

    fn stop_inner(&mut self) -> Result<Vec<u8>> {
        let Some(waiter) = self.waiter.take() else {
            return Err(SpawnerError::NotRunning);
        };
        waiter.unload()?;
        let result = waiter.result(self.timeout);
        waiter.unsubscribe();
        result
    }
}

impl Drop for SpawnGuard {
    fn drop(&mut self) {
        if self.waiter.is_some() {
            if let Err(err) = self.stop_inner() {
                log::warn!("spawn guard teardown failed: {err}");
            }
        }
    }
}

/// Bridges one anonymous one-shot process to a [`Future`].
///
/// Loads the config without starting it, subscribes the read and exit
/// listeners, then commits; channel ordering guarantees the listeners are
/// in place before the process can emit anything.
struct ProcessWaiter {
    manager: Manager,
    config: ProcessConfig,
    future: Future<Vec<u8>>,
    read_id: ListenerId,
    exit_id: ListenerId,
}

impl ProcessWaiter {
    fn start(
        manager: &Manager,
        cmd: &str,
        env: Option<HashMap<String, String>>,
        capture_output: bool,
    ) -> Result<ProcessWaiter> {
        let mut config = ProcessConfig::new(anonymous_name(), cmd);
        config.env = env;
        config.capture_stdout = true;
        config.capture_stderr = true;

        let future = Future::new();
        let buffer = Arc::new(Mutex::new(StringBuffer::new()));

        manager.load(config.clone(), false)?;

        let sink = Arc::clone(&buffer);
        let log_name = config.name.clone();
        let read_id = manager.subscribe(config.read_evtype(), move |topic, event| {
            let Event::Read { data, .. } = event else {
                return Ok(());
            };
            if capture_output && topic.last() == Some("stdout") {
                sink.lock().unwrap().feed(data)?;
            } else {
                log::debug!(
                    "{log_name} {}: {}",
                    topic.last().unwrap_or("?"),
                    String::from_utf8_lossy(data).trim_end()
                );
            }
            Ok(())
        })?;

        let resolver = future.clone();
        let collected = Arc::clone(&buffer);
        let cmd_owned = cmd.to_string();
        let exit_id = manager.subscribe(config.exit_evtype(), move |_, event| {
            let Event::Exit {
                exit_status,
                term_signal,
                error,
                ..
            } = event
            else {
                return Ok(());
            };
            let outcome = if let Some(err) = error {
                resolver.set_error(err.clone())
            } else if exit_status.is_some_and(|status| status != 0) {
                resolver.set_error(SpawnerError::ProcessFailed {
                    cmd: cmd_owned.clone(),
                    exit_status: *exit_status,
                    term_signal: *term_signal,
                })
            } else {
                let data = collected.lock().unwrap().read_all()?.unwrap_or_default();
                resolver.set_result(data)
            };
            if let Err(err) = outcome {
                log::debug!("exit event after the future resolved: {err}");
            }
            Ok(())
        })?;

        manager.commit(&config.name, None, None)?;

        Ok(ProcessWaiter {
            manager: manager.clone(),
            config,
            future,
            read_id,
            exit_id,
        })
    }

    fn result(&self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        self.future
            .result(Some(timeout.unwrap_or(DEFAULT_WAIT_TIMEOUT)))
    }

    fn unload(&self) -> Result<()> {
        self.manager.unload(&self.config.name)
    }

    fn unsubscribe(&self) {
        let _ = self
            .manager
            .unsubscribe(&self.config.read_evtype(), self.read_id);
        let _ = self
            .manager
            .unsubscribe(&self.config.exit_evtype(), self.exit_id);
    }

    /// Teardown for commands that ran to completion: drop the listeners
    /// and unload the spent config.
    fn finish(self) {
        self.unsubscribe();
        if let Err(err) = self.unload() {
            log::debug!("unload after wait failed: {err}");
        }
    }
}
