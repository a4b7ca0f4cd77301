//! The supervision manager and its loop thread.
//!
//! [`Manager`] is the public entry point: caller threads validate against
//! a mutex-guarded name table, then post commands over an MPSC channel to
//! a dedicated loop thread. The loop thread owns every process, stream,
//! tracker deadline, and the [`EventEmitter`]; reader and monitor helper
//! threads feed it over the same channel, which serializes each process's
//! output ahead of its exit notification.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use indexmap::{IndexMap, IndexSet};
use nix::sys::signal::Signal;
use spawner_core::{Event, ProcessConfig, Result, SpawnerError, StreamLabel, Topic};

use crate::emitter::{self, EventEmitter, Listener, ListenerId, Publisher};
use crate::process::Process;
use crate::state::ProcessState;
use crate::tracker::ProcessTracker;

/// Deadline from SIGTERM to forced SIGKILL when a reap does not say
/// otherwise.
pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the loop sleeps when it has nothing queued and no deadline.
const IDLE_WAIT: Duration = Duration::from_millis(500);

/// `state.<name>.<kind>` topic.
fn state_topic(name: &str, kind: &str) -> Topic {
    Topic::new(["state", name, kind])
}

/// `proc.<pid>.<kind>` topic.
fn proc_topic(pid: u64, kind: &str) -> Topic {
    let pid = pid.to_string();
    Topic::new(["proc", pid.as_str(), kind])
}

/// Messages consumed by the loop thread: public commands, stream chunks,
/// and exit notifications.
pub(crate) enum LoopMsg {
    Load {
        config: ProcessConfig,
        start: bool,
    },
    Unload {
        name: String,
    },
    Commit {
        name: String,
        graceful_timeout: Option<Duration>,
        env: Option<HashMap<String, String>>,
    },
    Subscribe {
        topic: Topic,
        id: ListenerId,
        once: bool,
        listener: Listener,
    },
    Unsubscribe {
        topic: Topic,
        id: ListenerId,
    },
    Read {
        pid: u64,
        label: StreamLabel,
        data: Vec<u8>,
        error: Option<i32>,
    },
    Exited {
        pid: u64,
        exit_status: Option<i32>,
        term_signal: Option<i32>,
    },
    Wake,
    Stop,
}

impl fmt::Debug for LoopMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopMsg::Load { config, start } => f
                .debug_struct("Load")
                .field("name", &config.name)
                .field("start", start)
                .finish(),
            LoopMsg::Unload { name } => f.debug_struct("Unload").field("name", name).finish(),
            LoopMsg::Commit { name, .. } => f.debug_struct("Commit").field("name", name).finish(),
            LoopMsg::Subscribe { topic, id, once, .. } => f
                .debug_struct("Subscribe")
                .field("topic", &topic.to_string())
                .field("id", id)
                .field("once", once)
                .finish(),
            LoopMsg::Unsubscribe { topic, id } => f
                .debug_struct("Unsubscribe")
                .field("topic", &topic.to_string())
                .field("id", id)
                .finish(),
            LoopMsg::Read {
                pid, label, data, error,
            } => f
                .debug_struct("Read")
                .field("pid", pid)
                .field("label", label)
                .field("len", &data.len())
                .field("error", error)
                .finish(),
            LoopMsg::Exited {
                pid,
                exit_status,
                term_signal,
            } => f
                .debug_struct("Exited")
                .field("pid", pid)
                .field("exit_status", exit_status)
                .field("term_signal", term_signal)
                .finish(),
            LoopMsg::Wake => f.write_str("Wake"),
            LoopMsg::Stop => f.write_str("Stop"),
        }
    }
}

struct Shared {
    /// Caller-side view of loaded names, for synchronous conflict and
    /// not-found errors.
    names: Mutex<IndexSet<String>>,
    tx: Sender<LoopMsg>,
    publisher: Publisher,
    /// Moved into the loop thread on start.
    emitter: Mutex<Option<EventEmitter>>,
    rx: Mutex<Option<Receiver<LoopMsg>>>,
    started: Mutex<bool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Supervises child processes from a dedicated loop thread.
///
/// Handles are cheap clones; all of them drive the same loop. A manager
/// runs once: `start` spawns the loop thread, `stop` reaps everything,
/// waits for the graceful-timeout tracker to drain, and joins the thread.
pub struct Manager {
    shared: Arc<Shared>,
}

impl Clone for Manager {
    fn clone(&self) -> Self {
        Manager {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for Manager {
    fn default() -> Self {
        Manager::new()
    }
}

impl Manager {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        let emitter = EventEmitter::new();
        let publisher = emitter.publisher();
        Manager {
            shared: Arc::new(Shared {
                names: Mutex::new(IndexSet::new()),
                tx,
                publisher,
                emitter: Mutex::new(Some(emitter)),
                rx: Mutex::new(Some(rx)),
                started: Mutex::new(false),
                thread: Mutex::new(None),
            }),
        }
    }

    /// Start the loop thread. Commands issued earlier are processed in
    /// order once it runs.
    pub fn start(&self) -> Result<()> {
        let mut started = self.shared.started.lock().unwrap();
        if *started {
            return Err(SpawnerError::AlreadyStarted);
        }
        let rx = self
            .shared
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or(SpawnerError::AlreadyStarted)?;
        let emitter = self
            .shared
            .emitter
            .lock()
            .unwrap()
            .take()
            .ok_or(SpawnerError::AlreadyStarted)?;
        let tx = self.shared.tx.clone();
        let handle = thread::spawn(move || LoopThread::new(emitter, tx).run(&rx));
        *self.shared.thread.lock().unwrap() = Some(handle);
        *started = true;
        Ok(())
    }

    /// Stop the session: reap every state, wait for the tracker to drain,
    /// tear down, and join the loop thread. Idempotent and synchronous.
    pub fn stop(&self) {
        {
            let mut started = self.shared.started.lock().unwrap();
            if !*started {
                return;
            }
            *started = false;
        }
        let _ = self.shared.tx.send(LoopMsg::Stop);
        let handle = self.shared.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("spawner loop thread panicked");
            }
        }
    }

    pub fn started(&self) -> bool {
        *self.shared.started.lock().unwrap()
    }

    /// Register a config. With `start` a first process is spawned right
    /// away and respawned on unexpected exits.
    pub fn load(&self, config: ProcessConfig, start: bool) -> Result<()> {
        {
            let mut names = self.shared.names.lock().unwrap();
            if !names.insert(config.name.clone()) {
                return Err(SpawnerError::ProcessConflict { name: config.name });
            }
        }
        self.send(LoopMsg::Load { config, start })
    }

    /// Remove a config and reap every live process it has.
    pub fn unload(&self, name: &str) -> Result<()> {
        {
            let mut names = self.shared.names.lock().unwrap();
            if !names.shift_remove(name) {
                return Err(SpawnerError::ProcessNotFound {
                    name: name.to_string(),
                });
            }
        }
        self.send(LoopMsg::Unload {
            name: name.to_string(),
        })
    }

    /// Spawn a one-shot process for a loaded config; it is not restarted
    /// when it exits.
    pub fn commit(
        &self,
        name: &str,
        graceful_timeout: Option<Duration>,
        env: Option<HashMap<String, String>>,
    ) -> Result<()> {
        {
            let names = self.shared.names.lock().unwrap();
            if !names.contains(name) {
                return Err(SpawnerError::ProcessNotFound {
                    name: name.to_string(),
                });
            }
        }
        self.send(LoopMsg::Commit {
            name: name.to_string(),
            graceful_timeout,
            env,
        })
    }

    /// Subscribe a listener on the loop thread; the returned id
    /// unsubscribes it later.
    pub fn subscribe<F>(&self, topic: Topic, listener: F) -> Result<ListenerId>
    where
        F: FnMut(&Topic, &Event) -> anyhow::Result<()> + Send + 'static,
    {
        self.subscribe_inner(topic, false, Box::new(listener))
    }

    /// Subscribe a listener that is removed after its first delivery.
    pub fn subscribe_once<F>(&self, topic: Topic, listener: F) -> Result<ListenerId>
    where
        F: FnMut(&Topic, &Event) -> anyhow::Result<()> + Send + 'static,
    {
        self.subscribe_inner(topic, true, Box::new(listener))
    }

    fn subscribe_inner(&self, topic: Topic, once: bool, listener: Listener) -> Result<ListenerId> {
        let id = emitter::next_listener_id();
        self.send(LoopMsg::Subscribe {
            topic,
            id,
            once,
            listener,
        })?;
        Ok(id)
    }

    pub fn unsubscribe(&self, topic: &Topic, id: ListenerId) -> Result<()> {
        self.send(LoopMsg::Unsubscribe {
            topic: topic.clone(),
            id,
        })
    }

    /// Publish an event into the loop, e.g. onto a process's
    /// `proc.<pid>.write.stdin` topic to feed its stdin.
    pub fn publish(&self, topic: Topic, event: Event) -> Result<()> {
        self.shared.publisher.publish(topic, event);
        self.send(LoopMsg::Wake)
    }

    fn send(&self, msg: LoopMsg) -> Result<()> {
        self.shared.tx.send(msg).map_err(|_| SpawnerError::NotRunning)
    }
}

/// All loop-thread state. Nothing here is shared: helper threads reach
/// the loop only through the message channel.
struct LoopThread {
    emitter: EventEmitter,
    tracker: ProcessTracker,
    states: IndexMap<String, ProcessState>,
    /// Internal pid to owning state name, for stream lookups.
    running: HashMap<u64, String>,
    /// Dequeued, signalled processes awaiting their exit notification.
    reaped: HashMap<u64, Process>,
    next_pid: u64,
    tx: Sender<LoopMsg>,
    stopping: bool,
    shutdown: Rc<Cell<bool>>,
}

impl LoopThread {
    fn new(emitter: EventEmitter, tx: Sender<LoopMsg>) -> Self {
        LoopThread {
            emitter,
            tracker: ProcessTracker::new(),
            states: IndexMap::new(),
            running: HashMap::new(),
            reaped: HashMap::new(),
            next_pid: 0,
            tx,
            stopping: false,
            shutdown: Rc::new(Cell::new(false)),
        }
    }

    fn run(mut self, rx: &Receiver<LoopMsg>) {
        loop {
            // The prepare tick: deliver everything published so far.
            self.emitter.dispatch_pending();
            self.tracker.expire(Instant::now());

            if self.shutdown.get() {
                break;
            }

            let timeout = if self.emitter.has_pending() {
                Duration::ZERO
            } else {
                let now = Instant::now();
                self.tracker
                    .next_deadline()
                    .map_or(IDLE_WAIT, |deadline| deadline.saturating_duration_since(now))
            };

            match rx.recv_timeout(timeout) {
                Ok(msg) => self.handle(msg),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.tracker.stop();
        self.emitter.stop();
    }

    fn handle(&mut self, msg: LoopMsg) {
        match msg {
            LoopMsg::Load { config, start } => self.handle_load(config, start),
            LoopMsg::Unload { name } => self.handle_unload(&name),
            LoopMsg::Commit {
                name,
                graceful_timeout,
                env,
            } => self.handle_commit(&name, graceful_timeout, env.as_ref()),
            LoopMsg::Subscribe {
                topic,
                id,
                once,
                listener,
            } => self.emitter.insert(topic, id, once, listener),
            LoopMsg::Unsubscribe { topic, id } => self.emitter.unsubscribe(&topic, id),
            LoopMsg::Read {
                pid,
                label,
                data,
                error,
            } => self.handle_read(pid, label, &data, error),
            LoopMsg::Exited {
                pid,
                exit_status,
                term_signal,
            } => self.handle_exited(pid, exit_status, term_signal),
            LoopMsg::Wake => {}
            LoopMsg::Stop => self.handle_stop(),
        }
    }

    fn handle_load(&mut self, config: ProcessConfig, start: bool) {
        let name = config.name.clone();
        if self.states.contains_key(&name) {
            log::warn!("duplicate load for `{name}` dropped");
            return;
        }
        self.publish(Topic::from(["load"]), Event::Load { name: name.clone() });
        self.states.insert(name.clone(), ProcessState::new(config));
        if start {
            self.publish(Topic::from(["start"]), Event::Start { name: name.clone() });
            self.spawn_process(&name, false, None, None);
        }
    }

    fn handle_unload(&mut self, name: &str) {
        let Some(mut state) = self.states.shift_remove(name) else {
            log::warn!("unload for unknown config `{name}` dropped");
            return;
        };
        self.publish(
            Topic::from(["unload"]),
            Event::Unload {
                name: name.to_string(),
            },
        );
        self.publish(
            Topic::from(["stop"]),
            Event::Stop {
                name: name.to_string(),
            },
        );
        state.stopped = true;
        let drained = state.drain();
        self.reap_drained(name, drained);
    }

    fn handle_commit(
        &mut self,
        name: &str,
        graceful_timeout: Option<Duration>,
        env: Option<&HashMap<String, String>>,
    ) {
        if !self.states.contains_key(name) {
            log::warn!("commit for unknown config `{name}` dropped");
            return;
        }
        self.publish(
            Topic::from(["commit"]),
            Event::Commit {
                name: name.to_string(),
            },
        );
        self.spawn_process(name, true, graceful_timeout, env);
    }

    fn handle_read(&mut self, pid: u64, label: StreamLabel, data: &[u8], error: Option<i32>) {
        let process = match self.running.get(&pid) {
            Some(name) => self.states.get(name).and_then(|state| state.get(pid)),
            None => self.reaped.get(&pid),
        };
        match process {
            Some(process) => process.publish_read(label, data, error, &self.emitter),
            None => log::debug!("read event for unknown process {pid}"),
        }
    }

    fn handle_exited(&mut self, pid: u64, exit_status: Option<i32>, term_signal: Option<i32>) {
        self.tracker.uncheck(pid);
        let process = match self.running.remove(&pid) {
            Some(name) => self
                .states
                .get_mut(&name)
                .and_then(|state| state.remove(pid)),
            None => self.reaped.remove(&pid),
        };
        let Some(mut process) = process else {
            log::debug!("exit notification for unknown process {pid}");
            return;
        };

        process.mark_exited(exit_status, term_signal, &mut self.emitter);
        let event = Event::Exit {
            name: process.name.clone(),
            pid,
            exit_status: process.exit_status,
            term_signal: process.term_signal,
            once: process.once,
            error: None,
        };
        self.publish(Topic::from(["exit"]), event.clone());
        self.publish(state_topic(&process.name, "exit"), event);

        // Restart policy: exactly one respawn per unexpected exit of a
        // non-once process whose state is still loaded and not stopped.
        if !process.once {
            self.manage_processes(&process.name);
        }
    }

    fn manage_processes(&mut self, name: &str) {
        let respawn = self
            .states
            .get(name)
            .is_some_and(|state| !state.stopped && !state.active());
        if respawn {
            self.spawn_process(name, false, None, None);
        }
    }

    fn spawn_process(
        &mut self,
        name: &str,
        once: bool,
        graceful_timeout: Option<Duration>,
        env: Option<&HashMap<String, String>>,
    ) {
        self.next_pid += 1;
        let pid = self.next_pid;
        let graceful_timeout = graceful_timeout.unwrap_or(DEFAULT_GRACEFUL_TIMEOUT);

        let Some(state) = self.states.get_mut(name) else {
            log::debug!("spawn for unloaded config `{name}` dropped");
            return;
        };
        match Process::spawn(
            &state.config,
            pid,
            once,
            graceful_timeout,
            env,
            &mut self.emitter,
            &self.tx,
        ) {
            Ok(process) => {
                let os_pid = process.os_pid;
                state.enqueue(process);
                self.running.insert(pid, name.to_string());
                let event = Event::Spawn {
                    name: name.to_string(),
                    pid,
                    os_pid,
                };
                self.emitter.publish(Topic::from(["spawn"]), event.clone());
                self.emitter
                    .publish(state_topic(name, "spawn"), event.clone());
                self.emitter.publish(proc_topic(pid, "spawn"), event);
            }
            Err(err) => {
                log::error!("failed to spawn `{}`: {err}", state.config.cmd);
                let event = Event::Exit {
                    name: name.to_string(),
                    pid,
                    exit_status: None,
                    term_signal: None,
                    once,
                    error: Some(err),
                };
                self.emitter.publish(Topic::from(["exit"]), event.clone());
                self.emitter.publish(state_topic(name, "exit"), event);
            }
        }
    }

    /// SIGTERM each drained process, arm its SIGKILL deadline, and park it
    /// until the exit notification arrives.
    fn reap_drained(&mut self, name: &str, processes: Vec<Process>) {
        for process in processes {
            self.running.remove(&process.pid);
            if let Err(err) = process.kill(Signal::SIGTERM) {
                log::error!("failed to SIGTERM `{}` (pid {}): {err}", name, process.pid);
            }
            self.tracker.check(&process, process.graceful_timeout);
            let event = Event::Reap {
                name: process.name.clone(),
                pid: process.pid,
                os_pid: process.os_pid,
            };
            self.publish(Topic::from(["reap"]), event.clone());
            self.publish(state_topic(name, "reap"), event.clone());
            self.publish(proc_topic(process.pid, "reap"), event);
            self.reaped.insert(process.pid, process);
        }
    }

    fn handle_stop(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        let names: Vec<String> = self.states.keys().cloned().collect();
        for name in names {
            let drained = {
                let Some(state) = self.states.get_mut(&name) else {
                    continue;
                };
                if state.stopped {
                    continue;
                }
                state.stopped = true;
                state.drain()
            };
            self.reap_drained(&name, drained);
        }
        let shutdown = Rc::clone(&self.shutdown);
        self.tracker.on_done(move || shutdown.set(true));
    }

    fn publish(&self, topic: Topic, event: Event) {
        self.emitter.publish(topic, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_rejects_duplicate_names() {
        let manager = Manager::new();
        manager
            .load(ProcessConfig::new("web", "sleep 60"), false)
            .unwrap();
        assert_eq!(
            manager.load(ProcessConfig::new("web", "sleep 60"), false),
            Err(SpawnerError::ProcessConflict { name: "web".into() })
        );
    }

    #[test]
    fn unload_rejects_unknown_names() {
        let manager = Manager::new();
        assert_eq!(
            manager.unload("missing"),
            Err(SpawnerError::ProcessNotFound {
                name: "missing".into()
            })
        );
    }

    #[test]
    fn commit_rejects_unknown_names() {
        let manager = Manager::new();
        assert_eq!(
            manager.commit("missing", None, None),
            Err(SpawnerError::ProcessNotFound {
                name: "missing".into()
            })
        );
    }

    #[test]
    fn unload_frees_the_name_for_reloading() {
        let manager = Manager::new();
        manager
            .load(ProcessConfig::new("web", "sleep 60"), false)
            .unwrap();
        manager.unload("web").unwrap();
        manager
            .load(ProcessConfig::new("web", "sleep 60"), false)
            .unwrap();
    }

    #[test]
    fn double_start_fails() {
        let manager = Manager::new();
        manager.start().unwrap();
        assert_eq!(manager.start(), Err(SpawnerError::AlreadyStarted));
        manager.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let manager = Manager::new();
        manager.start().unwrap();
        manager.stop();
        manager.stop();
        assert!(!manager.started());
    }

    #[test]
    fn commands_after_stop_fail() {
        let manager = Manager::new();
        manager.start().unwrap();
        manager.stop();
        assert_eq!(
            manager.load(ProcessConfig::new("late", "true"), false),
            Err(SpawnerError::NotRunning)
        );
    }
}
