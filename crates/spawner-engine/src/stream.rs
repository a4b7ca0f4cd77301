//! Stdio streams bridging child pipes and emitter topics.
//!
//! Each process owns three streams. The readable ones (stdout/stderr)
//! hand their pipe to a reader thread that forwards chunks into the loop
//! channel; the writable one (stdin) subscribes handlers on its write
//! topics and forwards published bytes into the pipe.

use std::io::{Read, Write};
use std::process::ChildStdin;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use spawner_core::{Event, StreamLabel, Topic};

use crate::emitter::{EventEmitter, ListenerId};
use crate::manager::LoopMsg;

/// Read size for one chunk off a child pipe.
const READ_CHUNK: usize = 8192;

pub(crate) struct Stream {
    name: String,
    pid: u64,
    label: StreamLabel,
    /// `proc.<pid>.read.<label>`
    read_topic: Topic,
    /// `state.<name>.read.<label>` — the config-level feed.
    state_read_topic: Topic,
    write_topic: Topic,
    writelines_topic: Topic,
    writer: Option<Arc<Mutex<Option<ChildStdin>>>>,
    subscriptions: Vec<(Topic, ListenerId)>,
    stopped: bool,
}

impl Stream {
    pub(crate) fn new(name: &str, pid: u64, label: StreamLabel) -> Self {
        let pid_token = pid.to_string();
        let proc_prefix = Topic::new(["proc", pid_token.as_str()]);
        Stream {
            name: name.to_string(),
            pid,
            label,
            read_topic: proc_prefix.child("read").child(label.as_str()),
            state_read_topic: Topic::new(["state", name, "read", label.as_str()]),
            write_topic: proc_prefix.child("write").child(label.as_str()),
            writelines_topic: proc_prefix.child("writelines").child(label.as_str()),
            writer: None,
            subscriptions: Vec::new(),
            stopped: false,
        }
    }

    /// Spawn the reader thread for a readable pipe.
    ///
    /// The thread forwards every non-empty chunk as a [`LoopMsg::Read`]
    /// and exits on EOF. A read error is logged, forwarded once with its
    /// errno, and closes the stream. The returned handle is joined by the
    /// process monitor before the exit notification is sent, so no output
    /// is dropped between the last chunk and the exit event.
    pub(crate) fn start_reader<R>(&self, pipe: R, tx: Sender<LoopMsg>) -> JoinHandle<()>
    where
        R: Read + Send + 'static,
    {
        let pid = self.pid;
        let name = self.name.clone();
        let label = self.label;
        thread::spawn(move || {
            let mut pipe = pipe;
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match pipe.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let msg = LoopMsg::Read {
                            pid,
                            label,
                            data: buf[..n].to_vec(),
                            error: None,
                        };
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        log::error!("read error on {label} of `{name}`: {err}");
                        let _ = tx.send(LoopMsg::Read {
                            pid,
                            label,
                            data: Vec::new(),
                            error: err.raw_os_error(),
                        });
                        break;
                    }
                }
            }
        })
    }

    /// Subscribe the write/writelines handlers for the stdin pipe.
    ///
    /// Handlers tolerate a closed pipe silently; a write error evicts the
    /// handler through the emitter's listener-fault path.
    pub(crate) fn start_writer(&mut self, pipe: ChildStdin, emitter: &mut EventEmitter) {
        let writer = Arc::new(Mutex::new(Some(pipe)));
        self.writer = Some(Arc::clone(&writer));

        let sink = Arc::clone(&writer);
        let id = emitter.subscribe(self.write_topic.clone(), move |_, event| {
            let Event::Write { data } = event else {
                return Ok(());
            };
            let mut guard = sink.lock().unwrap();
            if let Some(pipe) = guard.as_mut() {
                pipe.write_all(data)?;
                pipe.flush()?;
            }
            Ok(())
        });
        self.subscriptions.push((self.write_topic.clone(), id));

        let sink = Arc::clone(&writer);
        let id = emitter.subscribe(self.writelines_topic.clone(), move |_, event| {
            let Event::Writelines { lines } = event else {
                return Ok(());
            };
            let mut guard = sink.lock().unwrap();
            if let Some(pipe) = guard.as_mut() {
                for line in lines {
                    pipe.write_all(line)?;
                }
                pipe.flush()?;
            }
            Ok(())
        });
        self.subscriptions.push((self.writelines_topic.clone(), id));
    }

    /// Publish one chunk under both the per-process and per-config topics.
    pub(crate) fn publish_read(&self, emitter: &EventEmitter, data: &[u8], error: Option<i32>) {
        let event = Event::Read {
            name: self.name.clone(),
            pid: self.pid,
            stream: self.label,
            data: data.to_vec(),
            error,
        };
        emitter.publish(self.read_topic.clone(), event.clone());
        emitter.publish(self.state_read_topic.clone(), event);
    }

    /// Unsubscribe handlers and close the write pipe. Idempotent.
    pub(crate) fn stop(&mut self, emitter: &mut EventEmitter) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        for (topic, id) in self.subscriptions.drain(..) {
            emitter.unsubscribe(&topic, id);
        }
        if let Some(writer) = self.writer.take() {
            // Dropping the handle closes the child's stdin.
            writer.lock().unwrap().take();
        }
    }
}
