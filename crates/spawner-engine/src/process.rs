//! One live child process.

use std::collections::HashMap;
use std::process::{Command, Stdio};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use spawner_core::{ProcessConfig, Result, SpawnerError, StreamLabel};

use crate::emitter::EventEmitter;
use crate::manager::LoopMsg;
use crate::stream::Stream;

/// Runtime handle for one spawned child.
///
/// Owned by its config's state queue on the loop thread. The child itself
/// is owned by a monitor thread that waits for the exit, joins the stream
/// readers so all output is flushed into the loop channel, and then posts
/// the exit notification.
pub(crate) struct Process {
    pub pid: u64,
    pub os_pid: u32,
    pub name: String,
    pub once: bool,
    pub graceful_timeout: Duration,
    pub exit_status: Option<i32>,
    pub term_signal: Option<i32>,
    pub running: bool,
    stdin: Stream,
    stdout: Stream,
    stderr: Stream,
}

impl Process {
    /// Spawn a child for `config` and wire up its streams.
    ///
    /// Failure to launch is returned as [`SpawnerError::SpawnFailed`];
    /// the manager converts it into an exit event carrying the error.
    pub(crate) fn spawn(
        config: &ProcessConfig,
        pid: u64,
        once: bool,
        graceful_timeout: Duration,
        env_overlay: Option<&HashMap<String, String>>,
        emitter: &mut EventEmitter,
        tx: &Sender<LoopMsg>,
    ) -> Result<Process> {
        let (program, args) = config.command_line()?;
        let env = config.build_env(env_overlay);
        let cwd = config.working_dir();

        let mut command = Command::new(&program);
        command
            .args(&args)
            .env_clear()
            .envs(&env)
            .current_dir(&cwd)
            .stdin(Stdio::piped())
            .stdout(stdio_for(config.capture_stdout))
            .stderr(stdio_for(config.capture_stderr));

        let mut child = command.spawn().map_err(|err| SpawnerError::SpawnFailed {
            cmd: config.cmd.clone(),
            reason: err.to_string(),
        })?;
        let os_pid = child.id();

        let mut stdin = Stream::new(&config.name, pid, StreamLabel::Stdin);
        let stdout = Stream::new(&config.name, pid, StreamLabel::Stdout);
        let stderr = Stream::new(&config.name, pid, StreamLabel::Stderr);

        let stdin_pipe = child.stdin.take().expect("stdin was piped");
        stdin.start_writer(stdin_pipe, emitter);

        let mut readers = Vec::new();
        if let Some(pipe) = child.stdout.take() {
            readers.push(stdout.start_reader(pipe, tx.clone()));
        }
        if let Some(pipe) = child.stderr.take() {
            readers.push(stderr.start_reader(pipe, tx.clone()));
        }

        // Monitor thread: wait for the exit, flush the readers, notify
        // the loop. Joining the readers first guarantees every read
        // message is already in the channel when the exit message lands.
        let monitor_tx = tx.clone();
        let name = config.name.clone();
        thread::spawn(move || {
            let status = child.wait();
            for reader in readers {
                let _ = reader.join();
            }
            let (exit_status, term_signal) = match status {
                Ok(status) => {
                    use std::os::unix::process::ExitStatusExt;
                    (status.code(), status.signal())
                }
                Err(err) => {
                    log::error!("wait for `{name}` (pid {pid}) failed: {err}");
                    (None, None)
                }
            };
            let _ = monitor_tx.send(LoopMsg::Exited {
                pid,
                exit_status,
                term_signal,
            });
        });

        Ok(Process {
            pid,
            os_pid,
            name: config.name.clone(),
            once,
            graceful_timeout,
            exit_status: None,
            term_signal: None,
            running: true,
            stdin,
            stdout,
            stderr,
        })
    }

    /// Send a signal to the child; a process that is already gone is
    /// not an error.
    pub(crate) fn kill(&self, signal: Signal) -> Result<()> {
        match kill(Pid::from_raw(self.os_pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(SpawnerError::SignalFailed {
                os_pid: self.os_pid,
                reason: err.to_string(),
            }),
        }
    }

    /// Publish one chunk read from the labelled stream.
    pub(crate) fn publish_read(
        &self,
        label: StreamLabel,
        data: &[u8],
        error: Option<i32>,
        emitter: &EventEmitter,
    ) {
        let stream = match label {
            StreamLabel::Stdin => &self.stdin,
            StreamLabel::Stdout => &self.stdout,
            StreamLabel::Stderr => &self.stderr,
        };
        stream.publish_read(emitter, data, error);
    }

    /// Record the exit outcome and release the streams.
    ///
    /// The exit is recorded at most once; a second notification for the
    /// same process is a no-op.
    pub(crate) fn mark_exited(
        &mut self,
        exit_status: Option<i32>,
        term_signal: Option<i32>,
        emitter: &mut EventEmitter,
    ) {
        if !self.running {
            return;
        }
        self.running = false;
        self.exit_status = exit_status;
        self.term_signal = term_signal;
        self.stdin.stop(emitter);
        self.stdout.stop(emitter);
        self.stderr.stop(emitter);
    }
}

fn stdio_for(capture: bool) -> Stdio {
    if capture {
        Stdio::piped()
    } else {
        Stdio::inherit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn spawn(config: &ProcessConfig) -> (Process, mpsc::Receiver<LoopMsg>, EventEmitter) {
        let mut emitter = EventEmitter::new();
        let (tx, rx) = mpsc::channel();
        let process = Process::spawn(
            config,
            1,
            true,
            Duration::from_secs(10),
            None,
            &mut emitter,
            &tx,
        )
        .unwrap();
        (process, rx, emitter)
    }

    fn wait_for_exit(rx: &mpsc::Receiver<LoopMsg>) -> (Option<i32>, Option<i32>, Vec<u8>) {
        let mut output = Vec::new();
        loop {
            match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                LoopMsg::Read { data, .. } => output.extend_from_slice(&data),
                LoopMsg::Exited {
                    exit_status,
                    term_signal,
                    ..
                } => return (exit_status, term_signal, output),
                _ => {}
            }
        }
    }

    #[test]
    fn captures_stdout_before_exit() {
        let mut config = ProcessConfig::new("echo", "echo hello");
        config.capture_stdout = true;
        let (process, rx, _emitter) = spawn(&config);

        assert!(process.running);
        assert!(process.os_pid > 0);

        let (exit_status, term_signal, output) = wait_for_exit(&rx);
        assert_eq!(exit_status, Some(0));
        assert_eq!(term_signal, None);
        assert_eq!(output, b"hello\n");
    }

    #[test]
    fn reports_nonzero_exit_status() {
        let config = ProcessConfig::new("fail", "sh -c 'exit 42'");
        let (_process, rx, _emitter) = spawn(&config);

        let (exit_status, _, _) = wait_for_exit(&rx);
        assert_eq!(exit_status, Some(42));
    }

    #[test]
    fn reports_termination_signal() {
        let config = ProcessConfig::new("sleeper", "sleep 60");
        let (process, rx, _emitter) = spawn(&config);

        process.kill(Signal::SIGTERM).unwrap();
        let (exit_status, term_signal, _) = wait_for_exit(&rx);
        assert_eq!(exit_status, None);
        assert_eq!(term_signal, Some(libc_signal(Signal::SIGTERM)));
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let config = ProcessConfig::new("missing", "/nonexistent/program/12345");
        let mut emitter = EventEmitter::new();
        let (tx, _rx) = mpsc::channel();
        let result = Process::spawn(
            &config,
            1,
            true,
            Duration::from_secs(10),
            None,
            &mut emitter,
            &tx,
        );
        assert!(matches!(result, Err(SpawnerError::SpawnFailed { .. })));
    }

    #[test]
    fn kill_after_exit_is_swallowed() {
        let config = ProcessConfig::new("quick", "true");
        let (process, rx, _emitter) = spawn(&config);
        wait_for_exit(&rx);
        // The pid is reaped by the monitor; signalling it again is a no-op.
        process.kill(Signal::SIGTERM).unwrap();
    }

    fn libc_signal(signal: Signal) -> i32 {
        signal as i32
    }
}
