//! A thread-safe one-shot result cell.
//!
//! [`Future`] bridges the supervisor's loop thread and the caller thread:
//! the loop resolves it from an exit event, the caller blocks on
//! [`Future::result`] with an optional timeout. Handles are cheap clones
//! sharing one cell; the cell transitions monotonically toward `Finished`
//! or `CancelledAndNotified` and never changes again afterwards.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Result, SpawnerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Running,
    Cancelled,
    CancelledAndNotified,
    Finished,
}

type DoneCallback<T> = Box<dyn FnOnce(&Future<T>) -> anyhow::Result<()> + Send>;

struct Cell<T> {
    state: State,
    result: Option<T>,
    error: Option<SpawnerError>,
    callbacks: Vec<DoneCallback<T>>,
}

struct Inner<T> {
    cell: Mutex<Cell<T>>,
    cond: Condvar,
}

/// A cancellable one-shot result cell.
pub struct Future<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Future<T> {
    fn default() -> Self {
        Future::new()
    }
}

impl<T> Future<T> {
    pub fn new() -> Self {
        Future {
            inner: Arc::new(Inner {
                cell: Mutex::new(Cell {
                    state: State::Pending,
                    result: None,
                    error: None,
                    callbacks: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Cancel the future if it has not started running.
    ///
    /// Returns `true` when the future is (now) cancelled, `false` when it
    /// is running or already finished. The first successful cancel wakes
    /// waiters and runs done-callbacks.
    pub fn cancel(&self) -> bool {
        let callbacks = {
            let mut cell = self.inner.cell.lock().unwrap();
            match cell.state {
                State::Pending => {
                    cell.state = State::Cancelled;
                    self.inner.cond.notify_all();
                    std::mem::take(&mut cell.callbacks)
                }
                State::Cancelled | State::CancelledAndNotified => return true,
                State::Running | State::Finished => return false,
            }
        };
        self.invoke_callbacks(callbacks);
        true
    }

    pub fn cancelled(&self) -> bool {
        matches!(
            self.inner.cell.lock().unwrap().state,
            State::Cancelled | State::CancelledAndNotified
        )
    }

    pub fn running(&self) -> bool {
        self.inner.cell.lock().unwrap().state == State::Running
    }

    pub fn done(&self) -> bool {
        matches!(
            self.inner.cell.lock().unwrap().state,
            State::Cancelled | State::CancelledAndNotified | State::Finished
        )
    }

    /// Mark the future as running, or acknowledge a cancellation.
    ///
    /// Returns `Ok(true)` on the `Pending` to `Running` transition and
    /// `Ok(false)` when the future was cancelled before it could start
    /// (waiters and callbacks were already notified by the cancel).
    pub fn set_running_or_notify_cancel(&self) -> Result<bool> {
        let mut cell = self.inner.cell.lock().unwrap();
        match cell.state {
            State::Pending => {
                cell.state = State::Running;
                Ok(true)
            }
            State::Cancelled => {
                cell.state = State::CancelledAndNotified;
                Ok(false)
            }
            State::CancelledAndNotified => Ok(false),
            State::Running => Err(SpawnerError::InvalidState("already running")),
            State::Finished => Err(SpawnerError::InvalidState("already finished")),
        }
    }

    /// Store the result and move to `Finished`.
    ///
    /// Fails unless the future is `Pending` or `Running`.
    pub fn set_result(&self, value: T) -> Result<()> {
        self.finish(Some(value), None)
    }

    /// Store an error and move to `Finished`.
    ///
    /// Fails unless the future is `Pending` or `Running`.
    pub fn set_error(&self, error: SpawnerError) -> Result<()> {
        self.finish(None, Some(error))
    }

    fn finish(&self, result: Option<T>, error: Option<SpawnerError>) -> Result<()> {
        let callbacks = {
            let mut cell = self.inner.cell.lock().unwrap();
            match cell.state {
                State::Pending | State::Running => {
                    cell.result = result;
                    cell.error = error;
                    cell.state = State::Finished;
                    self.inner.cond.notify_all();
                    std::mem::take(&mut cell.callbacks)
                }
                State::Cancelled | State::CancelledAndNotified => {
                    return Err(SpawnerError::InvalidState("cancelled"));
                }
                State::Finished => return Err(SpawnerError::InvalidState("already finished")),
            }
        };
        self.invoke_callbacks(callbacks);
        Ok(())
    }

    /// Register a callback invoked exactly once when the future completes.
    ///
    /// If the future is already done the callback runs immediately on the
    /// calling thread. A callback returning `Err` is logged and swallowed;
    /// later callbacks still run.
    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Future<T>) -> anyhow::Result<()> + Send + 'static,
    {
        let run_now = {
            let mut cell = self.inner.cell.lock().unwrap();
            match cell.state {
                State::Pending | State::Running => {
                    cell.callbacks.push(Box::new(callback));
                    None
                }
                State::Cancelled | State::CancelledAndNotified | State::Finished => {
                    Some(callback)
                }
            }
        };
        if let Some(callback) = run_now {
            self.invoke_callbacks(vec![Box::new(callback)]);
        }
    }

    fn invoke_callbacks(&self, callbacks: Vec<DoneCallback<T>>) {
        for callback in callbacks {
            if let Err(err) = callback(self) {
                log::error!("future done-callback failed: {err:#}");
            }
        }
    }
}

impl<T: Clone> Future<T> {
    /// Block until the future completes and return its result.
    ///
    /// `None` waits indefinitely. Errors with [`SpawnerError::Cancelled`]
    /// when the future was cancelled, the stored error when it finished
    /// with one, and [`SpawnerError::WaitTimeout`] when the deadline
    /// passes first. Repeated calls return the same outcome.
    pub fn result(&self, timeout: Option<Duration>) -> Result<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut cell = self.inner.cell.lock().unwrap();
        loop {
            match cell.state {
                State::Cancelled | State::CancelledAndNotified => {
                    return Err(SpawnerError::Cancelled);
                }
                State::Finished => {
                    return match &cell.error {
                        Some(err) => Err(err.clone()),
                        None => Ok(cell
                            .result
                            .clone()
                            .expect("finished future holds a result")),
                    };
                }
                State::Pending | State::Running => match deadline {
                    None => cell = self.inner.cond.wait(cell).unwrap(),
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return Err(SpawnerError::WaitTimeout);
                        }
                        cell = self
                            .inner
                            .cond
                            .wait_timeout(cell, deadline - now)
                            .unwrap()
                            .0;
                    }
                },
            }
        }
    }

    /// Block until the future completes and return its error, if any.
    ///
    /// Like [`Future::result`], but a finished-with-error future yields
    /// `Ok(Some(error))` instead of propagating it.
    pub fn error(&self, timeout: Option<Duration>) -> Result<Option<SpawnerError>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut cell = self.inner.cell.lock().unwrap();
        loop {
            match cell.state {
                State::Cancelled | State::CancelledAndNotified => {
                    return Err(SpawnerError::Cancelled);
                }
                State::Finished => return Ok(cell.error.clone()),
                State::Pending | State::Running => match deadline {
                    None => cell = self.inner.cond.wait(cell).unwrap(),
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return Err(SpawnerError::WaitTimeout);
                        }
                        cell = self
                            .inner
                            .cond
                            .wait_timeout(cell, deadline - now)
                            .unwrap()
                            .0;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    const ZERO: Option<Duration> = Some(Duration::ZERO);

    fn pending() -> Future<i32> {
        Future::new()
    }

    fn running() -> Future<i32> {
        let f = Future::new();
        f.set_running_or_notify_cancel().unwrap();
        f
    }

    fn cancelled() -> Future<i32> {
        let f = Future::new();
        assert!(f.cancel());
        f
    }

    fn cancelled_and_notified() -> Future<i32> {
        let f = cancelled();
        assert!(!f.set_running_or_notify_cancel().unwrap());
        f
    }

    fn finished_ok(value: i32) -> Future<i32> {
        let f = Future::new();
        f.set_result(value).unwrap();
        f
    }

    fn finished_err() -> Future<i32> {
        let f = Future::new();
        f.set_error(SpawnerError::NotRunning).unwrap();
        f
    }

    #[test]
    fn done_callback_with_result() {
        let seen = Arc::new(Mutex::new(None));
        let seen_cb = Arc::clone(&seen);

        let f = Future::new();
        f.add_done_callback(move |fut| {
            *seen_cb.lock().unwrap() = Some(fut.result(ZERO)?);
            Ok(())
        });
        f.set_result(5).unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(5));
    }

    #[test]
    fn done_callback_with_error() {
        let seen = Arc::new(Mutex::new(None));
        let seen_cb = Arc::clone(&seen);

        let f: Future<i32> = Future::new();
        f.add_done_callback(move |fut| {
            *seen_cb.lock().unwrap() = fut.error(ZERO)?;
            Ok(())
        });
        f.set_error(SpawnerError::NotRunning).unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(SpawnerError::NotRunning));
    }

    #[test]
    fn done_callback_with_cancel() {
        let was_cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&was_cancelled);

        let f: Future<i32> = Future::new();
        f.add_done_callback(move |fut| {
            flag.store(fut.cancelled(), Ordering::SeqCst);
            Ok(())
        });
        assert!(f.cancel());
        assert!(was_cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn failing_callback_does_not_stop_later_callbacks() {
        let second_ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&second_ran);

        let f = Future::new();
        f.add_done_callback(|_| anyhow::bail!("doh!"));
        f.add_done_callback(move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        f.set_result(5).unwrap();
        assert!(second_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn done_callback_already_successful() {
        let seen = Arc::new(Mutex::new(None));
        let seen_cb = Arc::clone(&seen);

        let f = finished_ok(5);
        f.add_done_callback(move |fut| {
            *seen_cb.lock().unwrap() = Some(fut.result(ZERO)?);
            Ok(())
        });
        assert_eq!(*seen.lock().unwrap(), Some(5));
    }

    #[test]
    fn done_callback_already_cancelled() {
        let was_cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&was_cancelled);

        let f = cancelled();
        f.add_done_callback(move |fut| {
            flag.store(fut.cancelled(), Ordering::SeqCst);
            Ok(())
        });
        assert!(was_cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_state_matrix() {
        assert!(pending().cancel());
        assert!(cancelled().cancel());
        assert!(cancelled_and_notified().cancel());
        assert!(!running().cancel());
        assert!(!finished_ok(5).cancel());
        assert!(!finished_err().cancel());
    }

    #[test]
    fn cancelled_state_matrix() {
        assert!(!pending().cancelled());
        assert!(!running().cancelled());
        assert!(cancelled().cancelled());
        assert!(cancelled_and_notified().cancelled());
        assert!(!finished_ok(5).cancelled());
        assert!(!finished_err().cancelled());
    }

    #[test]
    fn done_state_matrix() {
        assert!(!pending().done());
        assert!(!running().done());
        assert!(cancelled().done());
        assert!(cancelled_and_notified().done());
        assert!(finished_ok(5).done());
        assert!(finished_err().done());
    }

    #[test]
    fn set_result_after_terminal_state_fails() {
        assert!(finished_ok(5).set_result(6).is_err());
        assert!(finished_err().set_result(6).is_err());
        assert!(cancelled().set_result(6).is_err());
        assert!(cancelled_and_notified().set_error(SpawnerError::NotRunning).is_err());
    }

    #[test]
    fn result_with_timeout() {
        assert_eq!(pending().result(ZERO), Err(SpawnerError::WaitTimeout));
        assert_eq!(running().result(ZERO), Err(SpawnerError::WaitTimeout));
        assert_eq!(cancelled().result(ZERO), Err(SpawnerError::Cancelled));
        assert_eq!(
            cancelled_and_notified().result(ZERO),
            Err(SpawnerError::Cancelled)
        );
        assert_eq!(finished_err().result(ZERO), Err(SpawnerError::NotRunning));
        assert_eq!(finished_ok(42).result(ZERO), Ok(42));
    }

    #[test]
    fn result_is_idempotent() {
        let f = finished_ok(42);
        assert_eq!(f.result(ZERO), Ok(42));
        assert_eq!(f.result(ZERO), Ok(42));

        let f = finished_err();
        assert_eq!(f.result(ZERO), Err(SpawnerError::NotRunning));
        assert_eq!(f.result(ZERO), Err(SpawnerError::NotRunning));
    }

    #[test]
    fn result_delivered_across_threads() {
        let f = pending();
        let resolver = f.clone();
        let t = thread::spawn(move || {
            // Let the main thread reach its wait first.
            thread::sleep(Duration::from_millis(100));
            resolver.set_result(42).unwrap();
        });

        assert_eq!(f.result(Some(Duration::from_secs(5))), Ok(42));
        t.join().unwrap();
    }

    #[test]
    fn cancel_delivered_across_threads() {
        let f = pending();
        let canceller = f.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            assert!(canceller.cancel());
        });

        assert_eq!(
            f.result(Some(Duration::from_secs(5))),
            Err(SpawnerError::Cancelled)
        );
        t.join().unwrap();
    }

    #[test]
    fn error_with_timeout() {
        assert_eq!(pending().error(ZERO), Err(SpawnerError::WaitTimeout));
        assert_eq!(running().error(ZERO), Err(SpawnerError::WaitTimeout));
        assert_eq!(cancelled().error(ZERO), Err(SpawnerError::Cancelled));
        assert_eq!(
            cancelled_and_notified().error(ZERO),
            Err(SpawnerError::Cancelled)
        );
        assert_eq!(finished_err().error(ZERO), Ok(Some(SpawnerError::NotRunning)));
        assert_eq!(finished_ok(42).error(ZERO), Ok(None));
    }

    #[test]
    fn error_delivered_across_threads() {
        let f = pending();
        let resolver = f.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            resolver.set_error(SpawnerError::NotRunning).unwrap();
        });

        assert_eq!(
            f.error(Some(Duration::from_secs(5))),
            Ok(Some(SpawnerError::NotRunning))
        );
        t.join().unwrap();
    }
}
