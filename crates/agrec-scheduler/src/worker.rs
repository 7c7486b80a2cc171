//! Worker capability and the loop plumbing the concrete workers share.
//!
//! A worker owns one named OS thread. The thread blocks in a
//! `crossbeam_channel::select!` over a stop channel plus whatever events the
//! worker needs; nothing else wakes it. Errors returned by the loop body are
//! logged, stored, and surfaced by [`WorkerLoop::join`].

use crate::error::{Result, SchedulerError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop arming new work; let running children finish.
    Graceful,
    /// Also ask supervised children to terminate.
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    ShuttingDown(ShutdownMode),
    Stopped,
}

pub trait Worker: Send {
    fn name(&self) -> &str;

    /// Spawn the worker thread. Calling it again is a no-op.
    fn start(&mut self) -> Result<()>;

    /// Post the stop event. Never blocks.
    fn shutdown(&mut self, mode: ShutdownMode);

    /// Block until the worker thread and any helper threads have exited.
    fn join(&mut self) -> Result<()>;

    fn running(&self) -> bool;

    fn state(&self) -> WorkerState;
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sets the state to `Stopped` however the thread exits, panics included.
struct StoppedOnExit(Arc<Mutex<WorkerState>>);

impl Drop for StoppedOnExit {
    fn drop(&mut self) {
        *lock(&self.0) = WorkerState::Stopped;
    }
}

pub struct WorkerLoop {
    name: String,
    state: Arc<Mutex<WorkerState>>,
    failure: Arc<Mutex<Option<String>>>,
    stop_tx: Sender<ShutdownMode>,
    stop_rx: Receiver<ShutdownMode>,
    handle: Option<JoinHandle<()>>,
    mode: Option<ShutdownMode>,
}

impl WorkerLoop {
    pub fn new(name: impl Into<String>) -> Self {
        let (stop_tx, stop_rx) = unbounded();
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(WorkerState::Idle)),
            failure: Arc::new(Mutex::new(None)),
            stop_tx,
            stop_rx,
            handle: None,
            mode: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `body` on the worker thread. Returns false if already started.
    pub fn spawn<F>(&mut self, body: F) -> Result<bool>
    where
        F: FnOnce(Receiver<ShutdownMode>) -> anyhow::Result<()> + Send + 'static,
    {
        if self.handle.is_some() || *lock(&self.state) != WorkerState::Idle {
            return Ok(false);
        }
        *lock(&self.state) = WorkerState::Running;

        let stop_rx = self.stop_rx.clone();
        let state = Arc::clone(&self.state);
        let failure = Arc::clone(&self.failure);
        let name = self.name.clone();
        let handle = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let _stopped = StoppedOnExit(state);
                if let Err(e) = body(stop_rx) {
                    error!(worker = %name, error = %format!("{e:#}"), "worker loop failed");
                    *lock(&failure) = Some(format!("{e:#}"));
                }
            })
            .map_err(|source| {
                *lock(&self.state) = WorkerState::Stopped;
                SchedulerError::ThreadSpawn {
                    name: self.name.clone(),
                    source,
                }
            })?;
        self.handle = Some(handle);
        Ok(true)
    }

    /// Post the stop event. An immediate request upgrades a graceful one.
    pub fn request_stop(&mut self, mode: ShutdownMode) {
        let mut state = lock(&self.state);
        match *state {
            WorkerState::Idle => *state = WorkerState::Stopped,
            WorkerState::Stopped => {}
            WorkerState::Running | WorkerState::ShuttingDown(_) => {
                *state = WorkerState::ShuttingDown(mode);
                let _ = self.stop_tx.send(mode);
            }
        }
        drop(state);
        if self.mode != Some(ShutdownMode::Immediate) {
            self.mode = Some(mode);
        }
    }

    pub fn shutdown_mode(&self) -> Option<ShutdownMode> {
        self.mode
    }

    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn state(&self) -> WorkerState {
        *lock(&self.state)
    }

    /// Join the loop thread, surfacing a failure or panic.
    pub fn join(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                return Err(SchedulerError::WorkerPanicked(self.name.clone()));
            }
        }
        match lock(&self.failure).take() {
            Some(message) => Err(SchedulerError::WorkerFailed {
                worker: self.name.clone(),
                message,
            }),
            None => Ok(()),
        }
    }
}

/// Run a user callback, logging instead of propagating errors and panics.
pub(crate) fn run_hook<F>(worker: &str, hook: &str, f: F)
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(worker, hook, error = %format!("{e:#}"), "hook failed"),
        Err(_) => error!(worker, hook, "hook panicked"),
    }
}

/// Wait up to `timeout` for `handle` to finish. Returns the handle back
/// when it is still running.
pub(crate) fn join_within(handle: JoinHandle<()>, timeout: Duration) -> Option<JoinHandle<()>> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return Some(handle);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    let _ = handle.join();
    None
}
