use crate::error::Result;
use crate::worker::{join_within, lock, ShutdownMode, Worker, WorkerLoop, WorkerState};
use agrec_core::config::CommandSpec;
use agrec_core::process::{self, ChildLog};
use chrono::Local;
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use rand::Rng;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const IDLE_WAIT: Duration = Duration::from_secs(60);
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CleanupOptions {
    pub command: CommandSpec,
    pub log_dir: Option<PathBuf>,
    pub margin: Duration,
    pub jitter: Duration,
}

/// Clonable trigger for a running [`CleanupInvoker`].
#[derive(Clone)]
pub struct CleanupHandle {
    pending: Arc<Mutex<Option<Instant>>>,
    wake: Sender<()>,
    margin: Duration,
    jitter: Duration,
}

impl CleanupHandle {
    /// Schedule one cleanup run after the margin plus jitter. Returns the
    /// delay, or `None` when a run is already pending.
    pub fn request(&self) -> Option<Duration> {
        let mut pending = lock(&self.pending);
        let now = Instant::now();
        if let Some(deadline) = *pending {
            if deadline > now {
                debug!(in_secs = (deadline - now).as_secs(), "cleanup already pending");
                return None;
            }
        }
        let jitter = if self.jitter.is_zero() {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64))
        };
        let delay = self.margin + jitter;
        *pending = Some(now + delay);
        drop(pending);
        let _ = self.wake.send(());
        info!(in_secs = delay.as_secs(), "cleanup requested");
        Some(delay)
    }
}

struct Finished {
    pid: u32,
    success: bool,
    exit: String,
}

/// Runs the cleanup command, at most one instance at a time.
pub struct CleanupInvoker {
    worker: WorkerLoop,
    options: CleanupOptions,
    handle: CleanupHandle,
    wake_rx: Receiver<()>,
    current: Arc<Mutex<Option<u32>>>,
    watchdogs: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl CleanupInvoker {
    pub fn new(options: CleanupOptions) -> Self {
        let (wake, wake_rx) = unbounded();
        Self {
            worker: WorkerLoop::new("cleanup-invoker"),
            handle: CleanupHandle {
                pending: Arc::new(Mutex::new(None)),
                wake,
                margin: options.margin,
                jitter: options.jitter,
            },
            options,
            wake_rx,
            current: Arc::new(Mutex::new(None)),
            watchdogs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn handle(&self) -> CleanupHandle {
        self.handle.clone()
    }

    pub fn request(&self) -> Option<Duration> {
        self.handle.request()
    }

    /// Pid of the cleanup child, if one is running.
    pub fn current_pid(&self) -> Option<u32> {
        *lock(&self.current)
    }
}

/// State owned by the worker thread.
struct Runner {
    options: CleanupOptions,
    pending: Arc<Mutex<Option<Instant>>>,
    current: Arc<Mutex<Option<u32>>>,
    watchdogs: Arc<Mutex<Vec<JoinHandle<()>>>>,
    done_tx: Sender<Finished>,
}

impl Runner {
    fn next_wait(&self) -> Duration {
        match *lock(&self.pending) {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => IDLE_WAIT,
        }
    }

    /// Clear the pending request if it is due.
    fn take_due(&self) -> bool {
        let mut pending = lock(&self.pending);
        match *pending {
            Some(deadline) if deadline <= Instant::now() => {
                *pending = None;
                true
            }
            _ => false,
        }
    }

    fn fire(&self) -> anyhow::Result<()> {
        if let Some(pid) = *lock(&self.current) {
            warn!(pid, "previous cleanup still running, skipping");
            return Ok(());
        }

        let log = match &self.options.log_dir {
            Some(dir) => ChildLog::Append {
                path: dir.join("cleaner.log"),
                header: format!("=> run at {}", Local::now().to_rfc3339()),
            },
            None => ChildLog::Inherit,
        };
        let mut child = match process::spawn(&self.options.command, &[], &log) {
            Ok(child) => child,
            Err(e) => {
                error!(error = %e, "failed to start cleanup");
                return Ok(());
            }
        };
        let pid = child.id();
        *lock(&self.current) = Some(pid);
        info!(pid, "cleanup started");

        let done_tx = self.done_tx.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("cleanup-watchdog-{pid}"))
            .spawn(move || {
                let finished = match child.wait() {
                    Ok(status) => Finished {
                        pid,
                        success: status.success(),
                        exit: process::describe_exit(&status),
                    },
                    Err(e) => Finished {
                        pid,
                        success: false,
                        exit: format!("wait failed: {e}"),
                    },
                };
                let _ = done_tx.send(finished);
            });
        match spawned {
            Ok(handle) => {
                lock(&self.watchdogs).push(handle);
                Ok(())
            }
            Err(e) => {
                *lock(&self.current) = None;
                let _ = process::terminate(pid);
                Err(anyhow::Error::new(e).context("failed to start cleanup watchdog"))
            }
        }
    }

    fn finish(&self, finished: Finished) {
        let mut current = lock(&self.current);
        if *current == Some(finished.pid) {
            *current = None;
        }
        drop(current);
        if finished.success {
            info!(pid = finished.pid, "cleanup finished");
        } else {
            warn!(pid = finished.pid, exit = %finished.exit, "cleanup failed, leaving work for the next run");
        }
        lock(&self.watchdogs).retain(|h| !h.is_finished());
    }
}

impl Worker for CleanupInvoker {
    fn name(&self) -> &str {
        self.worker.name()
    }

    fn start(&mut self) -> Result<()> {
        let (done_tx, done_rx) = unbounded::<Finished>();
        let runner = Runner {
            options: self.options.clone(),
            pending: Arc::clone(&self.handle.pending),
            current: Arc::clone(&self.current),
            watchdogs: Arc::clone(&self.watchdogs),
            done_tx,
        };
        let wake = self.wake_rx.clone();

        self.worker.spawn(move |stop| {
            loop {
                select! {
                    recv(stop) -> _ => break,
                    recv(wake) -> _ => continue,
                    recv(done_rx) -> msg => {
                        if let Ok(finished) = msg {
                            runner.finish(finished);
                        }
                        continue;
                    }
                    default(runner.next_wait()) => {}
                }
                if runner.take_due() {
                    runner.fire()?;
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    fn shutdown(&mut self, mode: ShutdownMode) {
        self.worker.request_stop(mode);
        if mode == ShutdownMode::Immediate {
            if let Some(pid) = self.current_pid() {
                if let Err(e) = process::terminate(pid) {
                    warn!(pid, error = %e, "failed to signal cleanup");
                }
            }
        }
    }

    fn join(&mut self) -> Result<()> {
        let result = self.worker.join();
        let immediate = self.worker.shutdown_mode() == Some(ShutdownMode::Immediate);
        let watchdogs: Vec<JoinHandle<()>> = lock(&self.watchdogs).drain(..).collect();
        for handle in watchdogs {
            if !immediate {
                if handle.join().is_err() {
                    error!("cleanup watchdog panicked");
                }
                continue;
            }
            let Some(handle) = join_within(handle, TERMINATE_GRACE) else {
                continue;
            };
            if let Some(pid) = self.current_pid() {
                let _ = process::force_kill(pid);
            }
            if join_within(handle, TERMINATE_GRACE).is_some() {
                error!("cleanup watchdog did not finish, detaching it");
            }
        }
        result
    }

    fn running(&self) -> bool {
        self.worker.is_alive() || lock(&self.watchdogs).iter().any(|h| !h.is_finished())
    }

    fn state(&self) -> WorkerState {
        match self.worker.state() {
            WorkerState::Stopped if self.running() => {
                WorkerState::ShuttingDown(self.worker.shutdown_mode().unwrap_or(ShutdownMode::Graceful))
            }
            state => state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(script: &str, margin: Duration, log_dir: Option<PathBuf>) -> CleanupOptions {
        CleanupOptions {
            command: CommandSpec::new("sh").with_args(["-c", script]),
            log_dir,
            margin,
            jitter: Duration::ZERO,
        }
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while !cond() {
            if Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        true
    }

    #[test]
    fn pending_request_is_not_rearmed() {
        let invoker = CleanupInvoker::new(options("true", Duration::from_secs(30), None));
        assert_eq!(invoker.request(), Some(Duration::from_secs(30)));
        assert_eq!(invoker.request(), None);
        assert_eq!(invoker.handle().request(), None);
    }

    #[test]
    fn runs_command_and_appends_log() {
        let dir = TempDir::new().unwrap();
        let mut invoker = CleanupInvoker::new(options(
            "echo cleaned",
            Duration::from_millis(50),
            Some(dir.path().into()),
        ));
        invoker.start().unwrap();
        invoker.request().unwrap();

        let log = dir.path().join("cleaner.log");
        let ran = |n: usize| {
            std::fs::read_to_string(&log)
                .map(|s| s.matches("cleaned").count() >= n)
                .unwrap_or(false)
        };
        assert!(wait_until(Duration::from_secs(5), || ran(1)));
        assert!(wait_until(Duration::from_secs(5), || invoker.current_pid().is_none()));

        // The pending slot cleared when the run fired, so this re-arms.
        assert!(invoker.request().is_some());
        assert!(wait_until(Duration::from_secs(5), || ran(2)));

        invoker.shutdown(ShutdownMode::Graceful);
        invoker.join().unwrap();
        let content = std::fs::read_to_string(&log).unwrap();
        assert_eq!(content.matches("=> run at ").count(), 2);
    }

    #[test]
    fn overlapping_run_is_skipped() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("runs");
        let script = format!("echo x >> {}; sleep 1", marker.display());
        let mut invoker = CleanupInvoker::new(options(&script, Duration::ZERO, None));
        invoker.start().unwrap();

        invoker.request().unwrap();
        assert!(wait_until(Duration::from_secs(5), || invoker.current_pid().is_some()));
        assert!(invoker.request().is_some());

        assert!(wait_until(Duration::from_secs(5), || invoker.current_pid().is_none()));
        invoker.shutdown(ShutdownMode::Graceful);
        invoker.join().unwrap();
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "x\n");
    }

    #[test]
    fn immediate_shutdown_terminates_cleanup() {
        let mut invoker = CleanupInvoker::new(options("sleep 30", Duration::ZERO, None));
        invoker.start().unwrap();
        invoker.request().unwrap();
        assert!(wait_until(Duration::from_secs(5), || invoker.current_pid().is_some()));

        let began = Instant::now();
        invoker.shutdown(ShutdownMode::Immediate);
        invoker.join().unwrap();
        assert!(began.elapsed() < Duration::from_secs(10));
        assert!(!invoker.running());
        assert_eq!(invoker.state(), WorkerState::Stopped);
    }
}
