//! Fires the recorder process for each upcoming airing.
//!
//! Timers live on the worker thread only. Each spawned child gets a watchdog
//! thread that waits for it; watchdog handles are queued to one waiter
//! thread that joins them in spawn order, so shutdown can wait for every
//! in-flight recording by joining the waiter.

use crate::error::Result;
use crate::timers::{TimerJob, TimerSet};
use crate::worker::{join_within, lock, run_hook, ShutdownMode, Worker, WorkerLoop, WorkerState};
use agrec_core::config::CommandSpec;
use agrec_core::process::{self, ChildLog};
use agrec_core::{Program, Schedule};
use anyhow::Context;
use chrono::Utc;
use chrono_tz::Tz;
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Child;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

/// Longest single wait; the wall clock is re-read at least this often.
const MAX_WAIT: Duration = Duration::from_secs(60);
/// How long an immediate shutdown waits for children after SIGTERM, and
/// again after SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

pub type StartHook = Arc<dyn Fn(&Program, u32) -> anyhow::Result<()> + Send + Sync>;
pub type CompleteHook = Arc<dyn Fn(&Program, &Completion) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub pid: u32,
    pub success: bool,
    /// `exit N`, `killed by signal N` or the wait error.
    pub exit: String,
}

#[derive(Debug, Clone)]
pub struct RecorderOptions {
    pub command: CommandSpec,
    pub tz: Tz,
    pub log_dir: Option<PathBuf>,
    /// Timers fire this long before the program starts.
    pub lead: chrono::Duration,
}

impl RecorderOptions {
    pub fn new(command: CommandSpec, tz: Tz) -> Self {
        Self {
            command,
            tz,
            log_dir: None,
            lead: chrono::Duration::seconds(60),
        }
    }
}

type PidTable = Arc<Mutex<HashMap<u32, Program>>>;

/// Cheap, clonable way to push a new schedule into a running invoker.
#[derive(Clone)]
pub struct ScheduleHandle {
    schedule: Arc<Mutex<Option<Schedule>>>,
    reload: Sender<()>,
}

impl ScheduleHandle {
    /// Store `schedule` and ask the worker to rebuild its timers.
    pub fn replace_schedule(&self, schedule: Schedule) {
        *lock(&self.schedule) = Some(schedule);
        let _ = self.reload.send(());
    }
}

pub struct RecorderInvoker {
    worker: WorkerLoop,
    options: RecorderOptions,
    handle: ScheduleHandle,
    reload_rx: Receiver<()>,
    pids: PidTable,
    on_start: Option<StartHook>,
    on_complete: Option<CompleteHook>,
    waiter: Option<JoinHandle<()>>,
}

impl RecorderInvoker {
    pub fn new(options: RecorderOptions) -> Self {
        let (reload, reload_rx) = unbounded();
        Self {
            worker: WorkerLoop::new("recorder-invoker"),
            options,
            handle: ScheduleHandle {
                schedule: Arc::new(Mutex::new(None)),
                reload,
            },
            reload_rx,
            pids: Arc::new(Mutex::new(HashMap::new())),
            on_start: None,
            on_complete: None,
            waiter: None,
        }
    }

    pub fn on_start(mut self, hook: StartHook) -> Self {
        self.on_start = Some(hook);
        self
    }

    pub fn on_complete(mut self, hook: CompleteHook) -> Self {
        self.on_complete = Some(hook);
        self
    }

    pub fn schedule_handle(&self) -> ScheduleHandle {
        self.handle.clone()
    }

    pub fn replace_schedule(&self, schedule: Schedule) {
        self.handle.replace_schedule(schedule);
    }

    /// Snapshot of the children currently being recorded.
    pub fn pids(&self) -> HashMap<u32, Program> {
        lock(&self.pids).clone()
    }

    fn signal_children(&self, kill: bool) {
        for pid in lock(&self.pids).keys() {
            let sent = if kill {
                process::force_kill(*pid)
            } else {
                process::terminate(*pid)
            };
            if let Err(e) = sent {
                warn!(pid, error = %e, "failed to signal recorder");
            }
        }
    }
}

/// State owned by the worker thread.
struct Invoker {
    options: RecorderOptions,
    schedule: Arc<Mutex<Option<Schedule>>>,
    timers: TimerSet,
    pids: PidTable,
    on_start: Option<StartHook>,
    on_complete: Option<CompleteHook>,
    watchdogs: Sender<Option<JoinHandle<()>>>,
}

impl Invoker {
    fn rearm(&mut self) {
        let now = Utc::now().with_timezone(&self.options.tz);
        match lock(&self.schedule).as_ref() {
            Some(schedule) => self.timers.arm(schedule, &now),
            None => return,
        }
        match self.timers.jobs().first() {
            Some(next) => info!(
                armed = self.timers.len(),
                next = %next.program,
                at = %next.fire_at,
                "timers armed"
            ),
            None => info!("schedule is empty, nothing armed"),
        }
    }

    fn next_wait(&self) -> Duration {
        let now = Utc::now().with_timezone(&self.options.tz);
        match self.timers.next_fire() {
            Some(at) => (at - now).to_std().unwrap_or(Duration::ZERO).min(MAX_WAIT),
            None => MAX_WAIT,
        }
    }

    fn fire_due(&mut self) -> anyhow::Result<()> {
        let now = Utc::now().with_timezone(&self.options.tz);
        for job in self.timers.take_due(&now) {
            self.fire(job)?;
        }
        Ok(())
    }

    fn fire(&self, job: TimerJob) -> anyhow::Result<()> {
        let program = job.program;
        let start_ts = job.start.timestamp();
        let args = [
            program.recording_title(),
            program.duration_secs().to_string(),
            start_ts.to_string(),
        ];
        let log = match &self.options.log_dir {
            Some(dir) => ChildLog::Truncate {
                path: dir.join(format!("recorder.{start_ts}.log")),
                header: format!("=> {} {}", job.start.to_rfc3339(), program),
            },
            None => ChildLog::Inherit,
        };

        let child = match process::spawn(&self.options.command, &args, &log) {
            Ok(child) => child,
            Err(e) => {
                error!(title = %program.title(), error = %e, "failed to start recorder");
                return Ok(());
            }
        };
        let pid = child.id();
        info!(pid, title = %program.title(), start = %job.start, "recorder started");

        // Registered before the watchdog exists so the watchdog's removal
        // can never run first.
        lock(&self.pids).insert(pid, program.clone());
        let watchdog = spawn_watchdog(
            child,
            program,
            Arc::clone(&self.pids),
            self.on_start.clone(),
            self.on_complete.clone(),
        );
        let watchdog = match watchdog {
            Ok(handle) => handle,
            Err(e) => {
                lock(&self.pids).remove(&pid);
                let _ = process::terminate(pid);
                return Err(e);
            }
        };
        self.watchdogs
            .send(Some(watchdog))
            .context("watchdog waiter is gone")?;
        Ok(())
    }
}

fn spawn_watchdog(
    mut child: Child,
    program: Program,
    pids: PidTable,
    on_start: Option<StartHook>,
    on_complete: Option<CompleteHook>,
) -> anyhow::Result<JoinHandle<()>> {
    let pid = child.id();
    let handle = std::thread::Builder::new()
        .name(format!("recorder-watchdog-{pid}"))
        .spawn(move || {
            if let Some(hook) = &on_start {
                run_hook("recorder-invoker", "on_start", || hook(&program, pid));
            }
            let completion = match child.wait() {
                Ok(status) => Completion {
                    pid,
                    success: status.success(),
                    exit: process::describe_exit(&status),
                },
                Err(e) => Completion {
                    pid,
                    success: false,
                    exit: format!("wait failed: {e}"),
                },
            };
            lock(&pids).remove(&pid);
            if completion.success {
                info!(pid, title = %program.title(), "recorder finished");
            } else {
                warn!(pid, title = %program.title(), exit = %completion.exit, "recorder failed");
            }
            if let Some(hook) = &on_complete {
                run_hook("recorder-invoker", "on_complete", || hook(&program, &completion));
            }
        })
        .context("failed to start watchdog thread")?;
    Ok(handle)
}

impl Worker for RecorderInvoker {
    fn name(&self) -> &str {
        self.worker.name()
    }

    fn start(&mut self) -> Result<()> {
        if self.worker.state() != WorkerState::Idle {
            return Ok(());
        }

        let (watchdogs, queue) = unbounded::<Option<JoinHandle<()>>>();
        let waiter = std::thread::Builder::new()
            .name("recorder-waiter".into())
            .spawn(move || {
                for handle in queue.iter() {
                    let Some(handle) = handle else { break };
                    if handle.join().is_err() {
                        error!("recorder watchdog panicked");
                    }
                }
            })
            .map_err(|source| crate::error::SchedulerError::ThreadSpawn {
                name: "recorder-waiter".into(),
                source,
            })?;
        self.waiter = Some(waiter);

        let mut invoker = Invoker {
            options: self.options.clone(),
            schedule: Arc::clone(&self.handle.schedule),
            timers: TimerSet::new(self.options.lead),
            pids: Arc::clone(&self.pids),
            on_start: self.on_start.clone(),
            on_complete: self.on_complete.clone(),
            watchdogs,
        };
        let reload = self.reload_rx.clone();

        self.worker.spawn(move |stop| {
            let result = (|| -> anyhow::Result<()> {
                invoker.rearm();
                loop {
                    select! {
                        recv(stop) -> _ => break,
                        recv(reload) -> _ => {
                            invoker.rearm();
                            continue;
                        }
                        default(invoker.next_wait()) => {}
                    }
                    invoker.fire_due()?;
                    if invoker.timers.needs_top_up() {
                        invoker.rearm();
                    }
                }
                Ok(())
            })();
            // The waiter drains what was queued and exits.
            let _ = invoker.watchdogs.send(None);
            result
        })?;
        Ok(())
    }

    fn shutdown(&mut self, mode: ShutdownMode) {
        self.worker.request_stop(mode);
        if mode == ShutdownMode::Immediate {
            self.signal_children(false);
        }
    }

    fn join(&mut self) -> Result<()> {
        let result = self.worker.join();

        if let Some(waiter) = self.waiter.take() {
            if self.worker.shutdown_mode() != Some(ShutdownMode::Immediate) {
                let _ = waiter.join();
                return result;
            }
            // Children spawned between the stop request and the loop exit
            // missed the first signal.
            self.signal_children(false);
            let Some(waiter) = join_within(waiter, TERMINATE_GRACE) else {
                return result;
            };
            warn!("recorders ignored SIGTERM, killing");
            self.signal_children(true);
            if join_within(waiter, TERMINATE_GRACE).is_some() {
                error!("recorder waiter did not finish, detaching it");
            }
        }
        result
    }

    fn running(&self) -> bool {
        self.worker.is_alive() || self.waiter.as_ref().is_some_and(|w| !w.is_finished())
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
    use agrec_core::ClockTime;
    use chrono::{Datelike, Timelike};
    use chrono_tz::Asia::Tokyo;
    use std::time::Instant;
    use tempfile::TempDir;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").with_args(["-c", script, "recorder"])
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

    /// A weekly program starting `secs_ahead` seconds from now, in whole
    /// minutes. Timers fire `lead` before the start.
    fn upcoming(title: &str, minutes_ahead: i64) -> (Program, chrono::DateTime<Tz>) {
        let now = Utc::now().with_timezone(&Tokyo);
        let start = (now + chrono::Duration::minutes(minutes_ahead))
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap();
        let day = start.weekday().num_days_from_sunday() as u8;
        let begin = ClockTime::new(start.hour() as u8, start.minute() as u8).unwrap();
        let program = Program::new(day, begin, begin, title).unwrap();
        (program, start)
    }

    fn options(script: &str, lead_minutes: i64, log_dir: Option<PathBuf>) -> RecorderOptions {
        RecorderOptions {
            log_dir,
            lead: chrono::Duration::minutes(lead_minutes),
            ..RecorderOptions::new(sh(script), Tokyo)
        }
    }

    #[test]
    fn fires_recorder_with_title_duration_and_start() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("args");
        let (program, start) = upcoming("Foo", 3);
        // Lead of 10 minutes puts the fire time in the past: fires at once.
        let script = format!("echo \"$1|$2|$3\" > {}", out.display());
        let completed = Arc::new(Mutex::new(Vec::new()));
        let sink = completed.clone();

        let mut invoker = RecorderInvoker::new(options(&script, 10, Some(dir.path().into())))
            .on_complete(Arc::new(move |p: &Program, c: &Completion| -> anyhow::Result<()> {
                sink.lock().unwrap().push((p.title().to_string(), c.success));
                Ok(())
            }));
        invoker.replace_schedule(Schedule::from_programs([program]));
        invoker.start().unwrap();

        assert!(wait_until(Duration::from_secs(10), || !completed.lock().unwrap().is_empty()));
        invoker.shutdown(ShutdownMode::Graceful);
        invoker.join().unwrap();

        let args = std::fs::read_to_string(&out).unwrap();
        // Start == end wraps to a full day.
        assert_eq!(args.trim(), format!("Foo|86400|{}", start.timestamp()));
        assert_eq!(*completed.lock().unwrap(), [("Foo".to_string(), true)]);

        let log = dir.path().join(format!("recorder.{}.log", start.timestamp()));
        let header = std::fs::read_to_string(log).unwrap();
        assert!(header.starts_with("=> "));
        assert!(!invoker.running());
    }

    #[test]
    fn reload_replaces_pending_timers() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("fired");
        let script = format!("echo \"$1\" >> {}", out.display());
        let (old, _) = upcoming("Old", 30);
        let (new, _) = upcoming("New", 3);

        let mut invoker = RecorderInvoker::new(options(&script, 10, None));
        invoker.start().unwrap();
        // Old fires 20 minutes from now; it must be gone before then.
        invoker.replace_schedule(Schedule::from_programs([old]));
        invoker.replace_schedule(Schedule::from_programs([new]));

        assert!(wait_until(Duration::from_secs(10), || out.exists()));
        invoker.shutdown(ShutdownMode::Graceful);
        invoker.join().unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "New\n");
    }

    #[test]
    fn graceful_shutdown_waits_for_running_recorders() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("done");
        let script = format!("sleep 1; touch {}", out.display());
        let (program, _) = upcoming("Foo", 3);

        let mut invoker = RecorderInvoker::new(options(&script, 10, None));
        invoker.replace_schedule(Schedule::from_programs([program]));
        invoker.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || !invoker.pids().is_empty()));

        invoker.shutdown(ShutdownMode::Graceful);
        invoker.join().unwrap();
        assert!(out.exists(), "recorder was not allowed to finish");
        assert!(invoker.pids().is_empty());
        assert_eq!(invoker.state(), WorkerState::Stopped);
    }

    #[test]
    fn immediate_shutdown_terminates_recorders() {
        let (program, _) = upcoming("Foo", 3);
        let mut invoker = RecorderInvoker::new(options("sleep 30", 10, None));
        let started = Arc::new(Mutex::new(Vec::new()));
        let sink = started.clone();
        invoker = invoker.on_start(Arc::new(move |_: &Program, pid: u32| -> anyhow::Result<()> {
            sink.lock().unwrap().push(pid);
            Ok(())
        }));
        invoker.replace_schedule(Schedule::from_programs([program]));
        invoker.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || !invoker.pids().is_empty()));

        let began = Instant::now();
        invoker.shutdown(ShutdownMode::Immediate);
        invoker.join().unwrap();
        assert!(began.elapsed() < Duration::from_secs(10));
        assert!(invoker.pids().is_empty());
        assert_eq!(started.lock().unwrap().len(), 1);
        assert!(!invoker.running());
    }

    #[test]
    fn start_is_idempotent() {
        let mut invoker = RecorderInvoker::new(options("true", 1, None));
        invoker.start().unwrap();
        invoker.start().unwrap();
        assert!(invoker.running());
        invoker.shutdown(ShutdownMode::Graceful);
        invoker.join().unwrap();
        assert_eq!(invoker.state(), WorkerState::Stopped);
    }
}
