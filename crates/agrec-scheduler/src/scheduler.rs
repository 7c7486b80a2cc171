//! Composes the three workers and drives their lifecycle from control
//! events.

use crate::cleanup::{CleanupHandle, CleanupInvoker, CleanupOptions};
use crate::error::{Result, SchedulerError};
use crate::recorder::{Completion, RecorderInvoker, RecorderOptions};
use crate::signals::ControlEvent;
use crate::updater::{TimetableUpdater, UpdaterTiming};
use crate::worker::{ShutdownMode, Worker};
use agrec_core::config::{CommandSpec, Config};
use agrec_core::source::TimetableSource;
use agrec_core::{Program, Schedule};
use chrono_tz::Tz;
use crossbeam_channel::{never, select, Receiver};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub tz: Tz,
    pub log_dir: Option<PathBuf>,
    pub recorder: CommandSpec,
    pub cleanup: CommandSpec,
    pub timetable: UpdaterTiming,
    pub cleanup_margin: Duration,
    pub cleanup_jitter: Duration,
}

impl SchedulerOptions {
    /// Options from `config`. `cleanup` is the command that runs one
    /// coordinator pass when the config does not name one.
    pub fn from_config(config: &Config, cleanup: CommandSpec) -> agrec_core::Result<Self> {
        Ok(Self {
            tz: config.tz()?,
            log_dir: config.log_dir.clone(),
            recorder: config.recorder_command()?.clone(),
            cleanup: config.cleanup.clone().unwrap_or(cleanup),
            timetable: UpdaterTiming {
                interval: config.timetable_interval(),
                jitter: config.timetable_jitter(),
                ..UpdaterTiming::default()
            },
            cleanup_margin: config.cleanup_margin(),
            cleanup_jitter: config.cleanup_jitter(),
        })
    }
}

/// How [`Scheduler::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Stopped,
    /// A replacement instance was started before shutting down.
    Restarted,
}

/// Starts the replacement instance on restart, returning its pid.
pub type Respawn = Arc<dyn Fn() -> std::io::Result<u32> + Send + Sync>;

pub struct Scheduler {
    workers: Vec<Box<dyn Worker>>,
    cleanup: CleanupHandle,
    respawn: Respawn,
}

impl Scheduler {
    pub fn new(options: SchedulerOptions, source: Box<dyn TimetableSource>) -> Self {
        let cleanup = CleanupInvoker::new(CleanupOptions {
            command: options.cleanup.clone(),
            log_dir: options.log_dir.clone(),
            margin: options.cleanup_margin,
            jitter: options.cleanup_jitter,
        });
        let cleanup_handle = cleanup.handle();

        let on_complete = cleanup.handle();
        let recorder = RecorderInvoker::new(RecorderOptions {
            log_dir: options.log_dir.clone(),
            ..RecorderOptions::new(options.recorder.clone(), options.tz)
        })
        .on_start(Arc::new(|program: &Program, pid: u32| -> anyhow::Result<()> {
            info!(pid, title = %program.title(), "recording");
            Ok(())
        }))
        .on_complete(Arc::new(
            move |program: &Program, done: &Completion| -> anyhow::Result<()> {
                info!(title = %program.title(), exit = %done.exit, "recording finished, requesting cleanup");
                on_complete.request();
                Ok(())
            },
        ));

        let schedule = recorder.schedule_handle();
        let updater = TimetableUpdater::new(source, options.timetable).on_update(Arc::new(
            move |s: &Schedule| -> anyhow::Result<()> {
                schedule.replace_schedule(s.clone());
                Ok(())
            },
        ));

        let workers: Vec<Box<dyn Worker>> = vec![
            Box::new(updater) as Box<dyn Worker>,
            Box::new(recorder) as Box<dyn Worker>,
            Box::new(cleanup) as Box<dyn Worker>,
        ];
        Self {
            workers,
            cleanup: cleanup_handle,
            respawn: Arc::new(respawn),
        }
    }

    /// Replace how a restart starts the new instance. Defaults to
    /// re-executing the current binary with the same arguments.
    pub fn with_respawn(mut self, respawn: Respawn) -> Self {
        self.respawn = respawn;
        self
    }

    fn start_all(&mut self) -> Result<()> {
        for worker in &mut self.workers {
            worker.start()?;
            info!(worker = worker.name(), "worker started");
        }
        Ok(())
    }

    fn shutdown_all(&mut self, mode: ShutdownMode) {
        info!(?mode, "shutting down workers");
        for worker in &mut self.workers {
            worker.shutdown(mode);
        }
    }

    fn all_stopped(&self) -> bool {
        self.workers.iter().all(|w| !w.running())
    }

    fn join_all(&mut self) -> Result<()> {
        let mut first_err = None;
        for worker in &mut self.workers {
            if let Err(e) = worker.join() {
                error!(worker = worker.name(), error = %e, "worker ended with an error");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Start every worker and block until shutdown completes.
    ///
    /// Workers are polled rather than joined so that a second stop event
    /// can still escalate while recordings drain. A worker that stops on
    /// its own brings the rest down and is reported as an error, ahead of
    /// whatever its join returns.
    pub fn run(mut self, events: Receiver<ControlEvent>) -> Result<Exit> {
        if let Err(e) = self.start_all() {
            self.shutdown_all(ShutdownMode::Graceful);
            let _ = self.join_all();
            return Err(e);
        }
        self.cleanup.request();

        let mut events = events;
        let mut draining = false;
        let mut exit = Exit::Stopped;
        let mut failure: Option<SchedulerError> = None;

        loop {
            let received = select! {
                recv(events) -> msg => Some(msg),
                default(TICK) => None,
            };
            let event = match received {
                Some(Ok(event)) => Some(event),
                Some(Err(_)) => {
                    // Nobody can send any more; keep ticking.
                    events = never();
                    None
                }
                None => None,
            };

            match event {
                Some(ControlEvent::Stop) if !draining => {
                    info!("stopping");
                    self.shutdown_all(ShutdownMode::Graceful);
                    draining = true;
                }
                Some(ControlEvent::Terminate) => {
                    info!("terminating");
                    self.shutdown_all(ShutdownMode::Immediate);
                    draining = true;
                }
                Some(ControlEvent::Restart) if !draining => {
                    info!("restarting");
                    self.shutdown_all(ShutdownMode::Graceful);
                    draining = true;
                    match (self.respawn)() {
                        Ok(pid) => {
                            info!(pid, "replacement started");
                            exit = Exit::Restarted;
                        }
                        Err(e) => error!(error = %e, "failed to start replacement"),
                    }
                }
                Some(event) => warn!(?event, "already shutting down"),
                None => {}
            }

            if !draining {
                if let Some(worker) = self.workers.iter().find(|w| !w.running()) {
                    let name = worker.name().to_string();
                    error!(worker = %name, "worker stopped unexpectedly");
                    failure = Some(SchedulerError::WorkerStopped(name));
                    self.shutdown_all(ShutdownMode::Graceful);
                    draining = true;
                }
            }

            if draining && self.all_stopped() {
                break;
            }
        }

        let joined = self.join_all();
        info!("all workers stopped");
        match (failure, joined) {
            (Some(e), _) => Err(e),
            (None, Err(e)) => Err(e),
            (None, Ok(())) => Ok(exit),
        }
    }
}

/// Start a fresh instance of this executable with the same arguments.
fn respawn() -> std::io::Result<u32> {
    let exe = std::env::current_exe()?;
    let child = Command::new(exe).args(std::env::args_os().skip(1)).spawn()?;
    Ok(child.id())
}
