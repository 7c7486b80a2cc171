use crate::error::Result;
use crate::worker::{run_hook, ShutdownMode, Worker, WorkerLoop, WorkerState};
use agrec_core::source::TimetableSource;
use agrec_core::Schedule;
use crossbeam_channel::select;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub type UpdateHook = Arc<dyn Fn(&Schedule) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct UpdaterTiming {
    pub first_fetch: Duration,
    pub interval: Duration,
    /// Upper bound of the random delay added to every interval.
    pub jitter: Duration,
}

impl Default for UpdaterTiming {
    fn default() -> Self {
        Self {
            first_fetch: Duration::from_secs(1),
            interval: Duration::from_secs(1800),
            jitter: Duration::from_secs(120),
        }
    }
}

/// Periodically refetches the timetable and reports changes.
pub struct TimetableUpdater {
    worker: WorkerLoop,
    source: Option<Box<dyn TimetableSource>>,
    timing: UpdaterTiming,
    on_update: Option<UpdateHook>,
}

impl TimetableUpdater {
    pub fn new(source: Box<dyn TimetableSource>, timing: UpdaterTiming) -> Self {
        Self {
            worker: WorkerLoop::new("timetable-updater"),
            source: Some(source),
            timing,
            on_update: None,
        }
    }

    /// Called on the updater thread whenever a fetched schedule differs
    /// from the previous one.
    pub fn on_update(mut self, hook: UpdateHook) -> Self {
        self.on_update = Some(hook);
        self
    }
}

fn jittered(base: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return base;
    }
    let extra = rand::thread_rng().gen_range(0..=jitter.as_millis() as u64);
    base + Duration::from_millis(extra)
}

impl Worker for TimetableUpdater {
    fn name(&self) -> &str {
        self.worker.name()
    }

    fn start(&mut self) -> Result<()> {
        let Some(source) = self.source.take() else {
            return Ok(());
        };
        let timing = self.timing;
        let hook = self.on_update.clone();
        let name = self.worker.name().to_string();

        self.worker.spawn(move |stop| {
            info!(source = %source.describe(), "timetable updater started");
            let mut current: Option<Schedule> = None;
            let mut wait = timing.first_fetch;
            loop {
                select! {
                    recv(stop) -> _ => break,
                    default(wait) => {}
                }

                match source.fetch() {
                    Ok(schedule) if current.as_ref() == Some(&schedule) => {
                        debug!("timetable unchanged");
                    }
                    Ok(schedule) => {
                        info!(programs = schedule.program_count(), "timetable updated");
                        if let Some(hook) = &hook {
                            run_hook(&name, "on_update", || hook(&schedule));
                        }
                        current = Some(schedule);
                    }
                    Err(e) => warn!(error = %e, "timetable fetch failed, keeping previous schedule"),
                }
                wait = jittered(timing.interval, timing.jitter);
            }
            Ok(())
        })?;
        Ok(())
    }

    fn shutdown(&mut self, mode: ShutdownMode) {
        self.worker.request_stop(mode);
    }

    fn join(&mut self) -> Result<()> {
        self.worker.join()
    }

    fn running(&self) -> bool {
        self.worker.is_alive()
    }

    fn state(&self) -> WorkerState {
        self.worker.state()
    }
}
