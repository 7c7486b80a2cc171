use agrec_core::{Program, Schedule};
use chrono::{DateTime, Duration};
use chrono_tz::Tz;

/// How many upcoming airings are armed at once.
pub const LOOKAHEAD: usize = 20;
/// Re-arm from the schedule when fewer timers than this remain.
pub const TOP_UP_BELOW: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerJob {
    pub fire_at: DateTime<Tz>,
    pub start: DateTime<Tz>,
    pub program: Program,
}

/// Armed one-shot timers, ordered by fire time.
///
/// Arming always replaces the whole set. A high-water mark over fired start
/// times keeps a program whose timer already fired from being armed again
/// before it has started.
#[derive(Debug, Clone)]
pub struct TimerSet {
    lead: Duration,
    jobs: Vec<TimerJob>,
    fired_through: Option<DateTime<Tz>>,
}

impl TimerSet {
    pub fn new(lead: Duration) -> Self {
        Self {
            lead,
            jobs: Vec::new(),
            fired_through: None,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn needs_top_up(&self) -> bool {
        self.jobs.len() < TOP_UP_BELOW
    }

    pub fn jobs(&self) -> &[TimerJob] {
        &self.jobs
    }

    /// Drop every armed timer and arm the next airings of `schedule`.
    pub fn arm(&mut self, schedule: &Schedule, now: &DateTime<Tz>) {
        let from = match &self.fired_through {
            Some(fired) if *fired >= *now => *fired + Duration::seconds(1),
            _ => *now,
        };
        self.jobs = schedule
            .take(LOOKAHEAD, &from)
            .into_iter()
            .map(|(start, program)| TimerJob {
                fire_at: start - self.lead,
                start,
                program,
            })
            .collect();
        self.jobs.sort_by(|a, b| a.fire_at.cmp(&b.fire_at));
    }

    pub fn next_fire(&self) -> Option<DateTime<Tz>> {
        self.jobs.first().map(|j| j.fire_at)
    }

    /// Remove and return every timer due at `now`.
    pub fn take_due(&mut self, now: &DateTime<Tz>) -> Vec<TimerJob> {
        let split = self.jobs.partition_point(|j| j.fire_at <= *now);
        let due: Vec<TimerJob> = self.jobs.drain(..split).collect();
        if let Some(last) = due.iter().map(|j| j.start).max() {
            self.fired_through = Some(self.fired_through.map_or(last, |f| f.max(last)));
        }
        due
    }
}
