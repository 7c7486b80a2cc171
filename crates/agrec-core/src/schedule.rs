use crate::error::{AgrecError, Result};
use crate::program::Program;
use chrono::{DateTime, Datelike, Duration, TimeZone};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The weekly timetable: weekday (0 = Sunday) → programs ordered by start.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "ScheduleDoc")]
pub struct Schedule {
    days: BTreeMap<u8, Vec<Program>>,
}

#[derive(Deserialize)]
struct ScheduleDoc {
    #[serde(default)]
    days: BTreeMap<u8, Vec<Program>>,
}

impl TryFrom<ScheduleDoc> for Schedule {
    type Error = AgrecError;

    fn try_from(doc: ScheduleDoc) -> Result<Self> {
        for (day, programs) in &doc.days {
            if let Some(p) = programs.iter().find(|p| p.day() != *day) {
                return Err(AgrecError::Parse(format!(
                    "program '{}' listed under day {day} but declares day {}",
                    p.title(),
                    p.day()
                )));
            }
        }
        Ok(Schedule::new(doc.days))
    }
}

impl Schedule {
    pub fn new(mut days: BTreeMap<u8, Vec<Program>>) -> Self {
        for programs in days.values_mut() {
            programs.sort_by_key(|p| p.starts_at());
        }
        days.retain(|_, programs| !programs.is_empty());
        Self { days }
    }

    pub fn from_programs(programs: impl IntoIterator<Item = Program>) -> Self {
        let mut days: BTreeMap<u8, Vec<Program>> = BTreeMap::new();
        for p in programs {
            days.entry(p.day()).or_default().push(p);
        }
        Self::new(days)
    }

    pub fn days(&self) -> &BTreeMap<u8, Vec<Program>> {
        &self.days
    }

    pub fn program_count(&self) -> usize {
        self.days.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    /// The next `n` airings at or after `from`, in start order.
    ///
    /// Walks forward day by day in `from`'s timezone, starting the day
    /// before `from`'s calendar date so that late-night entries listed
    /// under the previous weekday (`25:00` and later) are seen. Programs
    /// that already started are skipped. Returns fewer than `n` pairs only
    /// when the schedule is empty.
    pub fn take<Tz: TimeZone>(&self, n: usize, from: &DateTime<Tz>) -> Vec<(DateTime<Tz>, Program)> {
        if n == 0 || self.is_empty() {
            return Vec::new();
        }

        let tz = from.timezone();
        let first_day = from.date_naive();
        let mut out: Vec<(DateTime<Tz>, Program)> = Vec::new();
        let mut settled = false;

        // Late-night entries (hour >= 24) can sort before the next day's
        // early ones, so walk one extra day past the point where `n` is met.
        for offset in -1..(7 * (n as i64 + 2)) {
            let date = first_day + Duration::days(offset);
            let weekday = date.weekday().num_days_from_sunday() as u8;
            let Some(midnight) = date.and_hms_opt(0, 0, 0) else {
                continue;
            };

            for program in self.days.get(&weekday).into_iter().flatten() {
                let local = midnight + Duration::minutes(program.starts_at().minutes());
                let Some(at) = tz.from_local_datetime(&local).earliest() else {
                    continue;
                };
                if at < *from {
                    continue;
                }
                out.push((at, program.clone()));
            }

            if out.len() >= n {
                if settled {
                    break;
                }
                settled = true;
            }
        }

        out.sort_by(|a, b| a.0.cmp(&b.0));
        out.truncate(n);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::ClockTime;
    use chrono::Timelike;
    use chrono_tz::Asia::Tokyo;

    fn prog(day: u8, h: u8, m: u8, title: &str) -> Program {
        let start = ClockTime::new(h, m).unwrap();
        let end = ClockTime::new(h, m + 30).unwrap();
        Program::new(day, start, end, title).unwrap()
    }

    fn weekly() -> Schedule {
        let mut programs = Vec::new();
        for day in 0..7u8 {
            programs.push(prog(day, 9, 0, &format!("morning-{day}")));
            programs.push(prog(day, 21, 0, &format!("night-{day}")));
            programs.push(prog(day, 12, 0, &format!("noon-{day}")));
        }
        Schedule::from_programs(programs)
    }

    #[test]
    fn take_returns_exactly_n_in_order() {
        let schedule = weekly();
        // 2024-01-01 is a Monday.
        let from = Tokyo.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let jobs = schedule.take(20, &from);
        assert_eq!(jobs.len(), 20);
        for pair in jobs.windows(2) {
            assert!(pair[0].0 <= pair[1].0);
        }
        for (at, program) in &jobs {
            assert_eq!(at.hour(), u32::from(program.starts_at().hour()));
            assert_eq!(at.minute(), u32::from(program.starts_at().minute()));
            assert_eq!(
                at.weekday().num_days_from_sunday() as u8,
                program.day()
            );
        }
    }

    #[test]
    fn take_skips_started_programs_on_first_day() {
        let schedule = weekly();
        let from = Tokyo.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let jobs = schedule.take(2, &from);
        assert_eq!(jobs[0].1.title(), "noon-1");
        assert_eq!(jobs[1].1.title(), "night-1");
    }

    #[test]
    fn take_includes_program_starting_exactly_now() {
        let schedule = weekly();
        let from = Tokyo.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(schedule.take(1, &from)[0].1.title(), "noon-1");
    }

    #[test]
    fn take_wraps_across_the_week() {
        let schedule = Schedule::from_programs(vec![prog(1, 9, 0, "monday-only")]);
        // Tuesday: the next airing is six days later.
        let from = Tokyo.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let jobs = schedule.take(2, &from);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].0, Tokyo.with_ymd_and_hms(2024, 1, 8, 9, 0, 0).unwrap());
        assert_eq!(jobs[1].0, Tokyo.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap());
    }

    #[test]
    fn late_night_hours_roll_into_next_day() {
        let late = Program::new(
            1,
            ClockTime::new(25, 0).unwrap(),
            ClockTime::new(25, 30).unwrap(),
            "late",
        )
        .unwrap();
        let schedule = Schedule::from_programs(vec![late]);
        let from = Tokyo.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let jobs = schedule.take(1, &from);
        assert_eq!(jobs[0].0, Tokyo.with_ymd_and_hms(2024, 1, 2, 1, 0, 0).unwrap());
    }

    #[test]
    fn late_night_entry_of_previous_day_is_taken_after_midnight() {
        let late = prog(1, 25, 0, "late");
        let schedule = Schedule::from_programs(vec![late]);
        // Tuesday 00:30: Monday's 25:00 airs in half an hour.
        let from = Tokyo.with_ymd_and_hms(2024, 1, 2, 0, 30, 0).unwrap();
        let jobs = schedule.take(2, &from);
        assert_eq!(jobs[0].0, Tokyo.with_ymd_and_hms(2024, 1, 2, 1, 0, 0).unwrap());
        assert_eq!(jobs[1].0, Tokyo.with_ymd_and_hms(2024, 1, 9, 1, 0, 0).unwrap());

        // Once it has started the next airing is a week out.
        let from = Tokyo.with_ymd_and_hms(2024, 1, 2, 1, 0, 1).unwrap();
        assert_eq!(
            schedule.take(1, &from)[0].0,
            Tokyo.with_ymd_and_hms(2024, 1, 9, 1, 0, 0).unwrap()
        );
    }

    #[test]
    fn empty_schedule_takes_nothing() {
        let from = Tokyo.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(Schedule::default().take(5, &from).is_empty());
    }

    #[test]
    fn equality_is_by_value() {
        assert_eq!(weekly(), weekly());
        let mut programs: Vec<Program> = weekly().days().values().flatten().cloned().collect();
        programs.pop();
        assert_ne!(weekly(), Schedule::from_programs(programs));
    }

    #[test]
    fn deserialize_rejects_day_mismatch() {
        let yaml = "days:\n  1:\n    - day: 2\n      starts_at: '10:00'\n      ends_at: '10:30'\n      title: Foo\n";
        assert!(serde_yaml::from_str::<Schedule>(yaml).is_err());
    }
}
