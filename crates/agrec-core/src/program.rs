use crate::error::{AgrecError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ClockTime
// ---------------------------------------------------------------------------

/// Wall-clock time of day as published by the timetable.
///
/// Hours may exceed 23: broadcast timetables list late-night programs under
/// the previous day (e.g. `25:30` is 01:30 the next morning).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClockTime {
    hour: u8,
    minute: u8,
}

impl ClockTime {
    pub fn new(hour: u8, minute: u8) -> Result<Self> {
        if minute > 59 || hour > 47 {
            return Err(AgrecError::InvalidProgram(format!(
                "time {hour}:{minute:02} is out of range"
            )));
        }
        Ok(Self { hour, minute })
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }

    /// Minutes since midnight of the program's listed day.
    pub fn minutes(&self) -> i64 {
        i64::from(self.hour) * 60 + i64::from(self.minute)
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl TryFrom<String> for ClockTime {
    type Error = AgrecError;

    fn try_from(value: String) -> Result<Self> {
        let (h, m) = value
            .trim()
            .split_once(':')
            .ok_or_else(|| AgrecError::Parse(format!("time '{value}' doesn't match HH:MM")))?;
        let hour = h
            .parse::<u8>()
            .map_err(|_| AgrecError::Parse(format!("bad hour in '{value}'")))?;
        let minute = m
            .parse::<u8>()
            .map_err(|_| AgrecError::Parse(format!("bad minute in '{value}'")))?;
        ClockTime::new(hour, minute)
    }
}

impl From<ClockTime> for String {
    fn from(value: ClockTime) -> Self {
        value.to_string()
    }
}

// ---------------------------------------------------------------------------
// Program
// ---------------------------------------------------------------------------

/// One entry of the weekly timetable.
///
/// Immutable once constructed; equality is by value so two fetched
/// schedules can be diffed directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawProgram")]
pub struct Program {
    day: u8,
    starts_at: ClockTime,
    ends_at: ClockTime,
    title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    personality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    link: Option<String>,
    #[serde(default)]
    repeat: bool,
    #[serde(default)]
    live: bool,
    #[serde(default)]
    video: bool,
}

#[derive(Deserialize)]
struct RawProgram {
    day: u8,
    starts_at: ClockTime,
    ends_at: ClockTime,
    title: String,
    #[serde(default)]
    personality: Option<String>,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    repeat: bool,
    #[serde(default)]
    live: bool,
    #[serde(default)]
    video: bool,
}

impl TryFrom<RawProgram> for Program {
    type Error = AgrecError;

    fn try_from(raw: RawProgram) -> Result<Self> {
        Ok(Program::new(raw.day, raw.starts_at, raw.ends_at, raw.title)?
            .with_personality(raw.personality)
            .with_link(raw.link)
            .with_flags(raw.repeat, raw.live, raw.video))
    }
}

impl Program {
    /// `day` counts from Sunday (0) to Saturday (6).
    pub fn new(
        day: u8,
        starts_at: ClockTime,
        ends_at: ClockTime,
        title: impl Into<String>,
    ) -> Result<Self> {
        let title = title.into();
        if day > 6 {
            return Err(AgrecError::InvalidProgram(format!(
                "day {day} is not a weekday number (0-6)"
            )));
        }
        // The source pads titles with ideographic spaces as well as ASCII ones.
        if title.chars().all(|c| c.is_whitespace() || c == '\u{3000}') {
            return Err(AgrecError::InvalidProgram("title is not present".into()));
        }
        Ok(Self {
            day,
            starts_at,
            ends_at,
            title,
            personality: None,
            link: None,
            repeat: false,
            live: false,
            video: false,
        })
    }

    pub fn with_personality(mut self, personality: Option<String>) -> Self {
        self.personality = personality;
        self
    }

    pub fn with_link(mut self, link: Option<String>) -> Self {
        self.link = link;
        self
    }

    pub fn with_flags(mut self, repeat: bool, live: bool, video: bool) -> Self {
        self.repeat = repeat;
        self.live = live;
        self.video = video;
        self
    }

    pub fn day(&self) -> u8 {
        self.day
    }

    pub fn starts_at(&self) -> ClockTime {
        self.starts_at
    }

    pub fn ends_at(&self) -> ClockTime {
        self.ends_at
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn personality(&self) -> Option<&str> {
        self.personality.as_deref()
    }

    pub fn link(&self) -> Option<&str> {
        self.link.as_deref()
    }

    pub fn is_repeat(&self) -> bool {
        self.repeat
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn has_video(&self) -> bool {
        self.video
    }

    /// Length in minutes. A program ending at or before its start runs past
    /// midnight.
    pub fn duration(&self) -> i64 {
        let span = self.ends_at.minutes() - self.starts_at.minutes();
        if span <= 0 {
            span + 24 * 60
        } else {
            span
        }
    }

    pub fn duration_secs(&self) -> i64 {
        self.duration() * 60
    }

    /// Title handed to the recorder; rebroadcasts are kept apart from the
    /// first airing.
    pub fn recording_title(&self) -> String {
        if self.repeat {
            format!("{}-repeat", self.title)
        } else {
            self.title.clone()
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}-{}{}]",
            self.title,
            self.starts_at,
            self.ends_at,
            if self.repeat { ", repeat" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u8, m: u8) -> ClockTime {
        ClockTime::new(h, m).unwrap()
    }

    #[test]
    fn blank_title_is_rejected() {
        assert!(Program::new(1, t(10, 0), t(10, 30), "  \u{3000} ").is_err());
    }

    #[test]
    fn day_out_of_range_is_rejected() {
        assert!(Program::new(7, t(10, 0), t(10, 30), "Show").is_err());
    }

    #[test]
    fn duration_handles_midnight_wrap() {
        let p = Program::new(1, t(23, 30), t(0, 30), "Late").unwrap();
        assert_eq!(p.duration(), 60);
        assert_eq!(p.duration_secs(), 3600);

        let p = Program::new(1, t(24, 0), t(25, 30), "Later").unwrap();
        assert_eq!(p.duration(), 90);
    }

    #[test]
    fn repeat_programs_get_suffixed_title() {
        let p = Program::new(2, t(12, 0), t(12, 30), "Foo")
            .unwrap()
            .with_flags(true, false, false);
        assert_eq!(p.recording_title(), "Foo-repeat");
    }

    #[test]
    fn clock_time_parses_and_prints() {
        let ct = ClockTime::try_from("25:05".to_string()).unwrap();
        assert_eq!(ct.hour(), 25);
        assert_eq!(ct.to_string(), "25:05");
        assert!(ClockTime::try_from("noon".to_string()).is_err());
        assert!(ClockTime::try_from("10:75".to_string()).is_err());
    }

    #[test]
    fn deserialize_validates_title() {
        let yaml = "day: 1\nstarts_at: '10:00'\nends_at: '10:30'\ntitle: ''\n";
        assert!(serde_yaml::from_str::<Program>(yaml).is_err());

        let yaml = "day: 1\nstarts_at: '10:00'\nends_at: '10:30'\ntitle: Foo\nlive: true\n";
        let p: Program = serde_yaml::from_str(yaml).unwrap();
        assert!(p.is_live());
        assert!(!p.is_repeat());
    }
}
