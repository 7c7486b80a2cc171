//! Timetable sources.
//!
//! Scraping the broadcaster's markup happens upstream; these sources read
//! the already-structured schedule document (YAML or JSON) from a file or
//! an HTTP endpoint.

use crate::error::{AgrecError, Result};
use crate::schedule::Schedule;
use std::path::PathBuf;
use std::time::Duration;

/// Anything that can produce a fresh [`Schedule`].
pub trait TimetableSource: Send {
    fn fetch(&self) -> Result<Schedule>;

    /// Short description used in log lines.
    fn describe(&self) -> String;
}

/// Build a source from a config value: `http(s)://` URLs are fetched,
/// anything else is treated as a file path.
pub fn from_location(location: &str) -> Box<dyn TimetableSource> {
    if location.starts_with("http://") || location.starts_with("https://") {
        Box::new(HttpSource::new(location))
    } else {
        Box::new(FileSource::new(location))
    }
}

fn parse_document(body: &str, origin: &str) -> Result<Schedule> {
    let trimmed = body.trim_start();
    let parsed = if trimmed.starts_with('{') {
        serde_json::from_str::<Schedule>(trimmed)
            .map_err(|e| AgrecError::Parse(format!("{origin}: {e}")))
    } else {
        serde_yaml::from_str::<Schedule>(body)
            .map_err(|e| AgrecError::Parse(format!("{origin}: {e}")))
    };
    parsed
}

// ---------------------------------------------------------------------------
// FileSource
// ---------------------------------------------------------------------------

pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TimetableSource for FileSource {
    fn fetch(&self) -> Result<Schedule> {
        let body = std::fs::read_to_string(&self.path)?;
        parse_document(&body, &self.path.display().to_string())
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

// ---------------------------------------------------------------------------
// HttpSource
// ---------------------------------------------------------------------------

pub struct HttpSource {
    url: String,
    timeout: Duration,
}

impl HttpSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl TimetableSource for HttpSource {
    fn fetch(&self) -> Result<Schedule> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;
        let body = client.get(&self.url).send()?.error_for_status()?.text()?;
        parse_document(&body, &self.url)
    }

    fn describe(&self) -> String {
        format!("url {}", self.url)
    }
}
