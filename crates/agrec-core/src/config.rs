use crate::error::{AgrecError, Result};
use crate::process;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "agrec.yaml";

// ---------------------------------------------------------------------------
// StoreConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root of the shared bucket (a directory visible to every host).
    #[serde(default)]
    pub bucket: Option<PathBuf>,
    /// Key prefix under which every program lives.
    #[serde(default)]
    pub prefix: String,
}

// ---------------------------------------------------------------------------
// CommandSpec
// ---------------------------------------------------------------------------

/// An external program plus fixed leading arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    /// Shortens every interval; meant for local runs.
    #[serde(default)]
    pub debug: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default)]
    pub store: StoreConfig,
    /// File path or http(s) URL of the schedule document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timetable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorder: Option<CommandSpec>,
    /// Defaults to this executable's `cleanup` subcommand.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CommandSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiescence_secs: Option<u64>,
}

fn default_timezone() -> String {
    "Asia/Tokyo".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            log_dir: None,
            debug: false,
            hostname: None,
            store: StoreConfig::default(),
            timetable: None,
            recorder: None,
            cleanup: None,
            quiescence_secs: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    /// Load `path` when given, otherwise start from defaults, then apply
    /// `AGREC_*` environment overrides.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::load(p)?,
            None => Self::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("AGREC_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("AGREC_DEBUG") {
            self.debug = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = lookup("AGREC_HOSTNAME") {
            self.hostname = Some(v);
        }
        if let Some(v) = lookup("AGREC_STORE_BUCKET") {
            self.store.bucket = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("AGREC_STORE_PREFIX") {
            self.store.prefix = v;
        }
        if let Some(v) = lookup("AGREC_TIMETABLE") {
            self.timetable = Some(v);
        }
        if let Some(v) = lookup("AGREC_TIMEZONE") {
            self.timezone = v;
        }
    }

    // -----------------------------------------------------------------------
    // Required settings
    // -----------------------------------------------------------------------

    /// Fails when no bucket is configured; nothing can coordinate without one.
    pub fn validate_store(&self) -> Result<()> {
        self.bucket().map(|_| ())
    }

    pub fn bucket(&self) -> Result<&Path> {
        self.store.bucket.as_deref().ok_or_else(|| {
            AgrecError::Config("store.bucket is required (or set AGREC_STORE_BUCKET)".into())
        })
    }

    pub fn timetable_location(&self) -> Result<&str> {
        self.timetable.as_deref().ok_or_else(|| {
            AgrecError::Config("timetable is required (or set AGREC_TIMETABLE)".into())
        })
    }

    pub fn recorder_command(&self) -> Result<&CommandSpec> {
        self.recorder
            .as_ref()
            .ok_or_else(|| AgrecError::Config("recorder.program is required".into()))
    }

    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| AgrecError::UnknownTimezone(self.timezone.clone()))
    }

    pub fn key_prefix(&self) -> &str {
        self.store.prefix.trim_end_matches('/')
    }

    pub fn hostname(&self) -> String {
        self.hostname
            .clone()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(process::system_hostname)
    }

    // -----------------------------------------------------------------------
    // Intervals
    // -----------------------------------------------------------------------

    pub fn timetable_interval(&self) -> Duration {
        Duration::from_secs(if self.debug { 300 } else { 1800 })
    }

    pub fn timetable_jitter(&self) -> Duration {
        Duration::from_secs(120)
    }

    pub fn cleanup_margin(&self) -> Duration {
        Duration::from_secs(if self.debug { 5 } else { 530 })
    }

    pub fn cleanup_jitter(&self) -> Duration {
        Duration::from_secs(if self.debug { 0 } else { 60 })
    }

    pub fn quiescence(&self) -> Duration {
        let default = if self.debug { 30 } else { 600 };
        Duration::from_secs(self.quiescence_secs.unwrap_or(default))
    }
}

/// Find the config file: the explicit path wins, otherwise walk upward from
/// `start` looking for `agrec.yaml`.
pub fn discover(explicit: Option<&Path>, start: &Path) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(p.to_path_buf());
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
        match dir.parent() {
            Some(p) => dir = p.to_path_buf(),
            None => return None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
