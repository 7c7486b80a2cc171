//! Object-store key layout.
//!
//! ```text
//! <prefix>/<program>/work/<ts>/<host>/{meta.json, vote.txt, all.mp3, ...}
//! <prefix>/<program>/work/<ts>/work-mark
//! <prefix>/<program>/rec/<ts>.{mp3,mp4,json}
//! <prefix>/<program>/rec/<ts>/<host>/...
//! <prefix>/<program>/index.html
//! ```
//!
//! Directory-like keys returned here always end in `/`.

use crate::error::{AgrecError, Result};
use chrono::NaiveDateTime;

pub const GROUP_TS_FORMAT: &str = "%Y-%m-%d_%H%M%S";
pub const LOCK_OBJECT: &str = "work-mark";
pub const META_OBJECT: &str = "meta.json";
pub const VOTE_OBJECT: &str = "vote.txt";
pub const INDEX_OBJECT: &str = "index.html";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    root: String,
}

impl KeyLayout {
    pub fn new(prefix: &str) -> Self {
        let trimmed = prefix.trim_matches('/');
        let root = if trimmed.is_empty() {
            String::new()
        } else {
            format!("{trimmed}/")
        };
        Self { root }
    }

    /// Prefix under which every program lives (`""` or `"<prefix>/"`).
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn program(&self, program: &str) -> String {
        format!("{}{program}/", self.root)
    }

    pub fn work(&self, program: &str) -> String {
        format!("{}work/", self.program(program))
    }

    pub fn group(&self, program: &str, ts: &str) -> String {
        format!("{}{ts}/", self.work(program))
    }

    pub fn host(&self, program: &str, ts: &str, host: &str) -> String {
        format!("{}{host}/", self.group(program, ts))
    }

    pub fn lock(&self, program: &str, ts: &str) -> String {
        format!("{}{LOCK_OBJECT}", self.group(program, ts))
    }

    pub fn rec(&self, program: &str) -> String {
        format!("{}rec/", self.program(program))
    }

    /// Published output, `ext` without the dot.
    pub fn consolidated(&self, program: &str, ts: &str, ext: &str) -> String {
        format!("{}{ts}.{ext}", self.rec(program))
    }

    pub fn archive(&self, program: &str, ts: &str, host: &str) -> String {
        format!("{}{ts}/{host}/", self.rec(program))
    }

    pub fn index(&self, program: &str) -> String {
        format!("{}{INDEX_OBJECT}", self.program(program))
    }
}

/// Final path segment of a directory-like key: `"a/b/c/"` -> `"c"`.
pub fn last_segment(prefix: &str) -> &str {
    prefix
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
}

/// Parse a group timestamp (`YYYY-MM-DD_HHMMSS`, local wall time).
pub fn parse_group_ts(ts: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(ts, GROUP_TS_FORMAT)
        .map_err(|_| AgrecError::InvalidGroupTimestamp(ts.to_string()))
}
