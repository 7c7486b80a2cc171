//! Read-only view of work groups in the store.
//!
//! Groups and host attempts are plain records built from listings; nothing
//! here mutates the store.

use crate::error::{AgrecError, Result};
use crate::keys::{self, KeyLayout, META_OBJECT, VOTE_OBJECT};
use crate::store::ObjectStore;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::warn;

/// Penalty added when a host produced no single-file output.
pub const MISSING_OUTPUT_PENALTY: u64 = 1000;

/// Parsed `meta.json` as written by the recorder. The raw document is kept
/// so fields this crate does not know about survive consolidation.
#[derive(Debug, Clone, PartialEq)]
pub struct HostMeta(Value);

impl HostMeta {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(body)?;
        if !value.is_object() {
            return Err(AgrecError::Parse("meta.json is not an object".to_string()));
        }
        Ok(Self(value))
    }

    pub fn try_count(&self) -> u64 {
        self.0.get("try").and_then(Value::as_u64).unwrap_or(0)
    }

    pub fn single_mp3_path(&self) -> Option<&str> {
        self.str_field("single_mp3_path")
    }

    pub fn single_mp4_path(&self) -> Option<&str> {
        self.str_field("single_mp4_path")
    }

    pub fn title(&self) -> Option<&str> {
        self.0
            .pointer("/program/title")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    fn str_field(&self, name: &str) -> Option<&str> {
        self.0
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// One host's contribution to a group.
#[derive(Debug, Clone, PartialEq)]
pub struct HostAttempt {
    pub host: String,
    /// `.../work/<ts>/<host>/`
    pub prefix: String,
    /// Every key under `prefix`, sorted.
    pub keys: Vec<String>,
    /// Self-reported vote, `-1` when absent or unreadable.
    pub vote: i64,
    pub meta: Option<HostMeta>,
}

impl HostAttempt {
    /// Attempts made plus a large penalty without a single-file output.
    /// A missing `meta.json` counts as no output.
    pub fn error_count(&self) -> u64 {
        match &self.meta {
            Some(meta) => {
                let penalty = if meta.single_mp3_path().is_some() {
                    0
                } else {
                    MISSING_OUTPUT_PENALTY
                };
                meta.try_count() + penalty
            }
            None => MISSING_OUTPUT_PENALTY,
        }
    }

    /// Key of a file named relative to this host's prefix.
    pub fn key_for(&self, relative: &str) -> String {
        format!("{}{relative}", self.prefix)
    }
}

/// One recording attempt of one program, possibly made by several hosts.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub program: String,
    pub ts: String,
    pub hosts: Vec<HostAttempt>,
    /// Host named by the lock object, if any.
    pub lock_holder: Option<String>,
    newest_meta: Option<DateTime<Utc>>,
    newest_object: Option<DateTime<Utc>>,
}

impl Group {
    /// Most recent write that still indicates hosts may be uploading:
    /// the newest `meta.json`, else the newest object of any kind.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.newest_meta.or(self.newest_object)
    }

    pub fn is_quiescent(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        match self.last_activity() {
            Some(at) => now - at >= threshold,
            None => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Program directory names under the key prefix.
pub fn programs(store: &dyn ObjectStore, layout: &KeyLayout) -> Result<Vec<String>> {
    let listing = store.list(layout.root(), true)?;
    Ok(listing
        .prefixes
        .iter()
        .map(|p| keys::last_segment(p).to_string())
        .collect())
}

/// Group timestamps with pending work for `program`, oldest first.
/// Directories not named like a group timestamp are skipped.
pub fn group_timestamps(
    store: &dyn ObjectStore,
    layout: &KeyLayout,
    program: &str,
) -> Result<Vec<String>> {
    let listing = store.list(&layout.work(program), true)?;
    Ok(listing
        .prefixes
        .iter()
        .map(|p| keys::last_segment(p))
        .filter(|ts| match keys::parse_group_ts(ts) {
            Ok(_) => true,
            Err(e) => {
                warn!(program = %program, error = %e, "ignoring work directory");
                false
            }
        })
        .map(str::to_string)
        .collect())
}

/// Number of consolidated recordings already published for `program`.
pub fn recording_count(store: &dyn ObjectStore, layout: &KeyLayout, program: &str) -> Result<usize> {
    let listing = store.list(&layout.rec(program), true)?;
    Ok(listing
        .objects
        .iter()
        .filter(|o| o.key.ends_with(".json"))
        .count())
}

pub fn load_group(
    store: &dyn ObjectStore,
    layout: &KeyLayout,
    program: &str,
    ts: &str,
) -> Result<Group> {
    let prefix = layout.group(program, ts);
    let listing = store.list(&prefix, false)?;

    let mut hosts: Vec<HostAttempt> = Vec::new();
    let mut newest_meta: Option<DateTime<Utc>> = None;
    let mut newest_object: Option<DateTime<Utc>> = None;

    for object in &listing.objects {
        newest_object = newest_object.max(Some(object.last_modified));
        let rest = &object.key[prefix.len()..];
        // Objects directly under the group (the lock) are not host work.
        let Some((host, file)) = rest.split_once('/') else {
            continue;
        };
        if file == META_OBJECT {
            newest_meta = newest_meta.max(Some(object.last_modified));
        }
        match hosts.last_mut() {
            Some(last) if last.host == host => last.keys.push(object.key.clone()),
            _ => hosts.push(HostAttempt {
                host: host.to_string(),
                prefix: layout.host(program, ts, host),
                keys: vec![object.key.clone()],
                vote: -1,
                meta: None,
            }),
        }
    }

    for attempt in &mut hosts {
        attempt.vote = read_vote(store, &attempt.key_for(VOTE_OBJECT))?;
        attempt.meta = read_meta(store, &attempt.key_for(META_OBJECT))?;
    }

    let lock_holder = store
        .get_string(&layout.lock(program, ts))?
        .map(|s| s.trim().to_string());

    Ok(Group {
        program: program.to_string(),
        ts: ts.to_string(),
        hosts,
        lock_holder,
        newest_meta,
        newest_object,
    })
}

fn read_vote(store: &dyn ObjectStore, key: &str) -> Result<i64> {
    let Some(body) = store.get_string(key)? else {
        return Ok(-1);
    };
    match body.trim().parse::<i64>() {
        Ok(vote) => Ok(vote),
        Err(_) => {
            warn!(key, "unreadable vote, ignoring");
            Ok(-1)
        }
    }
}

fn read_meta(store: &dyn ObjectStore, key: &str) -> Result<Option<HostMeta>> {
    let Some(body) = store.get(key)? else {
        return Ok(None);
    };
    match HostMeta::parse(&body) {
        Ok(meta) => Ok(Some(meta)),
        Err(e) => {
            warn!(key, error = %e, "unreadable meta.json, treating as missing");
            Ok(None)
        }
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Highest non-negative vote wins; ties go to the greatest hostname.
/// Every host computes the same answer from the same listing.
pub fn vote_winner(hosts: &[HostAttempt]) -> Option<&HostAttempt> {
    hosts
        .iter()
        .filter(|h| h.vote >= 0)
        .max_by(|a, b| (a.vote, &a.host).cmp(&(b.vote, &b.host)))
}

/// Lowest error count; the earliest host wins ties.
pub fn best_host(hosts: &[HostAttempt]) -> Option<&HostAttempt> {
    hosts.iter().min_by_key(|h| h.error_count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn attempt(host: &str, vote: i64, meta: Option<Value>) -> HostAttempt {
        HostAttempt {
            host: host.to_string(),
            prefix: format!("p/Foo/work/t/{host}/"),
            keys: Vec::new(),
            vote,
            meta: meta.map(HostMeta),
        }
    }

    #[test]
    fn vote_ties_go_to_greatest_hostname() {
        let hosts = vec![attempt("A", 5, None), attempt("B", 9, None), attempt("C", 9, None)];
        assert_eq!(vote_winner(&hosts).unwrap().host, "C");

        let mut reversed = hosts.clone();
        reversed.reverse();
        assert_eq!(vote_winner(&reversed).unwrap().host, "C");
    }

    #[test]
    fn hosts_without_votes_never_win() {
        let hosts = vec![attempt("z", -1, None), attempt("a", 0, None)];
        assert_eq!(vote_winner(&hosts).unwrap().host, "a");
        assert!(vote_winner(&[attempt("z", -1, None)]).is_none());
    }

    #[test]
    fn error_count_penalises_missing_output() {
        let ok = attempt("a", 1, Some(serde_json::json!({"try": 2, "single_mp3_path": "all.mp3"})));
        let no_mp3 = attempt("b", 1, Some(serde_json::json!({"try": 0})));
        let no_meta = attempt("c", 1, None);
        assert_eq!(ok.error_count(), 2);
        assert_eq!(no_mp3.error_count(), 1000);
        assert_eq!(no_meta.error_count(), 1000);
    }

    #[test]
    fn best_host_prefers_fewest_errors_then_input_order() {
        let two = attempt("h1", 1, Some(serde_json::json!({"try": 2, "single_mp3_path": "all.mp3"})));
        let zero = attempt("h2", 1, Some(serde_json::json!({"try": 0, "single_mp3_path": "all.mp3"})));
        let zero_b = attempt("h3", 1, Some(serde_json::json!({"try": 0, "single_mp3_path": "all.mp3"})));
        assert_eq!(best_host(&[two.clone(), zero.clone()]).unwrap().host, "h2");
        assert_eq!(best_host(&[zero_b, zero]).unwrap().host, "h3");
    }

    #[test]
    fn load_group_separates_lock_from_hosts() {
        let store = MemoryStore::new();
        let layout = KeyLayout::new("p");
        store.put("p/Foo/work/t/h1/meta.json", br#"{"try":0,"single_mp3_path":"all.mp3"}"#).unwrap();
        store.put("p/Foo/work/t/h1/vote.txt", b"42\n").unwrap();
        store.put("p/Foo/work/t/h2/a.flv", b"").unwrap();
        store.put("p/Foo/work/t/work-mark", b"h1\n").unwrap();

        let group = load_group(&store, &layout, "Foo", "t").unwrap();
        let names: Vec<_> = group.hosts.iter().map(|h| h.host.as_str()).collect();
        assert_eq!(names, ["h1", "h2"]);
        assert_eq!(group.hosts[0].vote, 42);
        assert_eq!(group.hosts[0].error_count(), 0);
        assert_eq!(group.hosts[1].vote, -1);
        assert_eq!(group.hosts[1].error_count(), 1000);
        assert_eq!(group.lock_holder.as_deref(), Some("h1"));
    }

    #[test]
    fn quiescence_uses_newest_meta() {
        let store = MemoryStore::new();
        let layout = KeyLayout::new("p");
        store.put("p/Foo/work/t/h1/meta.json", b"{}").unwrap();
        store.put("p/Foo/work/t/h1/a.flv", b"").unwrap();
        let old = Utc::now() - Duration::hours(2);
        store.set_last_modified("p/Foo/work/t/h1/meta.json", old).unwrap();

        let group = load_group(&store, &layout, "Foo", "t").unwrap();
        assert_eq!(group.last_activity(), Some(old));
        assert!(group.is_quiescent(Utc::now(), Duration::minutes(10)));
        assert!(!group.is_quiescent(old + Duration::minutes(5), Duration::minutes(10)));
    }

    #[test]
    fn programs_and_groups_are_listed() {
        let store = MemoryStore::new();
        let layout = KeyLayout::new("p");
        store.put("p/Foo/work/2024-01-01_120000/h1/meta.json", b"{}").unwrap();
        store.put("p/Foo/work/2024-01-08_120000/h1/meta.json", b"{}").unwrap();
        store.put("p/Foo/work/scratch/h1/meta.json", b"{}").unwrap();
        store.put("p/Foo/rec/2023-12-25_120000.json", b"{}").unwrap();
        store.put("p/Bar/index.html", b"").unwrap();

        assert_eq!(programs(&store, &layout).unwrap(), ["Bar", "Foo"]);
        assert_eq!(
            group_timestamps(&store, &layout, "Foo").unwrap(),
            ["2024-01-01_120000", "2024-01-08_120000"]
        );
        assert_eq!(recording_count(&store, &layout, "Foo").unwrap(), 1);
    }
}
