//! Leaderless consolidation of per-host recording results.
//!
//! Every host runs the same pass over the shared store. For each work group
//! the hosts agree, without talking to each other, on which one of them
//! consolidates it: the lock holder if there is one, otherwise the vote
//! winner. That host publishes the best attempt and disposes of the rest.

pub mod consolidate;
pub mod group;
pub mod index;
pub mod status;

pub use group::{best_host, vote_winner, Group, HostAttempt, HostMeta};
pub use status::StatusReport;

use crate::error::Result;
use crate::keys::KeyLayout;
use crate::store::ObjectStore;
use chrono::{DateTime, Duration, Utc};
use consolidate::{Disposition, LockState};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Result of processing one group. Only `Failed` indicates a problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GroupOutcome {
    NotQuiescent,
    NoHosts,
    LockedBy { host: String },
    LostVote { winner: Option<String> },
    LockContention { holder: String },
    AlreadyConsolidated,
    Consolidated {
        winner: String,
        error_count: u64,
        #[serde(flatten)]
        disposition: Disposition,
    },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupReport {
    pub program: String,
    pub ts: String,
    #[serde(flatten)]
    pub outcome: GroupOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Report {
    pub groups: Vec<GroupReport>,
    /// Programs whose index gained entries.
    pub indexed: Vec<String>,
}

impl Report {
    pub fn consolidated(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| matches!(g.outcome, GroupOutcome::Consolidated { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| matches!(g.outcome, GroupOutcome::Failed { .. }))
            .count()
    }
}

pub struct Coordinator {
    store: Arc<dyn ObjectStore>,
    layout: KeyLayout,
    hostname: String,
    quiescence: Duration,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: &str,
        hostname: impl Into<String>,
        quiescence: std::time::Duration,
    ) -> Self {
        Self {
            store,
            layout: KeyLayout::new(prefix),
            hostname: hostname.into(),
            quiescence: Duration::from_std(quiescence).unwrap_or_else(|_| Duration::weeks(52)),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn run(&self) -> Result<Report> {
        self.run_at(Utc::now())
    }

    /// One pass over every group. A failing group is reported and the pass
    /// moves on; listing failures abort the pass.
    pub fn run_at(&self, now: DateTime<Utc>) -> Result<Report> {
        let store = self.store.as_ref();
        let mut report = Report::default();
        let mut published: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for program in group::programs(store, &self.layout)? {
            for ts in group::group_timestamps(store, &self.layout, &program)? {
                info!(program = %program, group = %ts, "processing group");
                let outcome = match self.process_group(&program, &ts, now) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(program = %program, group = %ts, error = %e, "consolidation failed");
                        GroupOutcome::Failed { error: e.to_string() }
                    }
                };
                if matches!(outcome, GroupOutcome::Consolidated { .. }) {
                    published.entry(program.clone()).or_default().push(ts.clone());
                }
                report.groups.push(GroupReport {
                    program: program.clone(),
                    ts,
                    outcome,
                });
            }
        }

        for (program, timestamps) in published {
            match index::regenerate(store, &self.layout, &program, &timestamps) {
                Ok(0) => {}
                Ok(_) => report.indexed.push(program),
                Err(e) => error!(program = %program, error = %e, "index update failed"),
            }
        }
        Ok(report)
    }

    fn process_group(&self, program: &str, ts: &str, now: DateTime<Utc>) -> Result<GroupOutcome> {
        let store = self.store.as_ref();
        let group = group::load_group(store, &self.layout, program, ts)?;

        if !group.is_quiescent(now, self.quiescence) {
            info!(group = %ts, "hosts may still be uploading, skipping");
            return Ok(GroupOutcome::NotQuiescent);
        }
        if group.hosts.is_empty() {
            warn!(group = %ts, "no host work, skipping");
            return Ok(GroupOutcome::NoHosts);
        }

        match &group.lock_holder {
            Some(holder) if *holder != self.hostname => {
                info!(group = %ts, holder = %holder, "another host is working on it, skipping");
                return Ok(GroupOutcome::LockedBy {
                    host: holder.clone(),
                });
            }
            Some(_) => {}
            None => {
                let winner = vote_winner(&group.hosts).map(|h| h.host.clone());
                if winner.as_deref() != Some(self.hostname.as_str()) {
                    info!(group = %ts, winner = ?winner, "lost the vote, skipping");
                    return Ok(GroupOutcome::LostVote { winner });
                }
            }
        }

        // Checked before locking so an already published group sees no writes.
        if self.is_consolidated(&group)? {
            return Ok(GroupOutcome::AlreadyConsolidated);
        }

        match consolidate::declare_work(store, &self.layout, &group, &self.hostname)? {
            LockState::Acquired => {}
            LockState::HeldBy(holder) => {
                info!(group = %ts, holder = %holder, "lost the lock race, skipping");
                return Ok(GroupOutcome::LockContention { holder });
            }
        }

        let result = self.consolidate(&group);
        let released = consolidate::declare_work_finish(store, &self.layout, &group);
        match (result, released) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), released) => {
                if let Err(release_err) = released {
                    error!(group = %ts, error = %release_err, "failed to release lock");
                }
                Err(e)
            }
        }
    }

    fn is_consolidated(&self, group: &Group) -> Result<bool> {
        self.store
            .exists(&self.layout.consolidated(&group.program, &group.ts, "json"))
    }

    fn consolidate(&self, group: &Group) -> Result<GroupOutcome> {
        let store = self.store.as_ref();
        if self.is_consolidated(group)? {
            return Ok(GroupOutcome::AlreadyConsolidated);
        }
        let Some(best) = best_host(&group.hosts) else {
            return Ok(GroupOutcome::NoHosts);
        };
        info!(group = %group.ts, host = %best.host, errors = best.error_count(), "best work selected");

        let extracted = consolidate::extract(store, &self.layout, group, best)?;
        let disposition = consolidate::dispose(store, &self.layout, group, best)?;
        consolidate::publish(store, &extracted)?;
        info!(
            group = %group.ts,
            mp3 = ?extracted.mp3,
            mp4 = ?extracted.mp4,
            meta = %extracted.meta_key,
            "published"
        );
        Ok(GroupOutcome::Consolidated {
            winner: best.host.clone(),
            error_count: best.error_count(),
            disposition,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgrecError;
    use crate::store::{Listing, MemoryStore, ObjectMeta};
    use serde_json::json;

    const TS: &str = "2024-01-01_120000";

    fn host_work(store: &MemoryStore, host: &str, tries: u64, vote: i64) {
        let base = format!("agqr/Foo/work/{TS}/{host}");
        let meta = json!({
            "host": host,
            "try": tries,
            "flv_paths": ["1.flv"],
            "mp3_paths": ["1.mp3"],
            "single_mp3_path": "all.mp3",
            "program": { "title": "Foo" },
        });
        store.put(&format!("{base}/meta.json"), meta.to_string().as_bytes()).unwrap();
        store.put(&format!("{base}/vote.txt"), vote.to_string().as_bytes()).unwrap();
        store.put(&format!("{base}/1.flv"), b"flv").unwrap();
        store.put(&format!("{base}/1.mp3"), b"mp3").unwrap();
        store.put(&format!("{base}/all.mp3"), format!("all from {host}").as_bytes()).unwrap();
    }

    fn coordinator(store: Arc<dyn ObjectStore>, host: &str) -> Coordinator {
        Coordinator::new(store, "agqr/", host, std::time::Duration::from_secs(600))
    }

    fn later() -> DateTime<Utc> {
        Utc::now() + Duration::hours(1)
    }

    #[test]
    fn clean_winner_is_published_and_loser_deleted() {
        let store = Arc::new(MemoryStore::new());
        host_work(&store, "h1", 0, 5);
        host_work(&store, "h2", 3, 1);

        let report = coordinator(store.clone(), "h1").run_at(later()).unwrap();
        assert_eq!(report.consolidated(), 1);
        assert_eq!(report.indexed, ["Foo"]);

        assert_eq!(
            store.get_string(&format!("agqr/Foo/rec/{TS}.mp3")).unwrap().as_deref(),
            Some("all from h1")
        );
        let meta = store.get_string(&format!("agqr/Foo/rec/{TS}.json")).unwrap().unwrap();
        assert!(!meta.contains("flv_paths"));
        assert!(!meta.contains("mp3_paths"));

        let keys = store.keys();
        assert!(!keys.iter().any(|k| k.contains("/work/")));
        assert!(!keys.iter().any(|k| k.contains("/h2/")));
        assert!(keys.contains(&format!("agqr/Foo/rec/{TS}/h1/1.flv")));
        assert!(keys.contains(&format!("agqr/Foo/rec/{TS}/h1/meta.json")));
        assert!(!keys.contains(&format!("agqr/Foo/rec/{TS}/h1/all.mp3")));

        let index = store.get_string("agqr/Foo/index.html").unwrap().unwrap();
        assert!(index.contains(&index::marker(TS)));
    }

    #[test]
    fn unclean_winner_archives_every_host() {
        let store = Arc::new(MemoryStore::new());
        host_work(&store, "h1", 1, 5);
        host_work(&store, "h2", 2, 1);

        let report = coordinator(store.clone(), "h1").run_at(later()).unwrap();
        match &report.groups[0].outcome {
            GroupOutcome::Consolidated {
                winner,
                error_count,
                disposition,
            } => {
                assert_eq!(winner, "h1");
                assert_eq!(*error_count, 1);
                assert!(disposition.deleted.is_empty());
                assert_eq!(disposition.archived, ["h1", "h2"]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        assert_eq!(
            store.get_string(&format!("agqr/Foo/rec/{TS}.mp3")).unwrap().as_deref(),
            Some("all from h1")
        );
        for host in ["h1", "h2"] {
            for file in ["meta.json", "vote.txt", "1.flv", "1.mp3", "all.mp3"] {
                let key = format!("agqr/Foo/rec/{TS}/{host}/{file}");
                assert!(store.exists(&key).unwrap(), "missing {key}");
            }
        }
    }

    #[test]
    fn second_pass_touches_nothing() {
        let store = Arc::new(MemoryStore::new());
        host_work(&store, "h1", 0, 5);
        host_work(&store, "h2", 3, 1);
        let coord = coordinator(store.clone(), "h1");
        coord.run_at(later()).unwrap();

        let (copies, deletes, puts) = (store.copy_count(), store.delete_count(), store.put_count());
        let report = coord.run_at(later()).unwrap();
        assert!(report.groups.is_empty());
        assert_eq!(store.copy_count(), copies);
        assert_eq!(store.delete_count(), deletes);
        assert_eq!(store.put_count(), puts);
    }

    #[test]
    fn already_published_group_is_left_alone() {
        let store = Arc::new(MemoryStore::new());
        host_work(&store, "h1", 0, 5);
        store.put(&format!("agqr/Foo/rec/{TS}.json"), b"{}").unwrap();
        let (copies, deletes) = (store.copy_count(), store.delete_count());

        let report = coordinator(store.clone(), "h1").run_at(later()).unwrap();
        assert_eq!(report.groups[0].outcome, GroupOutcome::AlreadyConsolidated);
        assert_eq!(store.copy_count(), copies);
        assert_eq!(store.delete_count(), deletes);
    }

    #[test]
    fn only_the_vote_winner_proceeds() {
        let store = Arc::new(MemoryStore::new());
        host_work(&store, "A", 0, 5);
        host_work(&store, "B", 0, 9);
        host_work(&store, "C", 0, 9);

        for loser in ["A", "B"] {
            let report = coordinator(store.clone(), loser).run_at(later()).unwrap();
            assert_eq!(
                report.groups[0].outcome,
                GroupOutcome::LostVote {
                    winner: Some("C".into())
                }
            );
        }
        assert_eq!(store.copy_count(), 0);

        let report = coordinator(store.clone(), "C").run_at(later()).unwrap();
        assert_eq!(report.consolidated(), 1);
    }

    #[test]
    fn foreign_lock_is_respected() {
        let store = Arc::new(MemoryStore::new());
        host_work(&store, "h1", 0, 5);
        store.put(&format!("agqr/Foo/work/{TS}/work-mark"), b"h9").unwrap();

        let report = coordinator(store.clone(), "h1").run_at(later()).unwrap();
        assert_eq!(
            report.groups[0].outcome,
            GroupOutcome::LockedBy { host: "h9".into() }
        );
    }

    #[test]
    fn own_stale_lock_is_resumed() {
        let store = Arc::new(MemoryStore::new());
        host_work(&store, "h1", 0, 1);
        host_work(&store, "h2", 0, 9);
        store.put(&format!("agqr/Foo/work/{TS}/work-mark"), b"h1\n").unwrap();

        let report = coordinator(store.clone(), "h1").run_at(later()).unwrap();
        assert_eq!(report.consolidated(), 1);
        assert!(!store.exists(&format!("agqr/Foo/work/{TS}/work-mark")).unwrap());
    }

    #[test]
    fn fresh_groups_are_not_touched() {
        let store = Arc::new(MemoryStore::new());
        host_work(&store, "h1", 0, 5);
        let report = coordinator(store.clone(), "h1").run_at(Utc::now()).unwrap();
        assert_eq!(report.groups[0].outcome, GroupOutcome::NotQuiescent);
        assert_eq!(store.copy_count(), 0);
    }

    /// Delegates to a memory store but fails every copy.
    struct BrokenCopies(MemoryStore);

    impl ObjectStore for BrokenCopies {
        fn list(&self, prefix: &str, delimited: bool) -> Result<Listing> {
            self.0.list(prefix, delimited)
        }
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.0.get(key)
        }
        fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
            self.0.head(key)
        }
        fn put(&self, key: &str, body: &[u8]) -> Result<()> {
            self.0.put(key, body)
        }
        fn put_if_absent(&self, key: &str, body: &[u8]) -> Result<bool> {
            self.0.put_if_absent(key, body)
        }
        fn copy(&self, from: &str, _to: &str) -> Result<()> {
            Err(AgrecError::store(from, "copy refused"))
        }
        fn delete(&self, key: &str) -> Result<()> {
            self.0.delete(key)
        }
    }

    /// Delegates to a memory store but fails the first delete of a key
    /// containing `needle`.
    struct FlakyDelete {
        inner: MemoryStore,
        needle: &'static str,
        tripped: std::sync::atomic::AtomicBool,
    }

    impl FlakyDelete {
        fn new(inner: MemoryStore, needle: &'static str) -> Self {
            Self {
                inner,
                needle,
                tripped: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    impl ObjectStore for FlakyDelete {
        fn list(&self, prefix: &str, delimited: bool) -> Result<Listing> {
            self.inner.list(prefix, delimited)
        }
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }
        fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
            self.inner.head(key)
        }
        fn put(&self, key: &str, body: &[u8]) -> Result<()> {
            self.inner.put(key, body)
        }
        fn put_if_absent(&self, key: &str, body: &[u8]) -> Result<bool> {
            self.inner.put_if_absent(key, body)
        }
        fn copy(&self, from: &str, to: &str) -> Result<()> {
            self.inner.copy(from, to)
        }
        fn delete(&self, key: &str) -> Result<()> {
            use std::sync::atomic::Ordering;
            if key.contains(self.needle) && !self.tripped.swap(true, Ordering::SeqCst) {
                return Err(AgrecError::store(key, "delete refused"));
            }
            self.inner.delete(key)
        }
    }

    #[test]
    fn failed_dispose_is_finished_by_the_next_pass() {
        let inner = MemoryStore::new();
        host_work(&inner, "h1", 0, 5);
        host_work(&inner, "h2", 3, 1);
        let store = Arc::new(FlakyDelete::new(inner, "/h2/"));
        let coord = coordinator(store.clone(), "h1");
        let meta_key = format!("agqr/Foo/rec/{TS}.json");

        let report = coord.run_at(later()).unwrap();
        assert_eq!(report.failed(), 1);
        assert!(report.indexed.is_empty());
        assert!(!store.exists(&meta_key).unwrap());
        assert!(!store.exists(&format!("agqr/Foo/work/{TS}/work-mark")).unwrap());
        assert!(store.exists(&format!("agqr/Foo/work/{TS}/h1/vote.txt")).unwrap());

        let report = coord.run_at(later()).unwrap();
        match &report.groups[0].outcome {
            GroupOutcome::Consolidated {
                winner,
                disposition,
                ..
            } => {
                assert_eq!(winner, "h1");
                assert_eq!(disposition.deleted, ["h2"]);
                assert_eq!(disposition.archived, ["h1"]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(report.indexed, ["Foo"]);
        assert!(store.exists(&meta_key).unwrap());
        assert!(!store.inner.keys().iter().any(|k| k.contains("/work/")));
        assert_eq!(
            store.get_string(&format!("agqr/Foo/rec/{TS}.mp3")).unwrap().as_deref(),
            Some("all from h1")
        );
    }

    #[test]
    fn lock_is_released_when_consolidation_fails() {
        let inner = MemoryStore::new();
        host_work(&inner, "h1", 0, 5);
        let store = Arc::new(BrokenCopies(inner));

        let report = coordinator(store.clone(), "h1").run_at(later()).unwrap();
        assert_eq!(report.failed(), 1);
        assert!(!store.exists(&format!("agqr/Foo/work/{TS}/work-mark")).unwrap());
        // Raw work is untouched so the next pass can retry.
        assert!(store.exists(&format!("agqr/Foo/work/{TS}/h1/all.mp3")).unwrap());
    }
}
