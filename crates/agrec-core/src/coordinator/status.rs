use super::group::{self, best_host, vote_winner};
use crate::error::Result;
use crate::keys::KeyLayout;
use crate::store::ObjectStore;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HostStatus {
    pub host: String,
    pub error_count: u64,
    pub vote: Option<i64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GroupStatus {
    pub ts: String,
    pub quiescent: bool,
    pub locked_by: Option<String>,
    pub vote_leader: Option<String>,
    pub best_host: Option<String>,
    pub hosts: Vec<HostStatus>,
}

impl GroupStatus {
    /// A group nobody can consolidate without help.
    pub fn is_invalid(&self) -> bool {
        self.vote_leader.is_none() || self.best_host.is_none()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProgramStatus {
    pub program: String,
    pub recordings: usize,
    pub groups: Vec<GroupStatus>,
}

/// Snapshot of every pending work group in the store.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StatusReport {
    pub programs: Vec<ProgramStatus>,
}

impl StatusReport {
    pub fn collect(
        store: &dyn ObjectStore,
        layout: &KeyLayout,
        quiescence: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let mut programs = Vec::new();
        for program in group::programs(store, layout)? {
            let mut groups = Vec::new();
            for ts in group::group_timestamps(store, layout, &program)? {
                let g = group::load_group(store, layout, &program, &ts)?;
                groups.push(GroupStatus {
                    quiescent: g.is_quiescent(now, quiescence),
                    locked_by: g.lock_holder.clone(),
                    vote_leader: vote_winner(&g.hosts).map(|h| h.host.clone()),
                    best_host: best_host(&g.hosts).map(|h| h.host.clone()),
                    hosts: g
                        .hosts
                        .iter()
                        .map(|h| HostStatus {
                            host: h.host.clone(),
                            error_count: h.error_count(),
                            vote: (h.vote >= 0).then_some(h.vote),
                        })
                        .collect(),
                    ts,
                });
            }
            programs.push(ProgramStatus {
                recordings: group::recording_count(store, layout, &program)?,
                program,
                groups,
            });
        }
        Ok(Self { programs })
    }

    pub fn pending_count(&self) -> usize {
        self.programs.iter().map(|p| p.groups.len()).sum()
    }

    pub fn invalid_pending_count(&self) -> usize {
        self.programs
            .iter()
            .flat_map(|p| &p.groups)
            .filter(|g| g.is_invalid())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn counts_pending_and_invalid_groups() {
        let store = MemoryStore::new();
        let layout = KeyLayout::new("p");
        store.put("p/Foo/work/t1/h1/meta.json", br#"{"try":1,"single_mp3_path":"all.mp3"}"#).unwrap();
        store.put("p/Foo/work/t1/h1/vote.txt", b"7").unwrap();
        // No vote anywhere: nobody leads.
        store.put("p/Foo/work/t2/h1/meta.json", b"{}").unwrap();
        store.put("p/Bar/rec/t0.json", b"{}").unwrap();

        let report = StatusReport::collect(&store, &layout, Duration::zero(), Utc::now()).unwrap();
        assert_eq!(report.pending_count(), 2);
        assert_eq!(report.invalid_pending_count(), 1);

        let foo = report.programs.iter().find(|p| p.program == "Foo").unwrap();
        assert_eq!(foo.groups[0].vote_leader.as_deref(), Some("h1"));
        assert_eq!(foo.groups[0].best_host.as_deref(), Some("h1"));
        assert_eq!(foo.groups[0].hosts[0].error_count, 1);
        assert_eq!(foo.groups[1].hosts[0].error_count, 1000);

        let bar = report.programs.iter().find(|p| p.program == "Bar").unwrap();
        assert_eq!(bar.recordings, 1);
        assert!(bar.groups.is_empty());
    }
}
