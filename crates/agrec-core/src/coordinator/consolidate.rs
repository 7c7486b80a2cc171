//! Store mutations for one group: lock, publish, dispose.

use super::group::{Group, HostAttempt};
use crate::error::Result;
use crate::keys::KeyLayout;
use crate::store::ObjectStore;
use serde_json::{json, Value};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Acquired,
    HeldBy(String),
}

/// Write the lock object naming `hostname`. The write is conditional, so
/// two hosts that both believe they won the vote cannot both hold it. A
/// lock already naming this host (left by an earlier crashed run) counts
/// as acquired.
pub fn declare_work(
    store: &dyn ObjectStore,
    layout: &KeyLayout,
    group: &Group,
    hostname: &str,
) -> Result<LockState> {
    let key = layout.lock(&group.program, &group.ts);
    if store.put_if_absent(&key, hostname.as_bytes())? {
        debug!(group = %group.ts, "lock acquired");
        return Ok(LockState::Acquired);
    }
    let holder = store
        .get_string(&key)?
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    if holder == hostname {
        return Ok(LockState::Acquired);
    }
    Ok(LockState::HeldBy(holder))
}

pub fn declare_work_finish(store: &dyn ObjectStore, layout: &KeyLayout, group: &Group) -> Result<()> {
    store.delete(&layout.lock(&group.program, &group.ts))
}

/// Outputs copied by [`extract`] and the metadata still to be published.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extracted {
    pub mp3: Option<String>,
    pub mp4: Option<String>,
    /// `rec/<ts>.json`
    pub meta_key: String,
    /// Winner's metadata with raw file lists dropped and output paths
    /// pointing at the published copies.
    pub meta: Value,
}

/// Copy the winner's single-file outputs to `rec/<ts>.{mp3,mp4}` and build
/// the trimmed metadata. Nothing is written to `rec/<ts>.json` here; see
/// [`publish`].
///
/// An output whose source is gone but whose published copy exists was
/// promoted by an earlier pass that failed later on, and is kept as is.
pub fn extract(
    store: &dyn ObjectStore,
    layout: &KeyLayout,
    group: &Group,
    best: &HostAttempt,
) -> Result<Extracted> {
    let mut meta = match &best.meta {
        Some(meta) => meta.as_value().clone(),
        None => json!({ "host": best.host }),
    };
    let mut out = Extracted {
        meta_key: layout.consolidated(&group.program, &group.ts, "json"),
        ..Extracted::default()
    };

    let outputs = [
        ("single_mp3_path", "mp3"),
        ("single_mp4_path", "mp4"),
    ];
    for (field, ext) in outputs {
        let source = match meta.get(field).and_then(Value::as_str) {
            Some(path) if !path.is_empty() => best.key_for(path),
            _ => continue,
        };
        let dest = layout.consolidated(&group.program, &group.ts, ext);
        if !store.exists(&source)? && store.exists(&dest)? {
            debug!(to = %dest, "already published");
        } else {
            info!(from = %source, to = %dest, "publishing");
            store.copy(&source, &dest)?;
        }
        meta[field] = Value::String(format!("/{dest}"));
        match ext {
            "mp3" => out.mp3 = Some(dest),
            _ => out.mp4 = Some(dest),
        }
    }

    if let Some(obj) = meta.as_object_mut() {
        obj.remove("flv_paths");
        obj.remove("mp3_paths");
    }
    out.meta = meta;
    Ok(out)
}

/// Write `rec/<ts>.json`. Its presence marks the group as consolidated, so
/// this runs only once the raw work has been disposed of.
pub fn publish(store: &dyn ObjectStore, extracted: &Extracted) -> Result<()> {
    store.put(&extracted.meta_key, &serde_json::to_vec(&extracted.meta)?)
}

/// What happened to each host's raw work.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct Disposition {
    pub deleted: Vec<String>,
    pub archived: Vec<String>,
}

/// Clean up raw host work after [`extract`].
///
/// With a clean winner every other host's work is deleted and the winner's
/// is archived minus the files already published. Otherwise every host's
/// work is archived untouched and nothing is deleted.
///
/// The winner is handled last. Until its work is gone it still wins both
/// the vote and the best-host pick, so a pass that fails part way through
/// is resumed by the same host with the same result.
pub fn dispose(
    store: &dyn ObjectStore,
    layout: &KeyLayout,
    group: &Group,
    best: &HostAttempt,
) -> Result<Disposition> {
    let mut disposition = Disposition::default();

    let losers = group.hosts.iter().filter(|h| h.host != best.host);

    if best.error_count() > 0 {
        info!(group = %group.ts, errors = best.error_count(), "winner is not clean, archiving every host");
        for host in losers.chain(std::iter::once(best)) {
            move_host(store, layout, group, host, &[])?;
            disposition.archived.push(host.host.clone());
        }
        return Ok(disposition);
    }

    let promoted: Vec<String> = best
        .meta
        .iter()
        .flat_map(|m| [m.single_mp3_path(), m.single_mp4_path()])
        .flatten()
        .map(|p| best.key_for(p))
        .collect();

    for host in losers {
        info!(host = %host.host, "removing host work");
        delete_host(store, host)?;
        disposition.deleted.push(host.host.clone());
    }
    move_host(store, layout, group, best, &promoted)?;
    disposition.archived.push(best.host.clone());
    Ok(disposition)
}

/// Relocate `host`'s keys under the archive path. Keys in `skip` are
/// deleted instead of copied.
fn move_host(
    store: &dyn ObjectStore,
    layout: &KeyLayout,
    group: &Group,
    host: &HostAttempt,
    skip: &[String],
) -> Result<()> {
    let dest_prefix = layout.archive(&group.program, &group.ts, &host.host);
    info!(from = %host.prefix, to = %dest_prefix, "archiving host work");
    for key in &host.keys {
        if skip.contains(key) {
            continue;
        }
        let relative = &key[host.prefix.len()..];
        store.copy(key, &format!("{dest_prefix}{relative}"))?;
    }
    delete_host(store, host)
}

/// Delete every key of `host`, `meta.json` and `vote.txt` last.
fn delete_host(store: &dyn ObjectStore, host: &HostAttempt) -> Result<()> {
    let mut keys: Vec<&String> = host.keys.iter().collect();
    keys.sort_by_key(|k| (k.ends_with("/meta.json"), k.ends_with("/vote.txt")));
    for key in keys {
        store.delete(key)?;
    }
    Ok(())
}
