//! Object-store abstraction shared by every host.
//!
//! The store is the only coordination medium between hosts: locks, votes
//! and results are all plain objects. Backends only need the small set of
//! primitives below; nothing here is transactional beyond
//! [`ObjectStore::put_if_absent`].

mod fs;
mod memory;

pub use fs::FsStore;
pub use memory::MemoryStore;

use crate::error::Result;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Result of a [`ObjectStore::list`] call, sorted by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub objects: Vec<ObjectMeta>,
    /// Rolled-up "directories", each ending in `/`. Only filled for
    /// delimited listings.
    pub prefixes: Vec<String>,
}

pub trait ObjectStore: Send + Sync {
    /// List keys starting with `prefix`. When `delimited`, keys with a `/`
    /// after the prefix are rolled up into [`Listing::prefixes`].
    fn list(&self, prefix: &str, delimited: bool) -> Result<Listing>;

    /// Body of `key`, or `None` when it does not exist.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn head(&self, key: &str) -> Result<Option<ObjectMeta>>;

    fn put(&self, key: &str, body: &[u8]) -> Result<()>;

    /// Create `key` only if absent. Returns false when it already existed.
    fn put_if_absent(&self, key: &str, body: &[u8]) -> Result<bool>;

    fn copy(&self, from: &str, to: &str) -> Result<()>;

    /// Deleting a missing key succeeds.
    fn delete(&self, key: &str) -> Result<()>;

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.head(key)?.is_some())
    }

    fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .get(key)?
            .map(|body| String::from_utf8_lossy(&body).into_owned()))
    }
}

/// Split flat keys into direct objects and rolled-up prefixes.
pub(crate) fn roll_up(prefix: &str, objects: Vec<ObjectMeta>, delimited: bool) -> Listing {
    if !delimited {
        return Listing {
            objects,
            prefixes: Vec::new(),
        };
    }

    let mut listing = Listing::default();
    for obj in objects {
        let rest = &obj.key[prefix.len()..];
        match rest.find('/') {
            Some(idx) => {
                let rolled = format!("{prefix}{}", &rest[..=idx]);
                if listing.prefixes.last() != Some(&rolled) {
                    listing.prefixes.push(rolled);
                }
            }
            None => listing.objects.push(obj),
        }
    }
    listing.prefixes.dedup();
    listing
}
