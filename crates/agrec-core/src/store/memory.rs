use super::{roll_up, Listing, ObjectMeta, ObjectStore};
use crate::error::{AgrecError, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct Entry {
    body: Vec<u8>,
    last_modified: DateTime<Utc>,
}

/// In-process store. Counts mutating operations so callers can assert that
/// a pass did (or did not) touch anything.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Entry>>,
    copies: AtomicUsize,
    deletes: AtomicUsize,
    puts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> Result<MutexGuard<'_, BTreeMap<String, Entry>>> {
        self.objects
            .lock()
            .map_err(|_| AgrecError::store("*", "memory store lock poisoned"))
    }

    /// Backdate (or postdate) an object's modification time.
    pub fn set_last_modified(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        let mut objects = self.objects()?;
        let entry = objects
            .get_mut(key)
            .ok_or_else(|| AgrecError::ObjectNotFound(key.to_string()))?;
        entry.last_modified = at;
        Ok(())
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn copy_count(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

impl ObjectStore for MemoryStore {
    fn list(&self, prefix: &str, delimited: bool) -> Result<Listing> {
        let objects = self.objects()?;
        let matched = objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| ObjectMeta {
                key: k.clone(),
                size: e.body.len() as u64,
                last_modified: e.last_modified,
            })
            .collect();
        Ok(roll_up(prefix, matched, delimited))
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects()?.get(key).map(|e| e.body.clone()))
    }

    fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        Ok(self.objects()?.get(key).map(|e| ObjectMeta {
            key: key.to_string(),
            size: e.body.len() as u64,
            last_modified: e.last_modified,
        }))
    }

    fn put(&self, key: &str, body: &[u8]) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.objects()?.insert(
            key.to_string(),
            Entry {
                body: body.to_vec(),
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    fn put_if_absent(&self, key: &str, body: &[u8]) -> Result<bool> {
        let mut objects = self.objects()?;
        if objects.contains_key(key) {
            return Ok(false);
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        objects.insert(
            key.to_string(),
            Entry {
                body: body.to_vec(),
                last_modified: Utc::now(),
            },
        );
        Ok(true)
    }

    fn copy(&self, from: &str, to: &str) -> Result<()> {
        let mut objects = self.objects()?;
        let body = objects
            .get(from)
            .map(|e| e.body.clone())
            .ok_or_else(|| AgrecError::ObjectNotFound(from.to_string()))?;
        self.copies.fetch_add(1, Ordering::SeqCst);
        objects.insert(
            to.to_string(),
            Entry {
                body,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.objects()?.remove(key);
        Ok(())
    }
}
