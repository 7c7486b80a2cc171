use super::{roll_up, Listing, ObjectMeta, ObjectStore};
use crate::error::{AgrecError, Result};
use crate::io;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};

/// A bucket backed by a directory, typically a network mount shared by
/// every recording host. Keys are relative paths below the root.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        let valid = !key.is_empty()
            && !key.ends_with('/')
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(AgrecError::store(key, "invalid key"));
        }
        Ok(self.root.join(rel))
    }

    fn meta_for(&self, key: String, path: &Path) -> Result<ObjectMeta> {
        let md = std::fs::metadata(path)?;
        let last_modified: DateTime<Utc> = md.modified()?.into();
        Ok(ObjectMeta {
            key,
            size: md.len(),
            last_modified,
        })
    }

    fn walk(&self, dir: &Path, out: &mut Vec<ObjectMeta>) -> Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.walk(&path, out)?;
                continue;
            }
            // In-flight atomic writes.
            if entry.file_name().to_string_lossy().starts_with(".tmp") {
                continue;
            }
            let Ok(rel) = path.strip_prefix(&self.root) else {
                continue;
            };
            let key = rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
            match self.meta_for(key, &path) {
                Ok(meta) => out.push(meta),
                // Deleted by another host between readdir and stat.
                Err(AgrecError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl ObjectStore for FsStore {
    fn list(&self, prefix: &str, delimited: bool) -> Result<Listing> {
        // Only descend into the deepest directory the prefix pins down.
        let base = match prefix.rfind('/') {
            Some(idx) => self.root.join(&prefix[..idx]),
            None => self.root.clone(),
        };
        let mut objects = Vec::new();
        self.walk(&base, &mut objects)?;
        objects.retain(|o| o.key.starts_with(prefix));
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(roll_up(prefix, objects, delimited))
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        let path = self.path_for(key)?;
        if !path.is_file() {
            return Ok(None);
        }
        self.meta_for(key.to_string(), &path).map(Some)
    }

    fn put(&self, key: &str, body: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        io::atomic_write(&path, body)
    }

    fn put_if_absent(&self, key: &str, body: &[u8]) -> Result<bool> {
        let path = self.path_for(key)?;
        io::create_exclusive(&path, body)
    }

    fn copy(&self, from: &str, to: &str) -> Result<()> {
        let body = self
            .get(from)?
            .ok_or_else(|| AgrecError::ObjectNotFound(from.to_string()))?;
        self.put(to, &body)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = path.parent() {
            io::prune_empty_dirs(parent, &self.root);
        }
        Ok(())
    }
}
