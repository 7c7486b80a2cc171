pub mod cleanup;
pub mod run;
pub mod status;
pub mod timetable;

use agrec_core::config::{self, Config};
use agrec_core::coordinator::Coordinator;
use agrec_core::store::FsStore;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Resolve the config file and load it with environment overrides applied.
/// Returns the file that was used, if any.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<(Config, Option<PathBuf>)> {
    let cwd = std::env::current_dir().context("failed to read working directory")?;
    let path = config::discover(explicit, &cwd);
    let config = Config::resolve(path.as_deref()).with_context(|| match &path {
        Some(p) => format!("failed to load config from {}", p.display()),
        None => "failed to build config".to_string(),
    })?;
    Ok((config, path))
}

/// The configured bucket, which must already exist.
pub fn open_store(config: &Config) -> anyhow::Result<FsStore> {
    config.validate_store()?;
    let bucket = config.bucket()?;
    if !bucket.is_dir() {
        anyhow::bail!("store bucket {} is not a directory", bucket.display());
    }
    Ok(FsStore::new(bucket))
}

/// Coordinator over the configured bucket, acting as this host.
pub fn coordinator(config: &Config) -> anyhow::Result<Coordinator> {
    Ok(Coordinator::new(
        Arc::new(open_store(config)?),
        config.key_prefix(),
        config.hostname(),
        config.quiescence(),
    ))
}
