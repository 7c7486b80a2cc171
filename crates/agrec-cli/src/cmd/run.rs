use agrec_core::config::{CommandSpec, Config};
use agrec_core::source;
use agrec_scheduler::{signals, Exit, Scheduler, SchedulerOptions};
use anyhow::Context;
use std::path::Path;
use tracing::info;

pub fn run(config: &Config, config_path: Option<&Path>) -> anyhow::Result<()> {
    config
        .validate_store()
        .context("the scheduler needs a shared store")?;
    let location = config.timetable_location()?;

    let options = SchedulerOptions::from_config(config, default_cleanup(config_path)?)?;
    let scheduler = Scheduler::new(options, source::from_location(location));

    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    let _signals = signals::install(events_tx).context("failed to install signal handlers")?;

    info!(host = %config.hostname(), timetable = location, "scheduler starting");
    match scheduler.run(events_rx)? {
        Exit::Stopped => info!("scheduler stopped"),
        Exit::Restarted => info!("scheduler stopped, replacement is running"),
    }
    Ok(())
}

/// `agrec cleanup` with the same config file as this process.
fn default_cleanup(config_path: Option<&Path>) -> anyhow::Result<CommandSpec> {
    let exe = std::env::current_exe().context("failed to locate the agrec executable")?;
    let mut spec = CommandSpec::new(exe.to_string_lossy()).with_args(["cleanup"]);
    if let Some(path) = config_path {
        spec = spec.with_args(["--config".to_string(), path.to_string_lossy().into_owned()]);
    }
    Ok(spec)
}
