use crate::output::{print_json, print_table};
use agrec_core::config::Config;
use agrec_core::coordinator::StatusReport;
use agrec_core::keys::KeyLayout;
use clap::Subcommand;

#[derive(Subcommand)]
pub enum StatusSubcommand {
    /// Print the number of work groups not yet consolidated
    PendingCount,

    /// Print the number of pending groups without a vote leader or usable host
    InvalidPendingCount,
}

pub fn run(config: &Config, subcommand: Option<StatusSubcommand>, json: bool) -> anyhow::Result<()> {
    let store = super::open_store(config)?;
    let quiescence = chrono::Duration::from_std(config.quiescence())?;
    let report = StatusReport::collect(
        &store,
        &KeyLayout::new(config.key_prefix()),
        quiescence,
        chrono::Utc::now(),
    )?;

    match subcommand {
        Some(StatusSubcommand::PendingCount) => print_count("pending_count", report.pending_count(), json),
        Some(StatusSubcommand::InvalidPendingCount) => {
            print_count("invalid_pending_count", report.invalid_pending_count(), json)
        }
        None if json => print_json(&report),
        None => {
            print_status(&report);
            Ok(())
        }
    }
}

fn print_count(name: &str, count: usize, json: bool) -> anyhow::Result<()> {
    if json {
        print_json(&serde_json::json!({ name: count }))
    } else {
        println!("{count}");
        Ok(())
    }
}

fn print_status(report: &StatusReport) {
    if report.pending_count() == 0 {
        let published: usize = report.programs.iter().map(|p| p.recordings).sum();
        println!("No pending work groups ({published} recordings published).");
        return;
    }

    let mut rows = Vec::new();
    for program in &report.programs {
        for group in &program.groups {
            let hosts: Vec<String> = group
                .hosts
                .iter()
                .map(|h| match h.vote {
                    Some(vote) => format!("{}:{} (vote {vote})", h.host, h.error_count),
                    None => format!("{}:{}", h.host, h.error_count),
                })
                .collect();
            let state = match (&group.locked_by, group.quiescent) {
                (Some(holder), _) => format!("locked by {holder}"),
                (None, true) => "ready".to_string(),
                (None, false) => "settling".to_string(),
            };
            rows.push(vec![
                program.program.clone(),
                group.ts.clone(),
                state,
                group.vote_leader.clone().unwrap_or_else(|| "-".to_string()),
                group.best_host.clone().unwrap_or_else(|| "-".to_string()),
                hosts.join(", "),
            ]);
        }
    }
    print_table(&["PROGRAM", "GROUP", "STATE", "LEADER", "BEST", "HOSTS"], rows);
    println!();
    println!(
        "{} pending, {} invalid",
        report.pending_count(),
        report.invalid_pending_count()
    );
}
