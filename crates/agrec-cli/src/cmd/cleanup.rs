use crate::output::{print_json, print_table};
use agrec_core::config::Config;
use agrec_core::coordinator::{GroupOutcome, Report};
use anyhow::Context;
use tracing::info;

pub fn run(config: &Config, json: bool) -> anyhow::Result<()> {
    let coordinator = super::coordinator(config)?;
    info!(host = coordinator.hostname(), "consolidation pass starting");
    let report = coordinator.run().context("consolidation pass failed")?;

    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }

    let failed = report.failed();
    if failed > 0 {
        anyhow::bail!("{failed} group(s) failed to consolidate");
    }
    Ok(())
}

fn print_report(report: &Report) {
    if report.groups.is_empty() {
        println!("No work groups.");
        return;
    }
    let rows = report
        .groups
        .iter()
        .map(|g| {
            let (outcome, detail) = describe(&g.outcome);
            vec![g.program.clone(), g.ts.clone(), outcome.to_string(), detail]
        })
        .collect();
    print_table(&["PROGRAM", "GROUP", "OUTCOME", "DETAIL"], rows);
    println!();
    println!(
        "{} consolidated, {} failed, {} index(es) updated",
        report.consolidated(),
        report.failed(),
        report.indexed.len()
    );
}

fn describe(outcome: &GroupOutcome) -> (&'static str, String) {
    match outcome {
        GroupOutcome::NotQuiescent => ("not quiescent", String::new()),
        GroupOutcome::NoHosts => ("no hosts", String::new()),
        GroupOutcome::LockedBy { host } => ("locked", format!("by {host}")),
        GroupOutcome::LostVote { winner } => (
            "lost vote",
            winner
                .as_deref()
                .map(|w| format!("to {w}"))
                .unwrap_or_else(|| "no votes".to_string()),
        ),
        GroupOutcome::LockContention { holder } => ("contended", format!("held by {holder}")),
        GroupOutcome::AlreadyConsolidated => ("already consolidated", String::new()),
        GroupOutcome::Consolidated {
            winner,
            error_count,
            disposition,
        } => (
            "consolidated",
            format!(
                "winner {winner} ({error_count} errors), {} deleted, {} archived",
                disposition.deleted.len(),
                disposition.archived.len()
            ),
        ),
        GroupOutcome::Failed { error } => ("failed", error.clone()),
    }
}
