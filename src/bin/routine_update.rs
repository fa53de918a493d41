#![forbid(unsafe_code)]

//! Entry point for the system job runner. Install the line printed by
//! `download trigger-entry` into the service account's crontab; each
//! invocation checks the stored schedule and, when due, fetches every
//! subscription once.

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use tubevault_tools::{
    config::{RuntimeArgs, resolve_runtime_config},
    facade::Orchestrator,
    init_tracing,
    scheduler::{RunReport, RunStatus},
    security::{ensure_not_root, ensure_private_dir},
};

#[derive(Parser, Debug)]
#[command(name = "routine_update")]
#[command(about = "Fetch new uploads for every subscription when the schedule is due")]
#[command(version)]
struct RoutineArgs {
    #[command(flatten)]
    runtime: RuntimeArgs,

    /// Run now regardless of the stored schedule
    #[arg(long)]
    force: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let args = RoutineArgs::parse();
    ensure_not_root("routine_update")?;

    let config = resolve_runtime_config(args.runtime.into())?;
    ensure_private_dir(&config.data_dir)?;
    let orchestrator =
        Orchestrator::from_config(&config).context("initializing orchestrator")?;

    let report = if args.force {
        orchestrator.run_now()
    } else {
        orchestrator.run_scheduled(Local::now())
    };
    for line in summarize(&report) {
        println!("{line}");
    }
    Ok(())
}

/// Console summary. Failed channels are listed but never turn into a
/// non-zero exit: they are already in the run log.
fn summarize(report: &RunReport) -> Vec<String> {
    match report.status {
        RunStatus::Disabled => vec!["Schedule disabled; nothing to do.".to_string()],
        RunStatus::NotDue => vec!["Not the scheduled time; nothing to do.".to_string()],
        RunStatus::AlreadyRunning => vec!["A run is already in progress.".to_string()],
        RunStatus::Completed => {
            let mut lines: Vec<String> = report
                .outcomes
                .iter()
                .map(|outcome| outcome.summary())
                .collect();
            lines.push(format!(
                "Run complete: {} subscription(s), {} new download(s), {} failed channel(s).",
                report.outcomes.len(),
                report.downloaded(),
                report.failed_channels()
            ));
            lines
        }
    }
}
