#![forbid(unsafe_code)]

//! Operator CLI over the same facade the API uses.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tubevault_tools::{
    config::{RuntimeArgs, resolve_runtime_config},
    facade::Orchestrator,
    init_tracing,
    security::{ensure_not_root, ensure_private_dir},
    store::SettingsPatch,
};

#[derive(Parser, Debug)]
#[command(name = "download")]
#[command(about = "Manual downloads, subscriptions and runs from the command line")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    runtime: RuntimeArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download one video into its channel directory
    Get {
        url: String,
        #[arg(long)]
        audio_only: bool,
    },
    /// Print probed metadata without downloading
    Info { url: String },
    /// List subscriptions
    List,
    Subscribe {
        url: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        audio_only: bool,
    },
    Unsubscribe { id: String },
    /// Fetch new uploads for one subscription now
    Fetch { id: String },
    /// Fetch every subscription now, ignoring the schedule
    Run,
    /// Show or change the download settings
    Settings {
        #[arg(long)]
        preset: Option<String>,
        #[arg(long)]
        format: Option<String>,
        #[arg(long)]
        hardlink: Option<bool>,
    },
    /// Show or change the daily schedule
    Schedule {
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long)]
        hour: Option<i64>,
        #[arg(long)]
        minute: Option<i64>,
    },
    /// Print the crontab line for the configured schedule
    TriggerEntry {
        /// Command cron should run; defaults to routine_update next to this binary
        #[arg(long)]
        command: Option<String>,
    },
    Logs {
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Update the extraction tool itself
    SelfUpdate,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    ensure_not_root("download")?;

    let config = resolve_runtime_config(cli.runtime.into())?;
    ensure_private_dir(&config.data_dir)?;
    let orchestrator =
        Orchestrator::from_config(&config).context("initializing orchestrator")?;

    execute(&orchestrator, cli.command)
}

fn execute(orchestrator: &Orchestrator, command: Command) -> Result<()> {
    match command {
        Command::Get { url, audio_only } => {
            let outcome = orchestrator.download(&url, audio_only)?;
            println!("{}", outcome.summary());
            if !outcome.success {
                bail!("download failed");
            }
        }
        Command::Info { url } => {
            let info = orchestrator.get_video_info(&url)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::List => {
            for subscription in orchestrator.list_subscriptions() {
                println!(
                    "{}\t{}\t{}{}",
                    subscription.id,
                    subscription.display_name,
                    subscription.source_url,
                    if subscription.audio_only { "\t(audio)" } else { "" }
                );
            }
        }
        Command::Subscribe {
            url,
            name,
            audio_only,
        } => {
            let subscription =
                orchestrator.add_subscription(&url, name.as_deref(), Some(audio_only))?;
            println!(
                "Subscribed to {} ({})",
                subscription.display_name, subscription.id
            );
        }
        Command::Unsubscribe { id } => {
            let removed = orchestrator.remove_subscription(&id)?;
            println!("Removed {} ({})", removed.display_name, removed.id);
        }
        Command::Fetch { id } => {
            let outcome = orchestrator.fetch_now(&id)?;
            println!("{}", outcome.summary());
            for failure in &outcome.failures {
                println!("  {} [{}]: {}", failure.video_id, failure.kind.as_str(), failure.error);
            }
            if !outcome.success {
                bail!("fetch failed");
            }
        }
        Command::Run => {
            let report = orchestrator.run_now();
            for outcome in &report.outcomes {
                println!("{}", outcome.summary());
            }
            println!(
                "{:?}: {} new download(s)",
                report.status,
                report.downloaded()
            );
        }
        Command::Settings {
            preset,
            format,
            hardlink,
        } => {
            let settings = if preset.is_none() && format.is_none() && hardlink.is_none() {
                orchestrator.get_settings()
            } else {
                orchestrator.update_settings(&SettingsPatch {
                    quality_preset: preset,
                    format_expression: format,
                    auto_hardlink: hardlink,
                })?
            };
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Command::Schedule {
            enabled,
            hour,
            minute,
        } => {
            let current = orchestrator.get_schedule();
            let schedule = if enabled.is_none() && hour.is_none() && minute.is_none() {
                current
            } else {
                orchestrator.update_schedule(
                    enabled.unwrap_or(current.enabled),
                    hour.unwrap_or(i64::from(current.hour)),
                    minute.unwrap_or(i64::from(current.minute)),
                )?
            };
            println!(
                "{} at {:02}:{:02} ({})",
                if schedule.enabled { "enabled" } else { "disabled" },
                schedule.hour,
                schedule.minute,
                schedule.cron_expression()
            );
        }
        Command::TriggerEntry { command } => {
            let command = match command {
                Some(command) => command,
                None => default_trigger_command()?,
            };
            println!("{}", orchestrator.trigger_entry(&command));
        }
        Command::Logs { tail } => {
            for line in orchestrator.get_logs(tail)? {
                println!("{line}");
            }
        }
        Command::SelfUpdate => {
            println!("{}", orchestrator.self_update()?);
        }
    }
    Ok(())
}

fn default_trigger_command() -> Result<String> {
    let exe = std::env::current_exe().context("locating current executable")?;
    Ok(exe
        .with_file_name("routine_update")
        .to_string_lossy()
        .into_owned())
}
