use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use kura_config::{DEFAULT_DIRECTIVES, KuraSettings, SettingsSource, init_tracing};
use kura_queue::{CommandStore, SqliteCommandStore, SystemClock, WorkType};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "kura-queuectl", about = "Inspect and repair the Kura command queue")]
struct Cli {
    /// Overrides the database URL from settings.
    #[arg(long, global = true)]
    database_url: Option<String>,
    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show queued and failed counts per work type
    Status,
    /// List terminally failed and quarantined commands
    Failed {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Remove every command of a batch
    ClearBatch { batch: String },
    /// Remove every command of the given work types
    ClearWorkType {
        #[arg(required = true)]
        work_types: Vec<String>,
    },
    /// Remove every command, including failed ones
    Clear {
        #[arg(long)]
        yes: bool,
    },
    /// Return commands left running by a crashed process to the queue.
    /// Only safe while no dispatcher is attached to the database.
    Recover {
        #[arg(long)]
        yes: bool,
    },
    /// Delete failed and quarantined commands
    PurgeFailed,
}

#[derive(Serialize)]
struct Status {
    queued: u64,
    failed: u64,
    by_work_type: Vec<(WorkType, u64)>,
}

/// Destructive subcommands only run with an explicit `--yes`.
fn confirm(yes: bool, action: &str) -> Result<()> {
    if yes {
        Ok(())
    } else {
        Err(anyhow!("refusing to {action} without --yes"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (settings, source) = KuraSettings::load_from_env()?;
    init_tracing(settings.log_filter.as_deref().unwrap_or(DEFAULT_DIRECTIVES));

    match &source {
        SettingsSource::Default => info!("no settings file found; using defaults"),
        SettingsSource::EnvPath(path) => {
            info!(path = %path.display(), "settings loaded from env path")
        }
        SettingsSource::EnvInline => info!("settings loaded from inline environment json"),
        SettingsSource::File(path) => info!(path = %path.display(), "settings loaded from file"),
    }

    let url = cli.database_url.as_deref().unwrap_or(&settings.database_url);
    let store = SqliteCommandStore::connect(url, Arc::new(SystemClock))
        .await
        .with_context(|| format!("failed to open command store at {url}"))?;

    match cli.command {
        Command::Status => {
            let mut by_work_type = Vec::new();
            for work_type in WorkType::ALL {
                let count = store.queued_count(&[work_type]).await?;
                if count > 0 {
                    by_work_type.push((work_type, count));
                }
            }
            let status = Status {
                queued: store.queued_count(&[]).await?,
                failed: store.failed_count().await?,
                by_work_type,
            };
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("queued: {}", status.queued);
                println!("failed: {}", status.failed);
                for (work_type, count) in &status.by_work_type {
                    println!("  {work_type:<10} {count}");
                }
            }
        }
        Command::Failed { limit } => {
            let failed = store.list_failed(limit).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&failed)?);
            } else if failed.is_empty() {
                println!("no failed commands");
            } else {
                for request in failed {
                    println!(
                        "{} [{}] {} retries={}/{} error={}",
                        request.id,
                        request.state.as_str(),
                        request.class_name,
                        request.retries,
                        request.max_retries,
                        request.last_error.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        Command::ClearBatch { batch } => {
            let removed = store.clear_batch(&batch).await?;
            println!("removed {removed} commands from batch {batch}");
        }
        Command::ClearWorkType { work_types } => {
            let work_types = work_types
                .iter()
                .map(|raw| raw.parse::<WorkType>())
                .collect::<Result<Vec<_>, _>>()?;
            let removed = store.clear_work_types(&work_types).await?;
            println!("removed {removed} commands");
        }
        Command::Clear { yes } => {
            confirm(yes, "clear the whole queue")?;
            let removed = store.clear().await?;
            println!("removed {removed} commands");
        }
        Command::Recover { yes } => {
            confirm(
                yes,
                "requeue running commands while a dispatcher may still be executing \
                 them; stop the server first, or they run twice",
            )?;
            warn!("requeueing running commands; no dispatcher may be using this database");
            let recovered = store.recover_running().await?;
            println!("requeued {recovered} interrupted commands");
        }
        Command::PurgeFailed => {
            let purged = store.purge_failed().await?;
            println!("purged {purged} failed commands");
        }
    }

    Ok(())
}
