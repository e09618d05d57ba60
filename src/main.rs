//! PostgreSQL backup rotation tool
//!
//! Takes daily `pg_dump` backups, promotes them to weekly and monthly tiers
//! by hard-linking, and prunes whatever falls outside the retention window.

// pgrotate/src/main.rs
mod backup;
mod config;
mod errors;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{load_backup_config_from_json, RawJsonConfig};
use dotenv::dotenv;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Rotating PostgreSQL backups
#[derive(Parser)]
#[command(name = "pgrotate")]
#[command(version, about = "Rotating PostgreSQL backups with daily, weekly and monthly retention", long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Take today's backups and prune expired ones
    Backup {
        /// Path to the JSON configuration file
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,

        /// Back up only this database (repeatable); overrides database_list
        #[arg(short = 'd', long = "database")]
        databases: Vec<String>,

        /// Print what would be created and deleted without doing it
        #[arg(long)]
        dry_run: bool,
    },
}

/// Exit status when the run finished but some artifacts failed.
const EXIT_PARTIAL_FAILURE: u8 = 2;

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pgrotate=info")))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    match run_app(cli).await {
        Ok(true) => {
            info!("Backup completed successfully.");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            warn!("Backup completed with errors.");
            ExitCode::from(EXIT_PARTIAL_FAILURE)
        }
        Err(e) => {
            error!("{:?}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every artifact was produced and pruned without error.
async fn run_app(cli: Cli) -> Result<bool> {
    match cli.command {
        Commands::Backup {
            config,
            databases,
            dry_run,
        } => {
            let raw_config = RawJsonConfig::load_from_json(&config)
                .with_context(|| format!("Failed to load application configuration from {}", config.display()))?;
            let backup_config = load_backup_config_from_json(&raw_config, &databases)
                .context("Failed to load backup configuration from JSON")?;
            backup_config.check_backup_user();

            let report = backup::run_backup_flow(&backup_config, dry_run)
                .await
                .context("Backup process failed")?;
            for e in &report.errors {
                error!("{}", e);
            }
            Ok(report.is_ok())
        }
    }
}
