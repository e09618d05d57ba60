pub mod db_dump;
pub mod linker;
pub mod logic;
pub mod naming;
pub mod partition;
pub mod retention;
pub mod tiers;

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{info, warn};

use crate::config::{BackupConfig, DatabaseSelection};
use crate::errors::BackupError;
use crate::utils::catalog::Catalog;
use db_dump::PgDumpTool;
use logic::{dry_run, run_backup, ResolvedTarget, RunContext, RunReport};
use naming::validate_identifier;
use partition::BackupTarget;

/// Public entry point for the backup process.
///
/// Returns `Err` only for fatal problems (catalog unreachable, dump tool
/// missing, unusable backup directory). Failures confined to one database or
/// artifact are collected in the report.
pub async fn run_backup_flow(config: &BackupConfig, dry_run_only: bool) -> Result<RunReport> {
    let host = config.connection.host_label();
    let port = config.connection.port_label();
    let date = Local::now().date_naive();
    info!(
        "Backing up {}:{} into {} for {}",
        host,
        port,
        config.policy.backup_dir.display(),
        date
    );

    let mut errors = Vec::new();
    let targets = resolve_targets(config, &mut errors).await?;

    if dry_run_only {
        let ctx = RunContext {
            host,
            port,
            date,
            policy: &config.policy,
        };
        let report = dry_run(&ctx, &targets).context("Failed to plan the backup run")?;
        for action in &report.plan.actions {
            println!("would create {}", action.artifact().path.display());
        }
        for artifact in &report.expired {
            println!("would delete {}", artifact.path.display());
        }
        return Ok(RunReport {
            errors,
            ..Default::default()
        });
    }

    let tool = PgDumpTool::locate(
        config.connection.clone(),
        config.pg_dump_cmd.as_deref(),
        config.pg_dumpall_cmd.as_deref(),
        config.policy.enable_globals_backup,
    )
    .context("Failed to locate PostgreSQL dump tools")?;

    // pg_dump blocks; keep it off the async worker threads
    let policy = config.policy.clone();
    let mut report = tokio::task::spawn_blocking(move || {
        let ctx = RunContext {
            host,
            port,
            date,
            policy: &policy,
        };
        run_backup(&tool, &ctx, &targets)
    })
    .await
    .context("Backup task panicked")?
    .context("Backup run failed")?;

    errors.append(&mut report.errors);
    report.errors = errors;
    Ok(report)
}

/// Turns the configured selection into concrete targets. Discovered names and
/// schema listings that fail are recorded in `errors` and skipped.
async fn resolve_targets(config: &BackupConfig, errors: &mut Vec<BackupError>) -> Result<Vec<ResolvedTarget>> {
    let separate = config.policy.separate_schema_dumps;
    let needs_catalog = match &config.selection {
        DatabaseSelection::Discover { .. } => true,
        DatabaseSelection::Explicit(targets) => targets.iter().any(|t| t.needs_schema_listing(separate)),
    };
    let catalog = if needs_catalog {
        Some(Catalog::new(&config.connection)?)
    } else {
        None
    };

    let targets = match (&config.selection, &catalog) {
        (DatabaseSelection::Explicit(targets), _) => targets.clone(),
        (DatabaseSelection::Discover { databases, schemas }, Some(catalog)) => {
            let names = catalog
                .list_databases()
                .await
                .context("Failed to list databases on the server")?;
            let mut targets = Vec::new();
            for name in databases.apply(&names) {
                if let Err(e) = validate_identifier("database", &name) {
                    warn!("Skipping database: {}", e);
                    errors.push(e);
                    continue;
                }
                targets.push(BackupTarget {
                    database: name,
                    schema_filter: schemas.clone(),
                });
            }
            targets
        }
        (DatabaseSelection::Discover { .. }, None) => Vec::new(),
    };
    if targets.is_empty() {
        warn!("No databases selected for backup");
    }

    let mut resolved = Vec::with_capacity(targets.len());
    for target in targets {
        let schemas = match (&catalog, target.needs_schema_listing(separate)) {
            (Some(catalog), true) => match list_valid_schemas(catalog, &target.database, errors).await {
                Ok(schemas) => schemas,
                Err(e) => {
                    warn!("Skipping database {}: {}", target.database, e);
                    errors.push(e);
                    continue;
                }
            },
            _ => Vec::new(),
        };
        resolved.push(ResolvedTarget { target, schemas });
    }
    Ok(resolved)
}

async fn list_valid_schemas(
    catalog: &Catalog,
    database: &str,
    errors: &mut Vec<BackupError>,
) -> crate::errors::Result<Vec<String>> {
    let mut schemas = Vec::new();
    for schema in catalog.list_schemas(database).await? {
        match validate_identifier("schema", &schema) {
            Ok(()) => schemas.push(schema),
            Err(e) => {
                warn!("Skipping schema of database {}: {}", database, e);
                errors.push(e);
            }
        }
    }
    Ok(schemas)
}
