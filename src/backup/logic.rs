// pgrotate/src/backup/logic.rs
//! One backup run: decide which artifacts are due, produce them, then prune.
//!
//! State is never persisted between runs. Everything the run needs to know
//! about earlier runs is re-derived from the file names in `backup_dir`.

use chrono::NaiveDate;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::db_dump::{dump_to_path, DumpRequest, Dumper};
use super::linker::{promote, PromoteOutcome};
use super::naming::{ArtifactKind, ArtifactSeries, BackupArtifact, Tier};
use super::partition::{partition, BackupTarget};
use super::retention::{plan_prune, prune, scan_backup_dir};
use super::tiers::{last_seen_by_series, tiers_for};
use crate::config::RetentionPolicy;
use crate::errors::{BackupError, Result};

/// Identifies the server and day a run backs up.
pub struct RunContext<'a> {
    pub host: String,
    pub port: u16,
    pub date: NaiveDate,
    pub policy: &'a RetentionPolicy,
}

/// A target plus its schema names, listed only when partitioning needs them.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub target: BackupTarget,
    pub schemas: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum PlannedAction {
    Dump {
        artifact: BackupArtifact,
        request: DumpRequest,
    },
    /// Link from the first existing source, dumping `request` when none exists.
    Promote {
        artifact: BackupArtifact,
        sources: Vec<PathBuf>,
        request: DumpRequest,
    },
}

impl PlannedAction {
    pub fn artifact(&self) -> &BackupArtifact {
        match self {
            PlannedAction::Dump { artifact, .. } | PlannedAction::Promote { artifact, .. } => artifact,
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkPlan {
    pub actions: Vec<PlannedAction>,
}

impl WorkPlan {
    /// An existing dump target is kept as is. Promotions are always planned:
    /// the linker accepts a target that is already the same file and reports
    /// any other file there as a conflict.
    fn push(&mut self, action: PlannedAction) {
        if let PlannedAction::Dump { artifact, .. } = &action {
            if artifact.path.exists() {
                debug!("{} already exists; not producing it again", artifact.path.display());
                return;
            }
        }
        self.actions.push(action);
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &BackupArtifact> {
        self.actions.iter().map(PlannedAction::artifact)
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub produced: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
    pub errors: Vec<BackupError>,
}

impl RunReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Everything a run would do, without touching the filesystem.
#[derive(Debug, Default)]
pub struct DryRunReport {
    pub plan: WorkPlan,
    pub expired: Vec<BackupArtifact>,
}

/// Works out the artifacts due on `ctx.date`, given what is already on disk.
///
/// Targets are processed in database-name order. Within one series the daily
/// artifact is planned before the weekly and monthly ones linked from it.
pub fn plan_run(ctx: &RunContext, existing: &[BackupArtifact], targets: &[ResolvedTarget]) -> WorkPlan {
    let last_seen = last_seen_by_series(existing);
    let backup_dir = &ctx.policy.backup_dir;
    let mut plan = WorkPlan::default();

    if ctx.policy.enable_globals_backup {
        let series = ArtifactSeries::globals(&ctx.host, ctx.port);
        plan.push(PlannedAction::Dump {
            artifact: BackupArtifact::new(backup_dir, series, ctx.date, Tier::Daily),
            request: DumpRequest::Globals,
        });
    }

    let mut ordered: Vec<&ResolvedTarget> = targets.iter().collect();
    ordered.sort_by(|a, b| a.target.database.cmp(&b.target.database));

    for resolved in ordered {
        let database = &resolved.target.database;
        for item in partition(&resolved.target, &resolved.schemas, ctx.policy.separate_schema_dumps) {
            let series = ArtifactSeries {
                host: ctx.host.clone(),
                port: ctx.port,
                database: database.clone(),
                selector: item.selector,
                kind: ArtifactKind::PgDumpCustom,
            };
            let due = tiers_for(ctx.date, &last_seen.get(&series).copied().unwrap_or_default());
            let request = DumpRequest::Database {
                database: database.clone(),
                scope: item.scope,
            };
            let daily = BackupArtifact::new(backup_dir, series, ctx.date, Tier::Daily);

            for tier in due {
                let action = match tier {
                    Tier::Daily => PlannedAction::Dump {
                        artifact: daily.clone(),
                        request: request.clone(),
                    },
                    Tier::Weekly => PlannedAction::Promote {
                        artifact: daily.with_tier(Tier::Weekly),
                        sources: vec![daily.path.clone()],
                        request: request.clone(),
                    },
                    Tier::Monthly => PlannedAction::Promote {
                        artifact: daily.with_tier(Tier::Monthly),
                        sources: vec![daily.with_tier(Tier::Weekly).path, daily.path.clone()],
                        request: request.clone(),
                    },
                };
                plan.push(action);
            }
        }
    }
    plan
}

/// Carries out `plan`. A failed artifact is recorded and the rest still run.
pub fn execute_plan<D: Dumper + ?Sized>(dumper: &D, plan: &WorkPlan) -> RunReport {
    let mut report = RunReport::default();
    for action in &plan.actions {
        let target = &action.artifact().path;
        let result = match action {
            PlannedAction::Dump { request, .. } => {
                dump_to_path(dumper, request, target).map(|()| PromoteOutcome::Dumped)
            }
            PlannedAction::Promote { sources, request, .. } => {
                let sources: Vec<&Path> = sources.iter().map(PathBuf::as_path).collect();
                promote(&sources, target, || dump_to_path(dumper, request, target))
            }
        };
        match result {
            Ok(PromoteOutcome::AlreadyPresent) => debug!("{} already present", target.display()),
            Ok(outcome) => {
                info!("Created {} ({:?})", target.display(), outcome);
                report.produced.push(target.clone());
            }
            Err(e) => {
                warn!("Failed to produce {}: {}", target.display(), e);
                report.errors.push(e);
            }
        }
    }
    report
}

/// Produces every due artifact for `targets`, then prunes expired ones.
///
/// Only errors that stop the run before anything is produced (unreadable
/// backup directory) are returned as `Err`. Per-artifact failures and a failed
/// rescan before pruning land in the report.
pub fn run_backup<D: Dumper + ?Sized>(dumper: &D, ctx: &RunContext, targets: &[ResolvedTarget]) -> Result<RunReport> {
    let backup_dir = &ctx.policy.backup_dir;
    fs::create_dir_all(backup_dir).map_err(|e| BackupError::io(backup_dir, e))?;

    let existing = scan_backup_dir(backup_dir, &ctx.host, ctx.port)?;
    info!(
        "Found {} existing backup file(s) for {}:{} in {}",
        existing.len(),
        ctx.host,
        ctx.port,
        backup_dir.display()
    );

    let plan = plan_run(ctx, &existing, targets);
    let mut report = execute_plan(dumper, &plan);

    match scan_backup_dir(backup_dir, &ctx.host, ctx.port) {
        Ok(after) => {
            let pruned = prune(&plan_prune(&after, ctx.policy));
            report.deleted = pruned.deleted;
            report.errors.extend(pruned.failures);
        }
        Err(e) => {
            warn!("Skipping pruning, backup directory could not be rescanned: {}", e);
            report.errors.push(e);
        }
    }

    info!(
        "Backup run finished: {} created, {} deleted, {} error(s)",
        report.produced.len(),
        report.deleted.len(),
        report.errors.len()
    );
    Ok(report)
}

/// The plan and prune list `run_backup` would use, assuming every planned
/// artifact gets created.
pub fn dry_run(ctx: &RunContext, targets: &[ResolvedTarget]) -> Result<DryRunReport> {
    let backup_dir = &ctx.policy.backup_dir;
    let existing = if backup_dir.is_dir() {
        scan_backup_dir(backup_dir, &ctx.host, ctx.port)?
    } else {
        Vec::new()
    };
    let plan = plan_run(ctx, &existing, targets);

    let mut after = existing;
    after.extend(plan.artifacts().cloned());
    let expired = plan_prune(&after, ctx.policy);
    Ok(DryRunReport { plan, expired })
}
