// pgrotate/src/backup/retention.rs
//! Directory inventory and retention pruning.
//!
//! Within each tier, artifacts are grouped into buckets (day, ISO week,
//! month) and only the N most recent buckets survive. Pruning does not need to
//! care about shared inodes: removing one hard link leaves the others intact.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::naming::{ArtifactSeries, BackupArtifact, Tier};
use super::tiers::{bucket, Bucket};
use crate::config::RetentionPolicy;
use crate::errors::{BackupError, Result};

/// Lists the artifacts in `backup_dir` that belong to `host`/`port`.
///
/// Files whose names do not follow the naming scheme (temporary dumps,
/// foreign files) are ignored.
pub fn scan_backup_dir(backup_dir: &Path, host: &str, port: u16) -> Result<Vec<BackupArtifact>> {
    let mut artifacts = Vec::new();
    for entry in WalkDir::new(backup_dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(backup_dir).to_path_buf();
            BackupError::io(path, e.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        match BackupArtifact::from_path(entry.path()) {
            Ok(artifact) if artifact.series.host == host && artifact.series.port == port => {
                artifacts.push(artifact)
            }
            Ok(artifact) => debug!("Ignoring artifact of another server: {}", artifact.path.display()),
            Err(e) => debug!("Ignoring {}: {}", entry.path().display(), e),
        }
    }
    artifacts.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(artifacts)
}

/// Artifacts that fall outside the retention window.
///
/// Buckets are counted per series, so a database whose dumps keep failing
/// still holds its last `*_to_keep` buckets of each tier. Database artifacts
/// keep that many buckets; a count of 0 keeps nothing. Globals artifacts keep
/// only their most recent date, whatever the counts.
pub fn plan_prune(existing: &[BackupArtifact], policy: &RetentionPolicy) -> Vec<BackupArtifact> {
    let mut by_series: HashMap<&ArtifactSeries, Vec<&BackupArtifact>> = HashMap::new();
    for artifact in existing {
        by_series.entry(&artifact.series).or_default().push(artifact);
    }

    let mut expired = Vec::new();
    for (series, artifacts) in &by_series {
        if series.is_globals() {
            expired.extend(expired_in(artifacts, 1, |a| Bucket::Day(a.date)));
            continue;
        }
        for tier in Tier::ALL {
            let in_tier: Vec<&BackupArtifact> = artifacts.iter().copied().filter(|a| a.tier == tier).collect();
            expired.extend(expired_in(&in_tier, policy.keep(tier), |a| bucket(tier, a.date)));
        }
    }

    expired.sort_by(|a, b| a.path.cmp(&b.path));
    expired
}

fn expired_in(
    artifacts: &[&BackupArtifact],
    keep: usize,
    bucket_of: impl Fn(&BackupArtifact) -> Bucket,
) -> Vec<BackupArtifact> {
    let buckets: BTreeSet<Bucket> = artifacts.iter().map(|a| bucket_of(*a)).collect();
    let retained: BTreeSet<Bucket> = buckets.into_iter().rev().take(keep).collect();
    artifacts
        .iter()
        .filter(|a| !retained.contains(&bucket_of(**a)))
        .map(|a| (*a).clone())
        .collect()
}

#[derive(Debug, Default)]
pub struct PruneReport {
    pub deleted: Vec<PathBuf>,
    pub failures: Vec<BackupError>,
}

/// Deletes `expired`. A failed deletion is recorded and pruning continues.
pub fn prune(expired: &[BackupArtifact]) -> PruneReport {
    let mut report = PruneReport::default();
    for artifact in expired {
        match fs::remove_file(&artifact.path) {
            Ok(()) => {
                info!("Deleted expired backup file {}", artifact.path.display());
                report.deleted.push(artifact.path.clone());
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Expired backup file already gone: {}", artifact.path.display());
            }
            Err(source) => {
                let error = BackupError::PruneDeleteFailure {
                    path: artifact.path.clone(),
                    source,
                };
                warn!("{}", error);
                report.failures.push(error);
            }
        }
    }
    report
}
