// pgrotate/src/backup/linker.rs
//! Tier promotion by hard-linking.
//!
//! A promoted artifact shares storage with its source: both directory entries
//! name the same inode and either may be deleted without affecting the other.
//! Linking is always tried before dumping again, because a second dump later
//! the same day may capture a different snapshot.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{info, warn};

use crate::errors::{BackupError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoteOutcome {
    /// A new hard link was created.
    Linked,
    /// The target already exists: shared with the source, or dumped by an earlier run.
    AlreadyPresent,
    /// No source existed; the fallback dump produced the target.
    Dumped,
}

/// True when both paths name the same underlying file.
#[cfg(unix)]
pub fn same_file(a: &Path, b: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let (ma, mb) = (fs::metadata(a)?, fs::metadata(b)?);
    Ok(ma.dev() == mb.dev() && ma.ino() == mb.ino())
}

#[cfg(not(unix))]
pub fn same_file(a: &Path, b: &Path) -> std::io::Result<bool> {
    Ok(fs::canonicalize(a)? == fs::canonicalize(b)?)
}

/// Hard-links `target` to `source`.
///
/// Idempotent: an existing target that is already the same file is accepted;
/// any other file at `target` is an `ArtifactConflict`.
pub fn link_artifact(source: &Path, target: &Path) -> Result<PromoteOutcome> {
    if target.exists() {
        return if same_file(source, target).map_err(|e| BackupError::io(target, e))? {
            Ok(PromoteOutcome::AlreadyPresent)
        } else {
            Err(BackupError::ArtifactConflict {
                target: target.to_path_buf(),
                source_path: source.to_path_buf(),
            })
        };
    }

    match fs::hard_link(source, target) {
        Ok(()) => {
            info!("Hard-linked {} to {}", source.display(), target.display());
            Ok(PromoteOutcome::Linked)
        }
        // lost a race with something else creating the target
        Err(e) if e.kind() == ErrorKind::AlreadyExists => link_artifact(source, target),
        Err(e) => Err(BackupError::io(target, e)),
    }
}

/// Produces a higher-tier artifact from the first existing candidate source,
/// or by calling `fallback_dump` when none exists.
///
/// Fails with `LinkSourceMissing` only when the fallback dump fails too.
pub fn promote<F>(sources: &[&Path], target: &Path, fallback_dump: F) -> Result<PromoteOutcome>
where
    F: FnOnce() -> Result<()>,
{
    if let Some(source) = sources.iter().find(|p| p.is_file()) {
        return link_artifact(source, target);
    }

    if target.exists() {
        // An earlier run produced it by dumping directly.
        return Ok(PromoteOutcome::AlreadyPresent);
    }

    warn!(
        "No artifact to link {} from; falling back to a fresh dump",
        target.display()
    );
    fallback_dump().map_err(|e| BackupError::LinkSourceMissing {
        target: target.to_path_buf(),
        fallback: Box::new(e),
    })?;
    Ok(PromoteOutcome::Dumped)
}
