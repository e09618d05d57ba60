use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Invalid {kind} identifier `{value}`: must be non-empty and contain neither `.` nor `/`")]
    InvalidIdentifier { kind: &'static str, value: String },

    #[error("Conflicting schema filter for {scope}: include_schemas and exclude_schemas are mutually exclusive")]
    ConflictingSchemaFilter { scope: String },

    #[error("Conflicting database filter: include_databases and exclude_databases are mutually exclusive")]
    ConflictingDatabaseFilter,

    #[error("Invalid pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Link source missing for {} and fallback dump failed: {fallback}", target.display())]
    LinkSourceMissing {
        target: PathBuf,
        #[source]
        fallback: Box<BackupError>,
    },

    #[error("Artifact conflict: {} already exists and is not the same file as {}", target.display(), source_path.display())]
    ArtifactConflict { target: PathBuf, source_path: PathBuf },

    #[error("Dump tool failed for {} with status {status}\nOutput: {output}", target.display())]
    DumpToolFailure {
        target: PathBuf,
        status: String,
        output: String,
    },

    #[error("Failed to delete expired artifact {}: {source}", path.display())]
    PruneDeleteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid backup file name: {0}")]
    InvalidArtifactName(String),

    #[error("{tool} executable not found: {source}")]
    ToolNotFound {
        tool: String,
        #[source]
        source: which::Error,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Catalog query failed: {0}")]
    Catalog(#[from] sqlx::Error),
}

impl BackupError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackupError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
