// pgrotate/src/backup/naming.rs
//! Canonical artifact file names.
//!
//! Pattern: `hostname.port.database.schema.date.backup_type.suffix`, where the
//! suffix is `globals.sql` or `pg_dump.Fc`. No component other than the suffix
//! may contain a `.`, which is what keeps the name parseable by splitting.

use chrono::NaiveDate;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::errors::{BackupError, Result};

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const DEFAULT_HOST_LABEL: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5432;
/// Database label used by cluster-wide (globals) artifacts.
pub const GLOBALS_DATABASE_LABEL: &str = "database_na";

const DELIMITER: char = '.';
// host, port, database, schema, date, tier + the two-part suffix
const NUM_FILENAME_PARTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    Daily,
    Weekly,
    Monthly,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Daily, Tier::Weekly, Tier::Monthly];

    pub fn label(self) -> &'static str {
        match self {
            Tier::Daily => "daily",
            Tier::Weekly => "weekly",
            Tier::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Tier {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "daily" => Ok(Tier::Daily),
            "weekly" => Ok(Tier::Weekly),
            "monthly" => Ok(Tier::Monthly),
            other => Err(BackupError::InvalidArtifactName(format!(
                "unknown backup type `{}`",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactKind {
    GlobalsSql,
    PgDumpCustom,
}

impl ArtifactKind {
    pub fn suffix(self) -> &'static str {
        match self {
            ArtifactKind::GlobalsSql => "globals.sql",
            ArtifactKind::PgDumpCustom => "pg_dump.Fc",
        }
    }

    fn from_suffix(suffix: &str) -> Result<Self> {
        match suffix {
            "globals.sql" => Ok(ArtifactKind::GlobalsSql),
            "pg_dump.Fc" => Ok(ArtifactKind::PgDumpCustom),
            other => Err(BackupError::InvalidArtifactName(format!(
                "invalid backup suffix `{}`",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SchemaSelector {
    /// Unfiltered dump, or a dump restricted to the filtered schema set.
    AllSchemas,
    /// Database-shell or globals artifact.
    NoSchemas,
    Schema(String),
}

impl SchemaSelector {
    pub const ALL_SCHEMAS_LABEL: &'static str = "all_schemas";
    pub const NO_SCHEMAS_LABEL: &'static str = "no_schemas";

    pub fn label(&self) -> &str {
        match self {
            SchemaSelector::AllSchemas => Self::ALL_SCHEMAS_LABEL,
            SchemaSelector::NoSchemas => Self::NO_SCHEMAS_LABEL,
            SchemaSelector::Schema(name) => name,
        }
    }

    fn from_label(label: &str) -> Self {
        match label {
            Self::ALL_SCHEMAS_LABEL => SchemaSelector::AllSchemas,
            Self::NO_SCHEMAS_LABEL => SchemaSelector::NoSchemas,
            name => SchemaSelector::Schema(name.to_string()),
        }
    }
}

/// Everything that identifies an artifact except its date and tier.
///
/// Artifacts of one series, sorted by date, are the history of a single
/// logical backup; retention and tier classification both work on them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactSeries {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub selector: SchemaSelector,
    pub kind: ArtifactKind,
}

impl ArtifactSeries {
    pub fn globals(host: &str, port: u16) -> Self {
        ArtifactSeries {
            host: host.to_string(),
            port,
            database: GLOBALS_DATABASE_LABEL.to_string(),
            selector: SchemaSelector::NoSchemas,
            kind: ArtifactKind::GlobalsSql,
        }
    }

    pub fn is_globals(&self) -> bool {
        self.kind == ArtifactKind::GlobalsSql
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackupArtifact {
    pub series: ArtifactSeries,
    pub date: NaiveDate,
    pub tier: Tier,
    pub path: PathBuf,
}

impl BackupArtifact {
    pub fn new(backup_dir: &Path, series: ArtifactSeries, date: NaiveDate, tier: Tier) -> Self {
        let path = backup_dir.join(file_name(&series, date, tier));
        BackupArtifact {
            series,
            date,
            tier,
            path,
        }
    }

    /// Same series and date, different tier, same directory.
    pub fn with_tier(&self, tier: Tier) -> Self {
        let dir = self.path.parent().unwrap_or_else(|| Path::new(""));
        BackupArtifact::new(dir, self.series.clone(), self.date, tier)
    }

    /// Describes an existing backup file from its name.
    pub fn from_path(path: &Path) -> Result<Self> {
        let basename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| BackupError::InvalidArtifactName(path.display().to_string()))?;

        let parts: Vec<&str> = basename.split(DELIMITER).collect();
        if parts.len() != NUM_FILENAME_PARTS {
            return Err(BackupError::InvalidArtifactName(basename.to_string()));
        }

        let port = parts[1].parse::<u16>().map_err(|_| {
            BackupError::InvalidArtifactName(format!("{} contains invalid port {}", basename, parts[1]))
        })?;
        let date = NaiveDate::parse_from_str(parts[4], DATE_FORMAT).map_err(|_| {
            BackupError::InvalidArtifactName(format!("{} contains invalid date {}", basename, parts[4]))
        })?;
        let tier = parts[5].parse::<Tier>()?;
        let kind = ArtifactKind::from_suffix(&format!("{}.{}", parts[6], parts[7]))?;

        Ok(BackupArtifact {
            series: ArtifactSeries {
                host: parts[0].to_string(),
                port,
                database: parts[2].to_string(),
                selector: SchemaSelector::from_label(parts[3]),
                kind,
            },
            date,
            tier,
            path: path.to_path_buf(),
        })
    }
}

/// The naming function: maps an artifact's identity to its file name.
pub fn file_name(series: &ArtifactSeries, date: NaiveDate, tier: Tier) -> String {
    format!(
        "{host}.{port}.{database}.{schema}.{date}.{tier}.{suffix}",
        host = series.host,
        port = series.port,
        database = series.database,
        schema = series.selector.label(),
        date = date.format(DATE_FORMAT),
        tier = tier.label(),
        suffix = series.kind.suffix(),
    )
}

/// Normalised host label for file names.
///
/// Unset, loopback and unix-socket hosts become `localhost`; a qualified
/// name keeps only its leading component. The label never contains `/`.
pub fn host_label(hostname: Option<&str>) -> String {
    let hostname = match hostname.map(str::trim) {
        None | Some("") | Some("127.0.0.1") | Some("::1") => DEFAULT_HOST_LABEL,
        Some(h) if h.contains('/') => DEFAULT_HOST_LABEL,
        Some(h) => h,
    };
    match hostname.split_once(DELIMITER) {
        Some((head, _)) if !head.is_empty() => head.to_string(),
        Some(_) => DEFAULT_HOST_LABEL.to_string(),
        None => hostname.to_string(),
    }
}

/// Rejects names that would break file-name parsing.
pub fn validate_identifier(kind: &'static str, value: &str) -> Result<()> {
    let reserved = kind == "schema"
        && (value == SchemaSelector::ALL_SCHEMAS_LABEL || value == SchemaSelector::NO_SCHEMAS_LABEL);
    if value.is_empty() || value.contains(DELIMITER) || value.contains('/') || value.contains('\0') || reserved {
        return Err(BackupError::InvalidIdentifier {
            kind,
            value: value.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_series(selector: SchemaSelector) -> ArtifactSeries {
        ArtifactSeries {
            host: "localhost".to_string(),
            port: 5432,
            database: "app".to_string(),
            selector,
            kind: ArtifactKind::PgDumpCustom,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_file_name_format() {
        let name = file_name(&app_series(SchemaSelector::AllSchemas), date(2024, 1, 8), Tier::Weekly);
        assert_eq!(name, "localhost.5432.app.all_schemas.2024-01-08.weekly.pg_dump.Fc");

        let globals = file_name(&ArtifactSeries::globals("db1", 6543), date(2016, 12, 4), Tier::Daily);
        assert_eq!(globals, "db1.6543.database_na.no_schemas.2016-12-04.daily.globals.sql");
    }

    #[test]
    fn test_parse_back_into_components() -> anyhow::Result<()> {
        let dir = Path::new("/var/backups/pg");
        let original = BackupArtifact::new(
            dir,
            app_series(SchemaSelector::Schema("billing".to_string())),
            date(2024, 2, 29),
            Tier::Monthly,
        );
        let parsed = BackupArtifact::from_path(&original.path)?;
        assert_eq!(parsed, original);

        let shell = BackupArtifact::new(dir, app_series(SchemaSelector::NoSchemas), date(2024, 3, 1), Tier::Daily);
        assert_eq!(BackupArtifact::from_path(&shell.path)?.series.selector, SchemaSelector::NoSchemas);
        Ok(())
    }

    #[test]
    fn test_distinct_identities_give_distinct_names() {
        let d = date(2024, 1, 1);
        let names = [
            file_name(&app_series(SchemaSelector::AllSchemas), d, Tier::Daily),
            file_name(&app_series(SchemaSelector::NoSchemas), d, Tier::Daily),
            file_name(&app_series(SchemaSelector::Schema("public".into())), d, Tier::Daily),
            file_name(&app_series(SchemaSelector::AllSchemas), d, Tier::Weekly),
            file_name(&app_series(SchemaSelector::AllSchemas), date(2024, 1, 2), Tier::Daily),
            file_name(&ArtifactSeries::globals("localhost", 5432), d, Tier::Daily),
        ];
        let unique: std::collections::HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
    }

    #[test]
    fn test_parse_rejects_malformed_names() {
        let bad = [
            "a.backup.file",
            "localhost.5432.adb.aschema.12-04-2016.daily.pg_dump.Fc",
            "localhost.5432.adb.aschema.2016-12-04.daily.bad.suffix",
            "localhost.5432.adb.aschema.2016-12-04.hourly.pg_dump.Fc",
            "localhost.port.adb.aschema.2016-12-04.daily.pg_dump.Fc",
            ".pgrotate-tmp123",
        ];
        for name in bad {
            assert!(
                BackupArtifact::from_path(Path::new(name)).is_err(),
                "{} should not parse",
                name
            );
        }
    }

    #[test]
    fn test_host_label() {
        assert_eq!(host_label(None), "localhost");
        assert_eq!(host_label(Some("")), "localhost");
        assert_eq!(host_label(Some("127.0.0.1")), "localhost");
        assert_eq!(host_label(Some("db1.example.com")), "db1");
        assert_eq!(host_label(Some("passed")), "passed");
        assert_eq!(host_label(Some("/var/run/postgresql")), "localhost");
    }

    #[test]
    fn test_socket_host_stays_inside_backup_dir() {
        let series = ArtifactSeries {
            host: host_label(Some("/var/run/postgresql")),
            ..app_series(SchemaSelector::AllSchemas)
        };
        let artifact = BackupArtifact::new(Path::new("/srv/backups"), series, date(2024, 1, 8), Tier::Daily);
        assert!(artifact.path.starts_with("/srv/backups"));
        assert_eq!(artifact.path.parent(), Some(Path::new("/srv/backups")));
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("database", "app_prod-2").is_ok());
        assert!(validate_identifier("schema", "public").is_ok());
        assert!(matches!(
            validate_identifier("database", "app.prod"),
            Err(BackupError::InvalidIdentifier { kind: "database", .. })
        ));
        assert!(validate_identifier("database", "").is_err());
        assert!(validate_identifier("schema", "a/b").is_err());
        assert!(validate_identifier("schema", "all_schemas").is_err());
        assert!(validate_identifier("database", "all_schemas").is_ok());
    }
}
