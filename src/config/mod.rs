// pgrotate/src/config/mod.rs
use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::backup::naming::{self, validate_identifier, Tier, DEFAULT_PORT};
use crate::backup::partition::{BackupTarget, PatternFilter};
use crate::errors::{BackupError, Result};

// Structs for deserializing config.json

/// A boolean given either as JSON `true`/`false` or as yes/no/true/false text.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum JsonBool {
    Bool(bool),
    Text(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum JsonPort {
    Number(u16),
    Text(String),
}

/// One pattern or a list of patterns.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum JsonPatterns {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonSchemaOptions {
    pub include_schemas: Option<JsonPatterns>,
    pub exclude_schemas: Option<JsonPatterns>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub backup_user: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<JsonPort>,
    pub username: Option<String>,
    pub backup_dir: Option<PathBuf>,
    pub enable_globals_backups: Option<JsonBool>,
    pub separate_schema_dumps: Option<JsonBool>,
    pub include_databases: Option<JsonPatterns>,
    pub exclude_databases: Option<JsonPatterns>,
    pub include_schemas: Option<JsonPatterns>,
    pub exclude_schemas: Option<JsonPatterns>,
    pub days_to_keep: Option<u32>,
    pub weeks_to_keep: Option<u32>,
    pub months_to_keep: Option<u32>,
    pub database_list: Option<serde_json::Value>,
    pub pg_dump_cmd: Option<String>,
    pub pg_dumpall_cmd: Option<String>,
}

impl RawJsonConfig {
    pub fn load_from_json(config_path: &Path) -> anyhow::Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        serde_json::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse JSON from config file at {}",
                config_path.display()
            )
        })
    }
}

// Application's internal configuration structs

/// Connection to the database server, passed through to the dump tools.
/// Unset values are left to the tools' own defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
}

impl ConnectionSettings {
    pub fn host_label(&self) -> String {
        naming::host_label(self.hostname.as_deref())
    }

    pub fn port_label(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}

/// One retention policy applies to the whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub days_to_keep: u32,
    pub weeks_to_keep: u32,
    pub months_to_keep: u32,
    pub backup_dir: PathBuf,
    pub separate_schema_dumps: bool,
    pub enable_globals_backup: bool,
}

impl RetentionPolicy {
    /// Number of buckets retained for `tier`.
    pub fn keep(&self, tier: Tier) -> usize {
        let count = match tier {
            Tier::Daily => self.days_to_keep,
            Tier::Weekly => self.weeks_to_keep,
            Tier::Monthly => self.months_to_keep,
        };
        count as usize
    }
}

#[derive(Debug, Clone)]
pub enum DatabaseSelection {
    /// Databases named in the config or on the command line.
    Explicit(Vec<BackupTarget>),
    /// Every regular database on the server passing `databases`.
    Discover {
        databases: PatternFilter,
        schemas: PatternFilter,
    },
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub policy: RetentionPolicy,
    pub connection: ConnectionSettings,
    pub selection: DatabaseSelection,
    pub backup_user: Option<String>,
    pub pg_dump_cmd: Option<String>,
    pub pg_dumpall_cmd: Option<String>,
}

impl BackupConfig {
    /// Warns when the run is not performed by the configured backup user.
    pub fn check_backup_user(&self) {
        if let Some(expected) = &self.backup_user {
            match env::var("USER") {
                Ok(actual) if &actual != expected => warn!(
                    "Running as `{}` but backup_user is `{}`; file ownership may differ from earlier runs",
                    actual, expected
                ),
                Ok(_) => {}
                Err(_) => warn!("USER is not set; cannot verify backup_user `{}`", expected),
            }
        }
    }
}

/// Validates the raw configuration. Every error here is fatal and is raised
/// before any backup I/O.
///
/// A non-empty `cli_databases` replaces `database_list` and database discovery.
pub fn load_backup_config_from_json(raw_config: &RawJsonConfig, cli_databases: &[String]) -> Result<BackupConfig> {
    let backup_dir = raw_config
        .backup_dir
        .clone()
        .ok_or_else(|| BackupError::Config("backup_dir must be set in config.json".to_string()))?;
    if backup_dir.as_os_str().is_empty() {
        return Err(BackupError::Config("backup_dir cannot be empty in config.json.".to_string()));
    }

    let policy = RetentionPolicy {
        days_to_keep: raw_config.days_to_keep.unwrap_or(0),
        weeks_to_keep: raw_config.weeks_to_keep.unwrap_or(0),
        months_to_keep: raw_config.months_to_keep.unwrap_or(0),
        backup_dir,
        separate_schema_dumps: parse_bool("separate_schema_dumps", &raw_config.separate_schema_dumps)?,
        enable_globals_backup: parse_bool("enable_globals_backups", &raw_config.enable_globals_backups)?,
    };
    if policy.days_to_keep == 0 && policy.weeks_to_keep == 0 && policy.months_to_keep == 0 {
        warn!("days_to_keep, weeks_to_keep and months_to_keep are all 0; every backup will be pruned right after it is made");
    }

    let hostname = non_empty(&raw_config.hostname);
    if let Some(host) = hostname.as_deref() {
        // a leading `/` names a unix-socket directory
        if host.contains('/') && !host.starts_with('/') {
            return Err(BackupError::Config(format!("hostname is not a host name or socket directory: {}", host)));
        }
    }
    let connection = ConnectionSettings {
        hostname,
        port: parse_port(&raw_config.port)?,
        username: non_empty(&raw_config.username),
    };

    let schema_filter = PatternFilter::from_patterns(
        &patterns(&raw_config.include_schemas),
        &patterns(&raw_config.exclude_schemas),
        || BackupError::ConflictingSchemaFilter {
            scope: "all databases".to_string(),
        },
    )?;
    let database_filter = PatternFilter::from_patterns(
        &patterns(&raw_config.include_databases),
        &patterns(&raw_config.exclude_databases),
        || BackupError::ConflictingDatabaseFilter,
    )?;

    let listed = parse_database_list(&raw_config.database_list)?;
    let selection = if !cli_databases.is_empty() {
        let targets = cli_databases
            .iter()
            .map(|name| {
                let options = listed.as_ref().and_then(|l| l.get(name)).cloned().unwrap_or_default();
                build_target(name, &options, &schema_filter)
            })
            .collect::<Result<Vec<_>>>()?;
        DatabaseSelection::Explicit(targets)
    } else if let Some(listed) = listed {
        if listed.is_empty() {
            return Err(BackupError::Config("database_list in config.json is empty".to_string()));
        }
        let targets = listed
            .iter()
            .map(|(name, options)| build_target(name, options, &schema_filter))
            .collect::<Result<Vec<_>>>()?;
        DatabaseSelection::Explicit(targets)
    } else {
        DatabaseSelection::Discover {
            databases: database_filter.clone(),
            schemas: schema_filter,
        }
    };
    if matches!(selection, DatabaseSelection::Explicit(_)) && database_filter.is_active() {
        warn!("include_databases/exclude_databases are ignored when databases are listed explicitly");
    }

    Ok(BackupConfig {
        policy,
        connection,
        selection,
        backup_user: non_empty(&raw_config.backup_user),
        pg_dump_cmd: non_empty(&raw_config.pg_dump_cmd),
        pg_dumpall_cmd: non_empty(&raw_config.pg_dumpall_cmd),
    })
}

fn build_target(name: &str, options: &JsonSchemaOptions, default_filter: &PatternFilter) -> Result<BackupTarget> {
    validate_identifier("database", name)?;
    let schema_filter = if options.include_schemas.is_some() || options.exclude_schemas.is_some() {
        PatternFilter::from_patterns(
            &patterns(&options.include_schemas),
            &patterns(&options.exclude_schemas),
            || BackupError::ConflictingSchemaFilter {
                scope: format!("database {}", name),
            },
        )?
    } else {
        default_filter.clone()
    };
    Ok(BackupTarget {
        database: name.to_string(),
        schema_filter,
    })
}

/// Parses `database_list`: either `["db1", "db2"]` or an object keyed by
/// database name whose values carry per-database schema options, e.g.
/// `{"app": {"include_schemas": "^billing"}, "crm": {}}`.
fn parse_database_list(
    database_list: &Option<serde_json::Value>,
) -> Result<Option<BTreeMap<String, JsonSchemaOptions>>> {
    match database_list {
        Some(value) if value.is_array() => {
            let databases: Vec<String> = serde_json::from_value(value.clone())
                .map_err(|e| BackupError::Config(format!("Failed to parse database_list as array: {}", e)))?;
            Ok(Some(
                databases
                    .into_iter()
                    .map(|db| (db, JsonSchemaOptions::default()))
                    .collect(),
            ))
        }
        Some(value) if value.is_object() => {
            let mapping: BTreeMap<String, JsonSchemaOptions> = serde_json::from_value(value.clone())
                .map_err(|e| BackupError::Config(format!("Failed to parse database_list as mapping object: {}", e)))?;
            Ok(Some(mapping))
        }
        Some(_) => Err(BackupError::Config(
            "database_list must be either an array of database names or a mapping object".to_string(),
        )),
        None => Ok(None),
    }
}

fn parse_bool(key: &str, value: &Option<JsonBool>) -> Result<bool> {
    match value {
        None => Ok(false),
        Some(JsonBool::Bool(b)) => Ok(*b),
        Some(JsonBool::Text(text)) => match text.trim().to_ascii_lowercase().as_str() {
            "yes" | "true" => Ok(true),
            "no" | "false" | "" => Ok(false),
            _ => Err(BackupError::Config(format!(
                "{} is not a boolean value: {}",
                key, text
            ))),
        },
    }
}

fn parse_port(value: &Option<JsonPort>) -> Result<Option<u16>> {
    match value {
        None => Ok(None),
        Some(JsonPort::Number(port)) => Ok(Some(*port)),
        Some(JsonPort::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(JsonPort::Text(text)) => text
            .trim()
            .parse::<u16>()
            .map(Some)
            .map_err(|_| BackupError::Config(format!("port is not a valid port number: {}", text))),
    }
}

fn patterns(value: &Option<JsonPatterns>) -> Vec<String> {
    let list = match value {
        None => Vec::new(),
        Some(JsonPatterns::One(pattern)) => vec![pattern.clone()],
        Some(JsonPatterns::Many(list)) => list.clone(),
    };
    list.into_iter().filter(|p| !p.is_empty()).collect()
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}
