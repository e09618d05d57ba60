// pgrotate/src/backup/db_dump.rs
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};
use which::which;

use super::partition::DumpScope;
use crate::config::ConnectionSettings;
use crate::errors::{BackupError, Result};

const PG_DUMP_ENV: &str = "PG_DUMP_CMD";
const PG_DUMPALL_ENV: &str = "PG_DUMPALL_CMD";

/// A request for the external dump tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpRequest {
    Database { database: String, scope: DumpScope },
    /// Cluster-wide roles and tablespaces.
    Globals,
}

impl DumpRequest {
    pub fn describe(&self) -> String {
        match self {
            DumpRequest::Database { database, scope } => match scope {
                DumpScope::Full => format!("database {}", database),
                DumpScope::Schemas(schemas) => format!("database {} (schemas: {})", database, schemas.join(", ")),
                DumpScope::Shell(_) => format!("database {} (shell only)", database),
            },
            DumpRequest::Globals => "cluster globals".to_string(),
        }
    }
}

/// Produces a dump file. Only the exit status of the tool is interpreted.
pub trait Dumper {
    fn dump(&self, request: &DumpRequest, output: &Path) -> Result<()>;
}

/// Runs the dump into a temporary file next to `target` and renames it into
/// place on success, so a failed dump never occupies the canonical name.
pub fn dump_to_path<D: Dumper + ?Sized>(dumper: &D, request: &DumpRequest, target: &Path) -> Result<()> {
    let dir = target
        .parent()
        .ok_or_else(|| BackupError::Config(format!("{} has no parent directory", target.display())))?;
    let temp_path = tempfile::Builder::new()
        .prefix(".pgrotate-")
        .suffix(".partial")
        .tempfile_in(dir)
        .map_err(|e| BackupError::io(dir, e))?
        .into_temp_path();

    dumper.dump(request, &temp_path)?;

    temp_path
        .persist(target)
        .map_err(|e| BackupError::io(target, e.error))?;
    Ok(())
}

/// A program plus the leading arguments it was configured with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ToolCommand {
    /// Resolves `configured`, then the environment override, then `PATH`.
    ///
    /// Overrides are split on whitespace, e.g. `PG_DUMP_CMD="sudo -u postgres pg_dump"`.
    pub fn resolve(tool: &str, configured: Option<&str>, env_var: &str) -> Result<Self> {
        let command_line = configured
            .map(str::to_string)
            .or_else(|| env::var(env_var).ok())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| tool.to_string());

        let mut words = command_line.split_whitespace().map(str::to_string);
        let program = words.next().unwrap_or_else(|| tool.to_string());
        let program = which(&program).map_err(|source| BackupError::ToolNotFound {
            tool: program.clone(),
            source,
        })?;
        Ok(ToolCommand {
            program,
            args: words.collect(),
        })
    }
}

/// `pg_dump` / `pg_dumpall` backed dumper.
#[derive(Debug, Clone)]
pub struct PgDumpTool {
    pg_dump: ToolCommand,
    pg_dumpall: Option<ToolCommand>,
    connection: ConnectionSettings,
}

impl PgDumpTool {
    pub fn new(pg_dump: ToolCommand, pg_dumpall: Option<ToolCommand>, connection: ConnectionSettings) -> Self {
        PgDumpTool {
            pg_dump,
            pg_dumpall,
            connection,
        }
    }

    /// Locates the tools; `pg_dumpall` is only required when globals are backed up.
    pub fn locate(
        connection: ConnectionSettings,
        pg_dump_cmd: Option<&str>,
        pg_dumpall_cmd: Option<&str>,
        need_globals: bool,
    ) -> Result<Self> {
        let pg_dump = ToolCommand::resolve("pg_dump", pg_dump_cmd, PG_DUMP_ENV)?;
        info!("Found pg_dump executable at: {}", pg_dump.program.display());
        let pg_dumpall = if need_globals {
            let cmd = ToolCommand::resolve("pg_dumpall", pg_dumpall_cmd, PG_DUMPALL_ENV)?;
            info!("Found pg_dumpall executable at: {}", cmd.program.display());
            Some(cmd)
        } else {
            None
        };
        Ok(PgDumpTool::new(pg_dump, pg_dumpall, connection))
    }

    fn connection_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(user) = &self.connection.username {
            args.push("-U".into());
            args.push(user.into());
        }
        if let Some(host) = &self.connection.hostname {
            args.push("-h".into());
            args.push(host.into());
        }
        if let Some(port) = self.connection.port {
            args.push("-p".into());
            args.push(port.to_string().into());
        }
        args
    }

    fn command_for(&self, request: &DumpRequest, output: &Path) -> Result<(ToolCommand, Vec<OsString>)> {
        let mut args: Vec<OsString> = Vec::new();
        match request {
            DumpRequest::Database { database, scope } => {
                args.push("--format=c".into());
                args.extend(self.connection_args());
                args.push("-d".into());
                args.push(database.into());
                args.push("-f".into());
                args.push(output.into());
                let (switch, schemas) = match scope {
                    DumpScope::Full => return Ok((self.pg_dump.clone(), args)),
                    DumpScope::Schemas(schemas) => ("-n", schemas),
                    DumpScope::Shell(schemas) => ("-N", schemas),
                };
                for schema in schemas {
                    args.push(switch.into());
                    args.push(quote_schema(schema).into());
                }
                Ok((self.pg_dump.clone(), args))
            }
            DumpRequest::Globals => {
                let pg_dumpall = self
                    .pg_dumpall
                    .clone()
                    .ok_or_else(|| BackupError::Config("pg_dumpall was not located".to_string()))?;
                args.extend(self.connection_args());
                args.push("--globals-only".into());
                args.push("--database=template1".into());
                args.push("-f".into());
                args.push(output.into());
                Ok((pg_dumpall, args))
            }
        }
    }
}

/// `-n`/`-N` take patterns: quoting keeps the name's case and stops `*`
/// and `?` from acting as wildcards.
fn quote_schema(schema: &str) -> String {
    format!("\"{}\"", schema.replace('"', "\"\""))
}

impl Dumper for PgDumpTool {
    fn dump(&self, request: &DumpRequest, output: &Path) -> Result<()> {
        let (tool, args) = self.command_for(request, output)?;
        info!("Dumping {} with {}", request.describe(), tool.program.display());
        debug!("Arguments: {:?} {:?}", tool.args, args);

        let cmd_output = Command::new(&tool.program)
            .args(&tool.args)
            .args(&args)
            .output()
            .map_err(|e| BackupError::io(&tool.program, e))?;

        if !cmd_output.status.success() {
            return Err(BackupError::DumpToolFailure {
                target: output.to_path_buf(),
                status: cmd_output.status.to_string(),
                output: format!(
                    "{}{}",
                    String::from_utf8_lossy(&cmd_output.stdout),
                    String::from_utf8_lossy(&cmd_output.stderr)
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::fs;
    use tempfile::TempDir;

    fn tool() -> PgDumpTool {
        let cmd = |name: &str| ToolCommand {
            program: PathBuf::from(format!("/usr/bin/{}", name)),
            args: vec![],
        };
        PgDumpTool::new(
            cmd("pg_dump"),
            Some(cmd("pg_dumpall")),
            ConnectionSettings {
                hostname: Some("db1".to_string()),
                port: Some(6543),
                username: Some("backup".to_string()),
            },
        )
    }

    fn strs(args: &[OsString]) -> Vec<&str> {
        args.iter().map(|a| a.to_str().unwrap()).collect()
    }

    #[test]
    fn test_pg_dump_arguments_for_schema_subset() -> anyhow::Result<()> {
        let request = DumpRequest::Database {
            database: "app".to_string(),
            scope: DumpScope::Schemas(vec!["s1".to_string(), "s2".to_string()]),
        };
        let (cmd, args) = tool().command_for(&request, Path::new("/b/out"))?;
        assert_eq!(cmd.program, PathBuf::from("/usr/bin/pg_dump"));
        assert_eq!(
            strs(&args),
            vec![
                "--format=c", "-U", "backup", "-h", "db1", "-p", "6543", "-d", "app", "-f", "/b/out", "-n", "\"s1\"",
                "-n", "\"s2\""
            ]
        );
        Ok(())
    }

    #[test]
    fn test_shell_dump_excludes_every_schema() -> anyhow::Result<()> {
        let request = DumpRequest::Database {
            database: "app".to_string(),
            scope: DumpScope::Shell(vec!["public".to_string()]),
        };
        let (_, args) = tool().command_for(&request, Path::new("/b/out"))?;
        assert_eq!(strs(&args[args.len() - 2..]), vec!["-N", "\"public\""]);
        Ok(())
    }

    #[test]
    fn test_schema_names_keep_case_and_literal_characters() -> anyhow::Result<()> {
        let request = DumpRequest::Database {
            database: "app".to_string(),
            scope: DumpScope::Schemas(vec!["Billing".to_string(), "odd\"name*".to_string()]),
        };
        let (_, args) = tool().command_for(&request, Path::new("/b/out"))?;
        assert_eq!(
            strs(&args[args.len() - 4..]),
            vec!["-n", "\"Billing\"", "-n", "\"odd\"\"name*\""]
        );
        Ok(())
    }

    #[test]
    fn test_full_dump_has_no_schema_switches() -> anyhow::Result<()> {
        let request = DumpRequest::Database {
            database: "app".to_string(),
            scope: DumpScope::Full,
        };
        let (_, args) = tool().command_for(&request, Path::new("/b/out"))?;
        assert_eq!(strs(&args[args.len() - 2..]), vec!["-f", "/b/out"]);
        assert!(!strs(&args).iter().any(|a| *a == "-n" || *a == "-N"));
        Ok(())
    }

    #[test]
    fn test_globals_arguments() -> anyhow::Result<()> {
        let (cmd, args) = tool().command_for(&DumpRequest::Globals, Path::new("/b/g"))?;
        assert_eq!(cmd.program, PathBuf::from("/usr/bin/pg_dumpall"));
        assert!(strs(&args).contains(&"--globals-only"));

        let without = PgDumpTool::new(tool().pg_dump, None, ConnectionSettings::default());
        assert!(matches!(
            without.command_for(&DumpRequest::Globals, Path::new("/b/g")),
            Err(BackupError::Config(_))
        ));
        Ok(())
    }

    struct WritingDumper {
        fail: bool,
        calls: Cell<usize>,
    }

    impl Dumper for WritingDumper {
        fn dump(&self, _request: &DumpRequest, output: &Path) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            fs::write(output, b"partial").map_err(|e| BackupError::io(output, e))?;
            if self.fail {
                return Err(BackupError::DumpToolFailure {
                    target: output.to_path_buf(),
                    status: "exit status: 1".to_string(),
                    output: String::new(),
                });
            }
            Ok(())
        }
    }

    #[test]
    fn test_dump_to_path_renames_on_success() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let target = dir.path().join("localhost.5432.app.all_schemas.2024-01-01.daily.pg_dump.Fc");
        let dumper = WritingDumper {
            fail: false,
            calls: Cell::new(0),
        };
        dump_to_path(&dumper, &DumpRequest::Globals, &target)?;
        assert_eq!(fs::read(&target)?, b"partial");
        assert_eq!(fs::read_dir(dir.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn test_dump_to_path_leaves_nothing_on_failure() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let target = dir.path().join("localhost.5432.app.all_schemas.2024-01-01.daily.pg_dump.Fc");
        let dumper = WritingDumper {
            fail: true,
            calls: Cell::new(0),
        };
        let result = dump_to_path(&dumper, &DumpRequest::Globals, &target);
        assert!(matches!(result, Err(BackupError::DumpToolFailure { .. })));
        assert_eq!(dumper.calls.get(), 1);
        assert_eq!(fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }
}
