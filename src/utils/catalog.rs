// pgrotate/src/utils/catalog.rs
//! Database and schema discovery through the server catalog.

use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tracing::{debug, info};
use url::Url;

use crate::config::ConnectionSettings;
use crate::errors::{BackupError, Result};

/// Database used for server-wide catalog queries.
const MAINTENANCE_DATABASE: &str = "template1";

/// Databases never backed up even when discovered.
const SKIPPED_DATABASES: &[&str] = &["template0", "template1", "postgres"];

pub struct Catalog {
    base_url: Url,
}

impl Catalog {
    /// Builds the connection URL. A hostname starting with `/` is a
    /// unix-socket directory and is passed as the `host` query parameter.
    pub fn new(connection: &ConnectionSettings) -> Result<Self> {
        let mut base_url = Url::parse("postgres://localhost")
            .map_err(|e| BackupError::Config(format!("Invalid PostgreSQL URL: {}", e)))?;

        match connection.hostname.as_deref() {
            Some(socket_dir) if socket_dir.starts_with('/') => {
                base_url.query_pairs_mut().append_pair("host", socket_dir);
            }
            Some(host) => base_url
                .set_host(Some(host))
                .map_err(|e| BackupError::Config(format!("Invalid hostname {}: {}", host, e)))?,
            None => {}
        }
        if let Some(port) = connection.port {
            base_url
                .set_port(Some(port))
                .map_err(|_| BackupError::Config(format!("Invalid port {}", port)))?;
        }
        if let Some(user) = connection.username.as_deref() {
            base_url
                .set_username(user)
                .map_err(|_| BackupError::Config(format!("Invalid username {}", user)))?;
        }
        Ok(Catalog { base_url })
    }

    pub fn database_url(&self, database: &str) -> String {
        let mut url = self.base_url.clone();
        url.set_path(database);
        url.to_string()
    }

    async fn connect(&self, database: &str) -> Result<PgPool> {
        debug!("Connecting to database {} for catalog queries", database);
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&self.database_url(database))
            .await?;
        Ok(pool)
    }

    /// Regular databases accepting connections, sorted by name.
    pub async fn list_databases(&self) -> Result<Vec<String>> {
        let pool = self.connect(MAINTENANCE_DATABASE).await?;
        let rows = sqlx::query(
            "SELECT datname FROM pg_database \
             WHERE datallowconn AND NOT datistemplate \
             ORDER BY datname",
        )
        .fetch_all(&pool)
        .await?;
        pool.close().await;

        let mut databases = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("datname")?;
            if !SKIPPED_DATABASES.contains(&name.as_str()) {
                databases.push(name);
            }
        }
        info!("Discovered {} database(s)", databases.len());
        Ok(databases)
    }

    /// User schemas of `database`, sorted by name.
    pub async fn list_schemas(&self, database: &str) -> Result<Vec<String>> {
        let pool = self.connect(database).await?;
        let rows = sqlx::query(
            "SELECT nspname FROM pg_namespace \
             WHERE nspname NOT LIKE 'pg\\_%' AND nspname <> 'information_schema' \
             ORDER BY nspname",
        )
        .fetch_all(&pool)
        .await?;
        pool.close().await;

        rows.iter()
            .map(|row| row.try_get::<String, _>("nspname").map_err(BackupError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_url_from_settings() -> anyhow::Result<()> {
        let catalog = Catalog::new(&ConnectionSettings {
            hostname: Some("db1.internal".to_string()),
            port: Some(6543),
            username: Some("backup".to_string()),
        })?;
        assert_eq!(catalog.database_url("app"), "postgres://backup@db1.internal:6543/app");
        Ok(())
    }

    #[test]
    fn test_database_url_defaults() -> anyhow::Result<()> {
        let catalog = Catalog::new(&ConnectionSettings::default())?;
        assert_eq!(catalog.database_url("template1"), "postgres://localhost/template1");
        Ok(())
    }

    #[test]
    fn test_socket_directory_becomes_query_parameter() -> anyhow::Result<()> {
        let catalog = Catalog::new(&ConnectionSettings {
            hostname: Some("/var/run/postgresql".to_string()),
            ..Default::default()
        })?;
        assert_eq!(
            catalog.database_url("app"),
            "postgres://localhost/app?host=%2Fvar%2Frun%2Fpostgresql"
        );
        Ok(())
    }
}
