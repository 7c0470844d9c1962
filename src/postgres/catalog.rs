use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tokio_postgres::NoTls;
use tracing::{debug, error, info};

use super::types::{BackupStop, Database, Lsn, Oid, ServerVersion, Tablespace};
use crate::config::ClusterConnection;
use crate::Result;

/// Metadata queries and the backup-mode window calls against the source cluster.
///
/// Everything except [`Catalog::start_backup`] and [`Catalog::stop_backup`]
/// is read-only.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn list_tablespaces(&self) -> Result<Vec<Tablespace>>;

    async fn list_databases(&self) -> Result<Vec<Database>>;

    async fn data_directory(&self) -> Result<PathBuf>;

    async fn server_version(&self) -> Result<ServerVersion>;

    /// Opens the backup-mode window; returns the backup start LSN.
    async fn start_backup(&self, label: &str, fast: bool) -> Result<Lsn>;

    async fn stop_backup(&self) -> Result<BackupStop>;

    /// Flush position of a streaming WAL receiver identified by its
    /// `application_name`, or `None` if no such receiver is streaming.
    async fn receiver_flush_lsn(&self, application_name: &str) -> Result<Option<Lsn>>;
}

/// Tablespaces and databases as seen at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogSnapshot {
    pub tablespaces: Vec<Tablespace>,
    pub databases: Vec<Database>,
}

impl CatalogSnapshot {
    pub async fn load<C: Catalog + ?Sized>(catalog: &C) -> Result<Self> {
        let tablespaces = catalog.list_tablespaces().await?;
        let databases = catalog.list_databases().await?;
        debug!(
            tablespaces = tablespaces.len(),
            databases = databases.len(),
            "Loaded catalog snapshot"
        );
        Ok(Self {
            tablespaces,
            databases,
        })
    }

    pub fn all_tablespace_oids(&self) -> BTreeSet<Oid> {
        self.tablespaces.iter().map(|t| t.oid).collect()
    }

    pub fn all_database_oids(&self) -> BTreeSet<Oid> {
        self.databases.iter().map(|d| d.oid).collect()
    }

    /// Resolves names to OIDs; also returns the names that matched nothing.
    pub fn tablespace_oids<'a, I>(&self, names: I) -> (BTreeSet<Oid>, Vec<String>)
    where
        I: IntoIterator<Item = &'a str>,
    {
        resolve_names(names, |name| {
            self.tablespaces
                .iter()
                .find(|t| t.name == name)
                .map(|t| t.oid)
        })
    }

    pub fn database_oids<'a, I>(&self, names: I) -> (BTreeSet<Oid>, Vec<String>)
    where
        I: IntoIterator<Item = &'a str>,
    {
        resolve_names(names, |name| {
            self.databases
                .iter()
                .find(|d| d.name == name)
                .map(|d| d.oid)
        })
    }

    pub fn tablespace(&self, oid: Oid) -> Option<&Tablespace> {
        self.tablespaces.iter().find(|t| t.oid == oid)
    }

    pub fn database(&self, oid: Oid) -> Option<&Database> {
        self.databases.iter().find(|d| d.oid == oid)
    }
}

fn resolve_names<'a, I, F>(names: I, lookup: F) -> (BTreeSet<Oid>, Vec<String>)
where
    I: IntoIterator<Item = &'a str>,
    F: Fn(&str) -> Option<Oid>,
{
    let mut oids = BTreeSet::new();
    let mut missing = Vec::new();
    for name in names {
        match lookup(name) {
            Some(oid) => {
                oids.insert(oid);
            }
            None => missing.push(name.to_string()),
        }
    }
    (oids, missing)
}

/// [`Catalog`] backed by a single tokio-postgres session.
///
/// Non-exclusive backups (PostgreSQL 15+) must be stopped from the session
/// that started them, so all calls go through the one client.
pub struct PgCatalog {
    client: tokio_postgres::Client,
    connection_task: tokio::task::JoinHandle<()>,
    version: ServerVersion,
}

impl PgCatalog {
    pub async fn connect(connection: &ClusterConnection) -> Result<Self> {
        info!(
            host = %connection.host,
            port = connection.port,
            user = %connection.user,
            "Connecting to source PostgreSQL cluster"
        );

        let config = connection.pg_config("pg_selective_replica");
        let (client, conn) = config.connect(NoTls).await?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = conn.await {
                error!("Connection error: {}", e);
            }
        });

        let row = client
            .query_one(
                "SELECT pg_catalog.current_setting('server_version_num')::int4",
                &[],
            )
            .await?;
        let version = ServerVersion(row.try_get(0)?);

        info!(server_version = %version, "Connected to source cluster");

        Ok(Self {
            client,
            connection_task,
            version,
        })
    }
}

impl Drop for PgCatalog {
    fn drop(&mut self) {
        debug!("Closing catalog connection");
        self.connection_task.abort();
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn list_tablespaces(&self) -> Result<Vec<Tablespace>> {
        let rows = self
            .client
            .query(
                "SELECT oid, spcname::text, pg_catalog.pg_tablespace_location(oid) \
                 FROM pg_catalog.pg_tablespace ORDER BY oid",
                &[],
            )
            .await?;

        rows.iter()
            .map(|row| -> Result<Tablespace> {
                let location: Option<String> = row.try_get(2)?;
                Ok(Tablespace {
                    oid: row.try_get(0)?,
                    name: row.try_get(1)?,
                    location: location.filter(|l| !l.is_empty()).map(PathBuf::from),
                })
            })
            .collect()
    }

    async fn list_databases(&self) -> Result<Vec<Database>> {
        let rows = self
            .client
            .query(
                "SELECT oid, datname::text, dattablespace \
                 FROM pg_catalog.pg_database ORDER BY oid",
                &[],
            )
            .await?;

        rows.iter()
            .map(|row| -> Result<Database> {
                Ok(Database {
                    oid: row.try_get(0)?,
                    name: row.try_get(1)?,
                    tablespace: row.try_get(2)?,
                })
            })
            .collect()
    }

    async fn data_directory(&self) -> Result<PathBuf> {
        let row = self
            .client
            .query_one("SELECT pg_catalog.current_setting('data_directory')", &[])
            .await?;
        let dir: String = row.try_get(0)?;
        Ok(PathBuf::from(dir))
    }

    async fn server_version(&self) -> Result<ServerVersion> {
        Ok(self.version)
    }

    async fn start_backup(&self, label: &str, fast: bool) -> Result<Lsn> {
        let sql = if self.version.non_exclusive_backup() {
            "SELECT pg_catalog.pg_backup_start($1, $2)::text"
        } else {
            "SELECT pg_catalog.pg_start_backup($1, $2)::text"
        };
        let row = self.client.query_one(sql, &[&label, &fast]).await?;
        let lsn: String = row.try_get(0)?;
        lsn.parse()
    }

    async fn stop_backup(&self) -> Result<BackupStop> {
        if self.version.non_exclusive_backup() {
            let row = self
                .client
                .query_one(
                    "SELECT lsn::text, labelfile, spcmapfile \
                     FROM pg_catalog.pg_backup_stop(false)",
                    &[],
                )
                .await?;
            let lsn: String = row.try_get(0)?;
            let label_file: Option<String> = row.try_get(1)?;
            let tablespace_map: Option<String> = row.try_get(2)?;
            Ok(BackupStop {
                lsn: lsn.parse()?,
                label_file: label_file.filter(|s| !s.is_empty()),
                tablespace_map: tablespace_map.filter(|s| !s.is_empty()),
            })
        } else {
            let row = self
                .client
                .query_one("SELECT pg_catalog.pg_stop_backup()::text", &[])
                .await?;
            let lsn: String = row.try_get(0)?;
            Ok(BackupStop {
                lsn: lsn.parse()?,
                label_file: None,
                tablespace_map: None,
            })
        }
    }

    async fn receiver_flush_lsn(&self, application_name: &str) -> Result<Option<Lsn>> {
        let sql = format!(
            "SELECT {}::text FROM pg_catalog.pg_stat_replication \
             WHERE application_name = $1 AND state = 'streaming'",
            self.version.flush_lsn_column()
        );
        let rows = self.client.query(sql.as_str(), &[&application_name]).await?;

        let mut best: Option<Lsn> = None;
        for row in &rows {
            let flushed: Option<String> = row.try_get(0)?;
            // A receiver that has not flushed anything yet still counts as streaming.
            let lsn = match flushed {
                Some(text) => text.parse()?,
                None => Lsn::default(),
            };
            best = Some(best.map_or(lsn, |b| b.max(lsn)));
        }
        Ok(best)
    }
}
