use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::{Error, Result};

/// The walbouncer configuration document, reduced to what a replica build needs.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub master: MasterConfig,
    #[serde(default)]
    pub configurations: Vec<HashMap<String, ProfileConfig>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MasterConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_dbname")]
    pub dbname: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileConfig {
    #[serde(default)]
    pub filter: Option<FilterConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub include_tablespaces: Vec<String>,
    #[serde(default)]
    pub exclude_tablespaces: Vec<String>,
    #[serde(default)]
    pub include_databases: Vec<String>,
    #[serde(default)]
    pub exclude_databases: Vec<String>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            // walbouncer configs are YAML whatever their extension.
            .add_source(config::File::from(path.as_ref()).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix("PG_SELECTIVE_REPLICA")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Looks up a named replica profile. An unknown name is an error.
    pub fn profile(&self, name: &str) -> Result<ReplicaProfile> {
        let found = self
            .configurations
            .iter()
            .find_map(|entry| entry.get(name));

        match found {
            Some(profile) => {
                let filter = profile.filter.clone().unwrap_or_default();
                if profile.filter.is_none() {
                    warn!(
                        replica = name,
                        "Replica profile has no filter; every tablespace and database will be copied"
                    );
                }
                Ok(ReplicaProfile::new(name, filter))
            }
            None => {
                let known: Vec<&str> = self
                    .configurations
                    .iter()
                    .flat_map(|entry| entry.keys().map(String::as_str))
                    .collect();
                Err(Error::Config(format!(
                    "replica profile '{}' not found in configuration (known profiles: {:?})",
                    name, known
                )))
            }
        }
    }

    /// Connection parameters for the source cluster; `fallback_user` is used
    /// when the configuration does not name one.
    pub fn connection(&self, fallback_user: &str) -> ClusterConnection {
        ClusterConnection {
            host: self.master.host.clone(),
            port: self.master.port,
            dbname: self.master.dbname.clone(),
            user: self
                .master
                .user
                .clone()
                .unwrap_or_else(|| fallback_user.to_string()),
            password: self.master.password.clone(),
            connect_timeout: Duration::from_secs(self.master.connect_timeout_secs),
        }
    }
}

/// Resolved connection parameters for the source cluster.
#[derive(Debug, Clone)]
pub struct ClusterConnection {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: Option<String>,
    pub connect_timeout: Duration,
}

impl ClusterConnection {
    pub fn pg_config(&self, application_name: &str) -> tokio_postgres::Config {
        let mut cfg = tokio_postgres::Config::new();
        cfg.host(&self.host)
            .port(self.port)
            .dbname(&self.dbname)
            .user(&self.user)
            .application_name(application_name)
            .connect_timeout(self.connect_timeout);
        if let Some(password) = &self.password {
            cfg.password(password);
        }
        cfg
    }
}

/// One named include/exclude filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaProfile {
    pub name: String,
    pub include_tablespaces: BTreeSet<String>,
    pub exclude_tablespaces: BTreeSet<String>,
    pub include_databases: BTreeSet<String>,
    pub exclude_databases: BTreeSet<String>,
}

impl ReplicaProfile {
    pub fn new(name: &str, filter: FilterConfig) -> Self {
        Self {
            name: name.to_string(),
            include_tablespaces: filter.include_tablespaces.into_iter().collect(),
            exclude_tablespaces: filter.exclude_tablespaces.into_iter().collect(),
            include_databases: filter.include_databases.into_iter().collect(),
            exclude_databases: filter.exclude_databases.into_iter().collect(),
        }
    }
}

/// Per-invocation settings for one replica build.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Destination data directory of the replica.
    pub destination: PathBuf,
    /// Where the capture process writes WAL until promotion.
    pub staging_dir: PathBuf,
    /// ssh/rsync user on the source host.
    pub copy_user: String,
    pub dry_run: bool,
    /// Upper bound for waiting on the capture process to start streaming.
    pub warmup: Duration,
    /// Upper bound for waiting on the last WAL segment before stopping capture.
    pub drain: Duration,
    pub poll_interval: Duration,
    /// How long a graceful stop of the capture process may take.
    pub stop_timeout: Duration,
    pub max_parallel_copies: usize,
    /// `application_name` the capture process reports to the source.
    pub capture_application_name: String,
}

impl RunOptions {
    pub fn new(destination: impl Into<PathBuf>, copy_user: impl Into<String>) -> Self {
        let destination = destination.into();
        let staging_dir = default_staging_dir(&destination);
        Self {
            destination,
            staging_dir,
            copy_user: copy_user.into(),
            dry_run: false,
            warmup: Duration::from_secs(default_warmup_secs()),
            drain: Duration::from_secs(default_drain_secs()),
            poll_interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(30),
            max_parallel_copies: default_parallel_copies(),
            capture_application_name: "pg_selective_replica_wal".to_string(),
        }
    }
}

/// `<destination>.wal_staging`, next to the destination so promotion is a rename.
pub fn default_staging_dir(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "pgdata".into());
    name.push(".wal_staging");
    destination.with_file_name(name)
}

fn default_port() -> u16 {
    5432
}

fn default_dbname() -> String {
    "postgres".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

pub fn default_warmup_secs() -> u64 {
    10
}

pub fn default_drain_secs() -> u64 {
    10
}

pub fn default_parallel_copies() -> usize {
    4
}
