#![allow(dead_code)]

use async_trait::async_trait;
use pg_selective_replica::capture::WalCapture;
use pg_selective_replica::config::{ClusterConnection, RunOptions};
use pg_selective_replica::copy::{CopyJob, FileCopier};
use pg_selective_replica::postgres::{
    BackupStop, Catalog, CatalogSnapshot, Database, Lsn, ServerVersion, Tablespace,
};
use pg_selective_replica::{Error, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Something one of the mocks was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ListTablespaces,
    ListDatabases,
    DataDirectory,
    ServerVersion,
    StartBackup { label: String, fast: bool },
    StopBackup,
    Probe,
    CaptureStart,
    CaptureStop,
    Copy(String),
}

#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    /// Events other than the readiness probes, which repeat.
    pub fn steps(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| *e != Event::Probe)
            .collect()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    pub fn position<P: Fn(&Event) -> bool>(&self, predicate: P) -> Option<usize> {
        self.events().iter().position(predicate)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Probe {
    Streaming(Lsn),
    NotStreaming,
    Unavailable,
}

pub struct MockCatalog {
    log: EventLog,
    pub snapshot: CatalogSnapshot,
    pub version: ServerVersion,
    pub fail_start: bool,
    pub fail_stop: bool,
    pub probe: Probe,
    pub label_file: Option<String>,
}

impl MockCatalog {
    pub fn new(log: &EventLog) -> Self {
        Self {
            log: log.clone(),
            snapshot: sample_snapshot(),
            version: ServerVersion(160_002),
            fail_start: false,
            fail_stop: false,
            probe: Probe::Streaming(Lsn(u64::MAX)),
            label_file: Some(
                "START WAL LOCATION: 0/2000028 (file 000000010000000000000002)\n".to_string(),
            ),
        }
    }
}

#[async_trait]
impl Catalog for MockCatalog {
    async fn list_tablespaces(&self) -> Result<Vec<Tablespace>> {
        self.log.push(Event::ListTablespaces);
        Ok(self.snapshot.tablespaces.clone())
    }

    async fn list_databases(&self) -> Result<Vec<Database>> {
        self.log.push(Event::ListDatabases);
        Ok(self.snapshot.databases.clone())
    }

    async fn data_directory(&self) -> Result<PathBuf> {
        self.log.push(Event::DataDirectory);
        Ok(PathBuf::from("/var/lib/postgresql/16/main"))
    }

    async fn server_version(&self) -> Result<ServerVersion> {
        self.log.push(Event::ServerVersion);
        Ok(self.version)
    }

    async fn start_backup(&self, label: &str, fast: bool) -> Result<Lsn> {
        self.log.push(Event::StartBackup {
            label: label.to_string(),
            fast,
        });
        if self.fail_start {
            return Err(Error::Catalog {
                message: "a backup is already in progress".to_string(),
            });
        }
        Ok(Lsn(0x0200_0028))
    }

    async fn stop_backup(&self) -> Result<BackupStop> {
        self.log.push(Event::StopBackup);
        if self.fail_stop {
            return Err(Error::Catalog {
                message: "connection reset by peer".to_string(),
            });
        }
        Ok(BackupStop {
            lsn: Lsn(0x0200_0138),
            label_file: self.label_file.clone(),
            tablespace_map: None,
        })
    }

    async fn receiver_flush_lsn(&self, _application_name: &str) -> Result<Option<Lsn>> {
        self.log.push(Event::Probe);
        match self.probe {
            Probe::Streaming(lsn) => Ok(Some(lsn)),
            Probe::NotStreaming => Ok(None),
            Probe::Unavailable => Err(Error::Catalog {
                message: "permission denied for pg_stat_replication".to_string(),
            }),
        }
    }
}

pub struct MockCapture {
    log: EventLog,
    pub fail_start: bool,
    pub fail_stop: bool,
    /// Reported by `has_exited` once started.
    pub exits: bool,
    started: bool,
}

impl MockCapture {
    pub fn new(log: &EventLog) -> Self {
        Self {
            log: log.clone(),
            fail_start: false,
            fail_stop: false,
            exits: false,
            started: false,
        }
    }
}

pub const STAGED_SEGMENT: &str = "000000010000000000000002";

#[async_trait]
impl WalCapture for MockCapture {
    fn application_name(&self) -> &str {
        "mock_capture"
    }

    async fn start(&mut self, staging_dir: &Path) -> Result<()> {
        self.log.push(Event::CaptureStart);
        if self.fail_start {
            return Err(Error::Launch {
                message: "pg_receivewal: not found".to_string(),
            });
        }
        if staging_dir.is_dir() {
            std::fs::write(staging_dir.join(format!("{}.partial", STAGED_SEGMENT)), "wal")?;
        }
        self.started = true;
        Ok(())
    }

    fn has_exited(&mut self) -> Result<bool> {
        Ok(self.started && self.exits)
    }

    async fn stop(&mut self) -> Result<()> {
        self.log.push(Event::CaptureStop);
        if self.fail_stop {
            return Err(Error::Launch {
                message: "did not exit within 30s of SIGINT".to_string(),
            });
        }
        Ok(())
    }
}

pub struct MockCopier {
    log: EventLog,
    pub fail_on: Option<String>,
    pub hang: bool,
    pub jobs: Arc<Mutex<Vec<CopyJob>>>,
}

impl MockCopier {
    pub fn new(log: &EventLog) -> Self {
        Self {
            log: log.clone(),
            fail_on: None,
            hang: false,
            jobs: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl FileCopier for MockCopier {
    async fn copy(&self, job: &CopyJob) -> Result<()> {
        self.log.push(Event::Copy(job.name.clone()));
        self.jobs.lock().unwrap().push(job.clone());
        if self.hang {
            std::future::pending::<()>().await;
        }
        if self.fail_on.as_deref() == Some(job.name.as_str()) {
            return Err(Error::Copy {
                target: job.name.clone(),
                message: "rsync exited with exit status: 12".to_string(),
            });
        }
        if job.name == "data directory" {
            std::fs::create_dir_all(&job.destination)?;
            std::fs::write(job.destination.join("PG_VERSION"), "16\n")?;
        }
        Ok(())
    }
}

/// Tablespaces pg_default, pg_global, fastdisk (5), archive (6); databases
/// template1, template0, postgres, app (100), reporting (101).
pub fn sample_snapshot() -> CatalogSnapshot {
    let ts = |oid, name: &str, location: Option<&str>| Tablespace {
        oid,
        name: name.to_string(),
        location: location.map(PathBuf::from),
    };
    let db = |oid, name: &str, tablespace| Database {
        oid,
        name: name.to_string(),
        tablespace,
    };
    CatalogSnapshot {
        tablespaces: vec![
            ts(5, "fastdisk", Some("/mnt/fast")),
            ts(6, "archive", Some("/mnt/archive")),
            ts(1663, "pg_default", None),
            ts(1664, "pg_global", None),
        ],
        databases: vec![
            db(1, "template1", 1663),
            db(4, "template0", 1663),
            db(5, "postgres", 1663),
            db(100, "app", 1663),
            db(101, "reporting", 6),
        ],
    }
}

/// Run options rooted in `root` with short waits.
pub fn test_options(root: &Path) -> RunOptions {
    let mut options = RunOptions::new(root.join("replica"), "postgres");
    options.warmup = Duration::from_millis(200);
    options.drain = Duration::from_millis(200);
    options.poll_interval = Duration::from_millis(10);
    options.stop_timeout = Duration::from_secs(1);
    options
}

/// Live cluster parameters from `TEST_PG_*` environment variables.
pub fn get_test_connection() -> ClusterConnection {
    ClusterConnection {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        dbname: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        user: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: Some(env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string())),
        connect_timeout: Duration::from_secs(10),
    }
}
