//! Filtered physical copy of the data directory and tablespace locations.

pub mod rsync;


use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use tracing::{error, info};

use crate::filter::FilterResult;
use crate::Result;

pub use rsync::RsyncCopier;

/// Where the files come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSource {
    pub user: String,
    pub host: String,
}

impl RemoteSource {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
        }
    }

    /// `user@host:/path/`; the trailing slash copies the directory contents.
    pub fn path_spec(&self, path: &Path) -> String {
        let path = path.display().to_string();
        let path = path.trim_end_matches('/');
        format!("{}@{}:{}/", self.user, self.host, path)
    }
}

/// One copy invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyJob {
    pub name: String,
    pub source: String,
    pub destination: PathBuf,
    /// Patterns relative to the transfer root.
    pub excludes: Vec<String>,
    /// Follow directory symlinks already present on the receiving side.
    pub keep_dirlinks: bool,
}

/// Runs a single [`CopyJob`].
#[async_trait]
pub trait FileCopier: Send + Sync {
    async fn copy(&self, job: &CopyJob) -> Result<()>;
}

/// The main data-directory copy plus one copy per kept tablespace location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyPlan {
    pub main: CopyJob,
    pub tablespaces: Vec<CopyJob>,
}

impl CopyPlan {
    pub fn new(
        source: &RemoteSource,
        data_directory: &Path,
        destination: &Path,
        filter: &FilterResult,
        wal_dir_name: &str,
    ) -> Self {
        let mut excludes = vec![format!("/{}", wal_dir_name), "/postmaster.pid".to_string()];
        for oid in &filter.excluded_database_oids {
            excludes.push(format!("/base/{}", oid));
            excludes.push(format!("/pg_tblspc/*/*/{}", oid));
        }
        for oid in &filter.excluded_tablespace_oids {
            excludes.push(format!("/pg_tblspc/{}", oid));
        }

        let main = CopyJob {
            name: "data directory".to_string(),
            source: source.path_spec(data_directory),
            destination: destination.to_path_buf(),
            excludes,
            keep_dirlinks: true,
        };

        // Inside a tablespace location the layout is <catalog version dir>/<db oid>.
        let tablespace_excludes: Vec<String> = filter
            .excluded_database_oids
            .iter()
            .map(|oid| format!("/*/{}", oid))
            .collect();

        let tablespaces = filter
            .copy_paths
            .iter()
            .map(|path| CopyJob {
                name: format!("tablespace {}", path.display()),
                source: source.path_spec(path),
                destination: path.clone(),
                excludes: tablespace_excludes.clone(),
                keep_dirlinks: false,
            })
            .collect();

        Self { main, tablespaces }
    }
}

/// Copies the data directory, then every tablespace location with at most
/// `max_parallel` copies in flight.
///
/// Returns only after every started copy has finished; the first failure is
/// reported.
pub async fn execute<F>(copier: &F, plan: &CopyPlan, max_parallel: usize) -> Result<()>
where
    F: FileCopier + ?Sized,
{
    info!(
        tablespaces = plan.tablespaces.len(),
        "Starting file copy"
    );
    copier.copy(&plan.main).await?;

    let results: Vec<(String, Result<()>)> = stream::iter(plan.tablespaces.iter())
        .map(|job| async move { (job.name.clone(), copier.copy(job).await) })
        .buffer_unordered(max_parallel.max(1))
        .collect()
        .await;

    let mut first_error = None;
    for (name, result) in results {
        if let Err(e) = result {
            error!(job = %name, "Copy failed: {}", e);
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => {
            info!("File copy finished");
            Ok(())
        }
    }
}
