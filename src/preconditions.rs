use std::path::Path;
use tokio::fs;
use tracing::info;

use crate::config::RunOptions;
use crate::{Error, Result};

/// Fails unless `dir` is missing or an empty directory.
pub async fn ensure_empty_or_missing(dir: &Path, what: &str) -> Result<()> {
    let metadata = match fs::metadata(dir).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::Io(e)),
    };

    if !metadata.is_dir() {
        return Err(Error::Precondition(format!(
            "{} {} exists and is not a directory",
            what,
            dir.display()
        )));
    }

    let mut entries = fs::read_dir(dir).await?;
    if entries.next_entry().await?.is_some() {
        return Err(Error::Precondition(format!(
            "{} {} must be empty or nonexistent",
            what,
            dir.display()
        )));
    }
    Ok(())
}

/// Checks the destination and the staging directory of a run. Nothing else
/// may touch the source cluster until this passes.
pub async fn check_targets(options: &RunOptions) -> Result<()> {
    ensure_empty_or_missing(&options.destination, "destination data directory").await?;
    ensure_empty_or_missing(&options.staging_dir, "staging directory").await
}

/// Creates the staging directory for captured WAL, refusing to reuse one
/// that already has content.
pub async fn create_staging_dir(dir: &Path) -> Result<()> {
    info!(dir = %dir.display(), "Creating WAL staging directory if needed");
    ensure_empty_or_missing(dir, "staging directory").await?;
    fs::create_dir_all(dir).await?;
    Ok(())
}
