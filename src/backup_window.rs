use chrono::Local;
use tracing::info;

use crate::postgres::{BackupStop, Catalog};
use crate::Result;

/// Brackets the file copy with backup-start / backup-stop calls.
pub struct BackupWindow<'a, C: Catalog + ?Sized> {
    catalog: &'a C,
    dry_run: bool,
    label: Option<String>,
}

impl<'a, C: Catalog + ?Sized> BackupWindow<'a, C> {
    pub fn new(catalog: &'a C, dry_run: bool) -> Self {
        Self {
            catalog,
            dry_run,
            label: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.label.is_some()
    }

    /// Starts backup mode with a fast checkpoint and returns the label used.
    pub async fn open(&mut self) -> Result<String> {
        let label = backup_label();
        info!(label = %label, "Starting backup on the source cluster");

        if !self.dry_run {
            let start_lsn = self.catalog.start_backup(&label, true).await?;
            info!(start_lsn = %start_lsn, "Backup started");
        }

        self.label = Some(label.clone());
        Ok(label)
    }

    /// Stops backup mode. Returns `None` when there was nothing to stop or in
    /// dry-run mode.
    ///
    /// The window counts as closed even if the call fails: retrying would not
    /// help, an operator has to look at the source.
    pub async fn close(&mut self) -> Result<Option<BackupStop>> {
        let Some(label) = self.label.take() else {
            return Ok(None);
        };
        info!(label = %label, "Stopping backup on the source cluster");

        if self.dry_run {
            return Ok(None);
        }

        let stop = self.catalog.stop_backup().await?;
        info!(stop_lsn = %stop.lsn, "Backup stopped");
        Ok(Some(stop))
    }
}

fn backup_label() -> String {
    format!("pg_selective_replica {}", Local::now().format("%Y-%m-%d %H:%M:%S"))
}
