use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

use super::{CopyJob, FileCopier};
use crate::{Error, Result};

/// rsync: "some files vanished before they could be transferred". Expected
/// while copying a live cluster; WAL replay covers those files.
const RSYNC_VANISHED: i32 = 24;

/// Runs copy jobs with `rsync -a` over ssh.
pub struct RsyncCopier {
    program: String,
    dry_run: bool,
}

impl RsyncCopier {
    pub fn new(dry_run: bool) -> Self {
        Self {
            program: "rsync".to_string(),
            dry_run,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn args(&self, job: &CopyJob) -> Vec<String> {
        let mut args = vec!["-a".to_string()];
        if self.dry_run {
            args.push("--dry-run".to_string());
        }
        if job.keep_dirlinks {
            args.push("--keep-dirlinks".to_string());
        }
        for pattern in &job.excludes {
            args.push("--exclude".to_string());
            args.push(pattern.clone());
        }
        args.push(job.source.clone());
        args.push(job.destination.display().to_string());
        args
    }
}

#[async_trait]
impl FileCopier for RsyncCopier {
    async fn copy(&self, job: &CopyJob) -> Result<()> {
        let args = self.args(job);
        info!(job = %job.name, "Starting copy: {} {}", self.program, args.join(" "));

        if self.dry_run {
            return Ok(());
        }

        let status = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| Error::Copy {
                target: job.name.clone(),
                message: format!("failed to start {}: {}", self.program, e),
            })?;

        match status.code() {
            Some(0) => {
                info!(job = %job.name, "Copy finished");
                Ok(())
            }
            Some(RSYNC_VANISHED) => {
                warn!(job = %job.name, "Some source files vanished during the copy");
                Ok(())
            }
            _ => Err(Error::Copy {
                target: job.name.clone(),
                message: format!("{} exited with {}", self.program, status),
            }),
        }
    }
}
