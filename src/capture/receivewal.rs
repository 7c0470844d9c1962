use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use super::WalCapture;
use crate::config::ClusterConnection;
use crate::postgres::ServerVersion;
use crate::{Error, Result};

/// `pg_receivewal` (or `pg_receivexlog` before 10) as the capture process.
pub struct PgReceiveWal {
    connection: ClusterConnection,
    program: &'static str,
    application_name: String,
    dry_run: bool,
    stop_timeout: Duration,
    child: Option<Child>,
}

impl PgReceiveWal {
    pub fn new(
        connection: ClusterConnection,
        version: ServerVersion,
        application_name: impl Into<String>,
        dry_run: bool,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            connection,
            program: version.receive_wal_program(),
            application_name: application_name.into(),
            dry_run,
            stop_timeout,
            child: None,
        }
    }

    /// Arguments passed to the capture program.
    pub fn args(&self, staging_dir: &Path) -> Vec<String> {
        vec![
            "-h".to_string(),
            self.connection.host.clone(),
            "-p".to_string(),
            self.connection.port.to_string(),
            "-U".to_string(),
            self.connection.user.clone(),
            "-D".to_string(),
            staging_dir.display().to_string(),
            // Report the flush position every second so the drain wait can see it.
            "--status-interval=1".to_string(),
            "--no-password".to_string(),
        ]
    }
}

#[async_trait]
impl WalCapture for PgReceiveWal {
    fn application_name(&self) -> &str {
        &self.application_name
    }

    async fn start(&mut self, staging_dir: &Path) -> Result<()> {
        let args = self.args(staging_dir);
        info!(
            "Starting WAL capture: {} {}",
            self.program,
            args.join(" ")
        );

        if self.dry_run {
            return Ok(());
        }

        let mut cmd = Command::new(self.program);
        cmd.args(&args)
            .env("PGAPPNAME", &self.application_name)
            .stdin(Stdio::null())
            // Own process group: a terminal Ctrl+C must not reach the capture
            // process before the backup window is closed.
            .process_group(0);
        if let Some(password) = &self.connection.password {
            cmd.env("PGPASSWORD", password);
        }

        let child = cmd.spawn().map_err(|e| Error::Launch {
            message: format!("failed to start {}: {}", self.program, e),
        })?;
        info!(pid = ?child.id(), "WAL capture process started");
        self.child = Some(child);
        Ok(())
    }

    fn has_exited(&mut self) -> Result<bool> {
        match self.child.as_mut() {
            Some(child) => Ok(child.try_wait()?.is_some()),
            None => Ok(false),
        }
    }

    async fn stop(&mut self) -> Result<()> {
        if self.dry_run {
            info!("Would stop WAL capture process");
            return Ok(());
        }

        let Some(mut child) = self.child.take() else {
            warn!("Invalid WAL capture process, nothing to stop");
            return Ok(());
        };

        if let Some(status) = child.try_wait()? {
            warn!(%status, "WAL capture process had already exited");
            return Ok(());
        }

        let pid = child.id().ok_or_else(|| Error::Launch {
            message: "WAL capture process has no pid".to_string(),
        })?;
        info!(pid, "Stopping WAL capture process");
        interrupt(pid)?;

        match tokio::time::timeout(self.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!(%status, "WAL capture process stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Err(Error::Launch {
                message: format!(
                    "{} (pid {}) did not exit within {:?} of SIGINT",
                    self.program, pid, self.stop_timeout
                ),
            }),
        }
    }
}

/// Sends SIGINT, which pg_receivewal handles by flushing and exiting.
fn interrupt(pid: u32) -> Result<()> {
    let pid = libc::pid_t::try_from(pid).map_err(|_| Error::Launch {
        message: format!("pid {} out of range", pid),
    })?;
    // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs to
    // a child we have not reaped yet.
    let rc = unsafe { libc::kill(pid, libc::SIGINT) };
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::Io(std::io::Error::last_os_error()))
    }
}
