//! Error types and result handling for pg-selective-replica.
//!
//! This module defines the main error type [`Error`], a convenience
//! [`Result`] type alias, and the non-fatal [`CleanupWarning`] values that
//! are collected into a [`CleanupReport`] while tearing down a run.
//!
//! # Example
//!
//! ```rust
//! use pg_selective_replica::{Error, Result};
//!
//! fn check_destination() -> Result<()> {
//!     Err(Error::Precondition("/var/lib/postgresql/replica is not empty".to_string()))
//! }
//!
//! match check_destination() {
//!     Ok(()) => println!("Destination ready"),
//!     Err(e) if e.is_setup_error() => eprintln!("Refusing to start: {}", e),
//!     Err(e) => eprintln!("Run failed: {}", e),
//! }
//! ```

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for pg-selective-replica operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad or missing replica profile, conflicting filters, unreadable config file.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Destination or staging directory is not usable.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// PostgreSQL client or protocol error.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// The catalog answered, but not with something we can use.
    #[error("Catalog error: {message}")]
    Catalog {
        /// Description of the unexpected catalog state
        message: String,
    },

    /// An external process could not be started or died unexpectedly.
    #[error("Launch error: {message}")]
    Launch {
        /// Description of the launch failure
        message: String,
    },

    /// A bulk copy exited unsuccessfully.
    #[error("Copy of {target} failed: {message}")]
    Copy {
        /// Which copy job failed
        target: String,
        /// Exit status or spawn error
        message: String,
    },

    /// I/O error, typically from staging or promotion filesystem operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Interrupt received (e.g., via Ctrl+C); cleanup has already run when
    /// this is reported.
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// True for errors raised before any external side effect happened.
    pub fn is_setup_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Precondition(_))
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

/// A convenient Result type alias for pg-selective-replica operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A cleanup step that failed and needs an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupWarning {
    /// The backup-stop call failed; the source may still be in backup mode.
    WindowClose(String),
    /// The WAL capture process could not be stopped cleanly.
    CaptureStop(String),
    /// A non-exclusive backup ended without a backup label, so the replica
    /// in this data directory cannot be recovered consistently.
    BackupLabelMissing(PathBuf),
}

impl CleanupWarning {
    /// What the operator has to do by hand.
    pub fn manual_action(&self) -> &'static str {
        match self {
            CleanupWarning::WindowClose(_) => {
                "call pg_stop_backup() / pg_backup_stop() on the source cluster"
            }
            CleanupWarning::CaptureStop(_) => "terminate the WAL capture process manually",
            CleanupWarning::BackupLabelMissing(_) => {
                "do not start this replica; rebuild it once the source has left backup mode"
            }
        }
    }
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupWarning::WindowClose(msg) => write!(
                f,
                "MANUAL INTERVENTION REQUIRED: closing the backup window failed ({}); {}",
                msg,
                self.manual_action()
            ),
            CleanupWarning::CaptureStop(msg) => write!(
                f,
                "MANUAL INTERVENTION REQUIRED: stopping WAL capture failed ({}); {}",
                msg,
                self.manual_action()
            ),
            CleanupWarning::BackupLabelMissing(dir) => write!(
                f,
                "MANUAL INTERVENTION REQUIRED: no backup_label was written to {}; {}",
                dir.display(),
                self.manual_action()
            ),
        }
    }
}

/// Non-fatal failures collected while tearing down a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    warnings: Vec<CleanupWarning>,
}

impl CleanupReport {
    pub fn push(&mut self, warning: CleanupWarning) {
        self.warnings.push(warning);
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn warnings(&self) -> &[CleanupWarning] {
        &self.warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_error_classification() {
        assert!(Error::Config("x".into()).is_setup_error());
        assert!(Error::Precondition("x".into()).is_setup_error());
        assert!(!Error::Shutdown.is_setup_error());
        assert!(!Error::Copy {
            target: "main".into(),
            message: "exit 23".into()
        }
        .is_setup_error());
    }

    #[test]
    fn test_cleanup_warning_mentions_manual_action() {
        let w = CleanupWarning::WindowClose("connection reset".into());
        let text = w.to_string();
        assert!(text.starts_with("MANUAL INTERVENTION REQUIRED"));
        assert!(text.contains("connection reset"));
        assert!(text.contains("pg_stop_backup"));

        let w = CleanupWarning::BackupLabelMissing(PathBuf::from("/srv/replica"));
        let text = w.to_string();
        assert!(text.starts_with("MANUAL INTERVENTION REQUIRED"));
        assert!(text.contains("/srv/replica"));
        assert!(text.contains("do not start"));
    }

    #[test]
    fn test_cleanup_report_collects() {
        let mut report = CleanupReport::default();
        assert!(report.is_clean());
        report.push(CleanupWarning::CaptureStop("timeout".into()));
        assert!(!report.is_clean());
        assert_eq!(report.warnings().len(), 1);
    }
}
