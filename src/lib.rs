pub mod backup_window;
pub mod capture;
pub mod config;
pub mod copy;
pub mod error;
pub mod filter;
pub mod preconditions;
pub mod replicator;

pub mod postgres;

pub use config::{Config, ReplicaProfile, RunOptions};
pub use error::{CleanupReport, CleanupWarning, Error, Result};
pub use replicator::{Replicator, RunReport};
