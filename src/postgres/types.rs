use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::Error;

/// PostgreSQL object identifier.
pub type Oid = u32;

pub const BUILTIN_TABLESPACES: [&str; 2] = ["pg_default", "pg_global"];
pub const BUILTIN_DATABASES: [&str; 2] = ["template0", "template1"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tablespace {
    pub oid: Oid,
    pub name: String,
    /// `None` for tablespaces stored inside the data directory.
    pub location: Option<PathBuf>,
}

impl Tablespace {
    pub fn is_builtin(&self) -> bool {
        BUILTIN_TABLESPACES.contains(&self.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Database {
    pub oid: Oid,
    pub name: String,
    /// Default tablespace of the database.
    pub tablespace: Oid,
}

impl Database {
    pub fn is_builtin(&self) -> bool {
        BUILTIN_DATABASES.contains(&self.name.as_str())
    }
}

/// `server_version_num` of the source cluster, e.g. `150004`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerVersion(pub i32);

impl ServerVersion {
    /// Directory holding WAL inside a data directory.
    pub fn wal_dir_name(&self) -> &'static str {
        if self.0 >= 100_000 {
            "pg_wal"
        } else {
            "pg_xlog"
        }
    }

    pub fn receive_wal_program(&self) -> &'static str {
        if self.0 >= 100_000 {
            "pg_receivewal"
        } else {
            "pg_receivexlog"
        }
    }

    /// From 15 on only non-exclusive backups exist (`pg_backup_start`).
    pub fn non_exclusive_backup(&self) -> bool {
        self.0 >= 150_000
    }

    /// `pg_stat_replication` column holding the flush position.
    pub fn flush_lsn_column(&self) -> &'static str {
        if self.0 >= 100_000 {
            "flush_lsn"
        } else {
            "flush_location"
        }
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 100_000 {
            write!(f, "{}.{}", self.0 / 10_000, self.0 % 10_000)
        } else {
            write!(f, "{}.{}.{}", self.0 / 10_000, (self.0 / 100) % 100, self.0 % 100)
        }
    }
}

/// A WAL position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Lsn(pub u64);

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::Catalog {
            message: format!("invalid LSN '{}', expected high/low hex", s),
        };
        let (high, low) = s.trim().split_once('/').ok_or_else(invalid)?;
        let high = u64::from_str_radix(high, 16).map_err(|_| invalid())?;
        let low = u64::from_str_radix(low, 16).map_err(|_| invalid())?;
        if high > u32::MAX as u64 || low > u32::MAX as u64 {
            return Err(invalid());
        }
        Ok(Lsn((high << 32) | low))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

/// What the backup-stop call hands back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupStop {
    pub lsn: Lsn,
    /// Contents for `backup_label`; only non-exclusive backups return one.
    pub label_file: Option<String>,
    /// Contents for `tablespace_map`; only non-exclusive backups return one.
    pub tablespace_map: Option<String>,
}
