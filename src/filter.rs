//! Turns a [`ReplicaProfile`] into the concrete set of OIDs to leave out of
//! the copy and the tablespace paths that must be copied.
//!
//! Resolution is pure given a [`CatalogSnapshot`]: resolving the same profile
//! against the same snapshot always yields the same [`FilterResult`].
//!
//! The built-in tablespaces (`pg_default`, `pg_global`) and template
//! databases (`template0`, `template1`) are always kept, whatever the
//! profile says; a replica without them cannot start.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::config::ReplicaProfile;
use crate::postgres::{CatalogSnapshot, Oid, BUILTIN_DATABASES, BUILTIN_TABLESPACES};
use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterResult {
    pub excluded_tablespace_oids: BTreeSet<Oid>,
    pub excluded_database_oids: BTreeSet<Oid>,
    /// Locations of kept tablespaces that live outside the data directory.
    pub copy_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Tablespace,
    Database,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Tablespace => write!(f, "tablespaces"),
            Axis::Database => write!(f, "databases"),
        }
    }
}

pub fn resolve(profile: &ReplicaProfile, snapshot: &CatalogSnapshot) -> Result<FilterResult> {
    info!(
        replica = %profile.name,
        include_tablespaces = ?profile.include_tablespaces,
        exclude_tablespaces = ?profile.exclude_tablespaces,
        include_databases = ?profile.include_databases,
        exclude_databases = ?profile.exclude_databases,
        "Resolving replica filter"
    );

    check_axis(
        profile,
        Axis::Tablespace,
        &profile.include_tablespaces,
        &profile.exclude_tablespaces,
    )?;
    check_axis(
        profile,
        Axis::Database,
        &profile.include_databases,
        &profile.exclude_databases,
    )?;

    let excluded_tablespace_oids = resolve_axis(
        Axis::Tablespace,
        &profile.include_tablespaces,
        &profile.exclude_tablespaces,
        &BUILTIN_TABLESPACES,
        snapshot.all_tablespace_oids(),
        |names| snapshot.tablespace_oids(names),
    );

    let excluded_database_oids = resolve_axis(
        Axis::Database,
        &profile.include_databases,
        &profile.exclude_databases,
        &BUILTIN_DATABASES,
        snapshot.all_database_oids(),
        |names| snapshot.database_oids(names),
    );

    let mut copy_paths: Vec<PathBuf> = snapshot
        .tablespaces
        .iter()
        .filter(|t| !excluded_tablespace_oids.contains(&t.oid))
        .filter_map(|t| t.location.clone())
        .collect();
    copy_paths.sort();
    copy_paths.dedup();

    for db in &snapshot.databases {
        if excluded_database_oids.contains(&db.oid) {
            continue;
        }
        if excluded_tablespace_oids.contains(&db.tablespace) {
            let tablespace = snapshot
                .tablespace(db.tablespace)
                .map(|t| t.name.as_str())
                .unwrap_or("?");
            warn!(
                database = %db.name,
                tablespace = %tablespace,
                "Database is kept but its default tablespace is excluded; it will not be usable on the replica"
            );
        }
    }

    let result = FilterResult {
        excluded_tablespace_oids,
        excluded_database_oids,
        copy_paths,
    };

    info!(
        excluded_tablespace_oids = ?result.excluded_tablespace_oids,
        excluded_database_oids = ?result.excluded_database_oids,
        copy_paths = ?result.copy_paths,
        "Filter resolved"
    );

    Ok(result)
}

fn check_axis(
    profile: &ReplicaProfile,
    axis: Axis,
    include: &BTreeSet<String>,
    exclude: &BTreeSet<String>,
) -> Result<()> {
    if !include.is_empty() && !exclude.is_empty() {
        error!(
            replica = %profile.name,
            "Only one of include_{axis} / exclude_{axis} may be set"
        );
        return Err(Error::Config(format!(
            "replica profile '{}' sets both include_{} and exclude_{}",
            profile.name, axis, axis
        )));
    }
    Ok(())
}

fn resolve_axis<F>(
    axis: Axis,
    include: &BTreeSet<String>,
    exclude: &BTreeSet<String>,
    builtins: &[&str],
    all_oids: BTreeSet<Oid>,
    lookup: F,
) -> BTreeSet<Oid>
where
    F: for<'a> Fn(Vec<&'a str>) -> (BTreeSet<Oid>, Vec<String>),
{
    let (builtin_oids, _) = lookup(builtins.to_vec());

    if !exclude.is_empty() {
        let mut names = Vec::with_capacity(exclude.len());
        for name in exclude {
            if builtins.contains(&name.as_str()) {
                warn!(%axis, name = %name, "Built-in object cannot be excluded; keeping it");
            } else {
                names.push(name.as_str());
            }
        }
        let (oids, missing) = lookup(names);
        warn_missing(axis, &missing);
        oids.difference(&builtin_oids).copied().collect()
    } else if !include.is_empty() {
        let names: Vec<&str> = include.iter().map(String::as_str).collect();
        let (mut kept, missing) = lookup(names);
        warn_missing(axis, &missing);
        kept.extend(builtin_oids.iter().copied());
        all_oids.difference(&kept).copied().collect()
    } else {
        BTreeSet::new()
    }
}

fn warn_missing(axis: Axis, missing: &[String]) {
    if !missing.is_empty() {
        warn!(%axis, names = ?missing, "Filter names not found in the source catalog");
    }
}
