use pg_selective_replica::{Config, Error};
use std::path::PathBuf;
use tempfile::TempDir;

const WALBOUNCER_CONFIG: &str = r#"
listen_port: 5433
master:
  host: db1.example.com
  port: 5433
configurations:
  - replica1:
      match:
        application_name: replica1
      filter:
        include_tablespaces: [spc_replica1]
        exclude_databases: [test, scratch]
  - replica2:
      filter:
        exclude_tablespaces: [spc_big]
  - fullcopy:
      match:
        application_name: fullcopy
"#;

fn write_config(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("walbouncer.yaml");
    std::fs::write(&path, WALBOUNCER_CONFIG).unwrap();
    path
}

#[test]
fn test_load_walbouncer_config() {
    let dir = TempDir::new().unwrap();
    let config = Config::from_file(write_config(&dir)).unwrap();

    assert_eq!(config.master.host, "db1.example.com");
    assert_eq!(config.master.port, 5433);
    assert_eq!(config.master.dbname, "postgres");
    assert_eq!(config.configurations.len(), 3);

    let replica1 = config.profile("replica1").unwrap();
    assert!(replica1.include_tablespaces.contains("spc_replica1"));
    assert_eq!(replica1.exclude_databases.len(), 2);
    assert!(replica1.exclude_tablespaces.is_empty());

    let replica2 = config.profile("replica2").unwrap();
    assert!(replica2.exclude_tablespaces.contains("spc_big"));
}

#[test]
fn test_profile_without_filter_copies_everything() {
    let dir = TempDir::new().unwrap();
    let config = Config::from_file(write_config(&dir)).unwrap();
    let profile = config.profile("fullcopy").unwrap();

    assert!(profile.include_tablespaces.is_empty());
    assert!(profile.exclude_tablespaces.is_empty());
    assert!(profile.include_databases.is_empty());
    assert!(profile.exclude_databases.is_empty());
}

#[test]
fn test_unknown_profile_rejected() {
    let dir = TempDir::new().unwrap();
    let config = Config::from_file(write_config(&dir)).unwrap();
    assert!(matches!(config.profile("replica3"), Err(Error::Config(_))));
}

#[test]
fn test_connection_from_config() {
    let dir = TempDir::new().unwrap();
    let config = Config::from_file(write_config(&dir)).unwrap();
    let connection = config.connection("backup");

    assert_eq!(connection.host, "db1.example.com");
    assert_eq!(connection.port, 5433);
    assert_eq!(connection.user, "backup");
}

#[test]
fn test_load_config_with_conf_extension() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("walbouncer.conf");
    std::fs::write(&path, WALBOUNCER_CONFIG).unwrap();

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.master.host, "db1.example.com");
    assert!(config.profile("replica2").is_ok());
}

#[test]
fn test_missing_file_is_config_error() {
    let dir = TempDir::new().unwrap();
    let err = Config::from_file(dir.path().join("absent.yaml")).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_missing_master_is_config_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.yaml");
    std::fs::write(&path, "configurations: []\n").unwrap();
    assert!(matches!(Config::from_file(&path), Err(Error::Config(_))));
}
