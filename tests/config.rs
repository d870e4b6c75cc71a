use std::fs;
use std::path::PathBuf;

use docshred::config::{DialectKind, StoreConfig};
use docshred::error::DocShredError;

#[test]
fn defaults_describe_an_in_memory_sqlite_store() {
    let config = StoreConfig::default();
    assert_eq!(config, StoreConfig::in_memory());
    assert_eq!(config.path, None);
    assert_eq!(config.dialect, DialectKind::Sqlite);
    assert_eq!(config.insert_batch_size, 30);
    assert!(config.max_retries > 0);
    assert!(!config.data_import_mode);
    let file = StoreConfig::with_path("documents.db");
    assert_eq!(file.path, Some(PathBuf::from("documents.db")));
    assert_eq!(file.pool_size, config.pool_size);
}

#[test]
fn settings_file_overrides_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("docshred.toml");
    fs::write(
        &file,
        "path = \"stored.db\"\ndialect = \"postgres\"\ninsert_batch_size = 7\ndata_import_mode = true\n",
    )
    .expect("write");
    let config = StoreConfig::load(Some(file.as_path())).expect("load");
    assert_eq!(config.path, Some(PathBuf::from("stored.db")));
    assert_eq!(config.dialect, DialectKind::Postgres);
    assert_eq!(config.insert_batch_size, 7);
    assert!(config.data_import_mode);
    // untouched settings keep their defaults
    assert_eq!(config.read_batch_size, StoreConfig::default().read_batch_size);
}

#[test]
fn zero_sizes_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("docshred.toml");
    fs::write(&file, "pool_size = 0\n").expect("write");
    assert!(matches!(StoreConfig::load(Some(file.as_path())), Err(DocShredError::Config(_))));
}

#[test]
fn dialects_build_by_kind() {
    let sqlite = DialectKind::Sqlite.build().expect("sqlite");
    assert_eq!(sqlite.name(), "sqlite");
    assert!(sqlite.can_execute());
    let postgres = DialectKind::Postgres.build().expect("postgres");
    assert_eq!(postgres.name(), "postgres");
    assert!(!postgres.can_execute());
}
