//! Configuration resolution tests
//!
//! Tests that touch HOPE_REPR_DATABASE / HOPE_REPR_CONFIG are #[serial] so
//! they never race on process environment.

use hope_common::config::{
    default_database_path, resolve_database_path, LoggingConfig, TomlConfig, CONFIG_ENV_VAR,
    DATABASE_ENV_VAR,
};
use serial_test::serial;
use std::env;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

#[test]
#[serial]
fn test_env_var_beats_toml() {
    env::set_var(DATABASE_ENV_VAR, "/tmp/hope-env.db");
    let config = TomlConfig {
        database_path: Some(PathBuf::from("/tmp/hope-toml.db")),
        logging: LoggingConfig::default(),
    };

    let resolved = resolve_database_path(None, &config);
    env::remove_var(DATABASE_ENV_VAR);

    assert_eq!(resolved, PathBuf::from("/tmp/hope-env.db"));
}

#[test]
#[serial]
fn test_toml_used_without_env() {
    env::remove_var(DATABASE_ENV_VAR);
    let config = TomlConfig {
        database_path: Some(PathBuf::from("/tmp/hope-toml.db")),
        logging: LoggingConfig::default(),
    };

    assert_eq!(resolve_database_path(None, &config), PathBuf::from("/tmp/hope-toml.db"));
}

#[test]
#[serial]
fn test_default_when_nothing_configured() {
    env::remove_var(DATABASE_ENV_VAR);
    let resolved = resolve_database_path(None, &TomlConfig::default());
    assert_eq!(resolved, default_database_path());
    assert!(resolved.ends_with("hope.db"));
}

#[test]
#[serial]
fn test_load_or_default_reads_explicit_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
        database_path = "/var/lib/hope/hope.db"

        [logging]
        level = "debug"
        "#,
    )
    .unwrap();

    let config = TomlConfig::load_or_default(Some(&path));
    assert_eq!(config.database_path, Some(PathBuf::from("/var/lib/hope/hope.db")));
    assert_eq!(config.logging.level, "debug");
}

#[test]
#[serial]
fn test_missing_or_broken_file_falls_back_to_defaults() {
    env::remove_var(CONFIG_ENV_VAR);
    let config = TomlConfig::load_or_default(Some(Path::new("/nonexistent/hope/config.toml")));
    assert!(config.database_path.is_none());

    let temp_dir = TempDir::new().unwrap();
    let broken = temp_dir.path().join("broken.toml");
    std::fs::write(&broken, "database_path = [not toml").unwrap();
    let config = TomlConfig::load_or_default(Some(&broken));
    assert!(config.database_path.is_none());
    assert_eq!(config.logging.level, "info");
}
