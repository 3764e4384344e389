//! Configuration loading
//!
//! Two tiers:
//! 1. **TOML bootstrap**: database location and logging. Read once at startup.
//! 2. **Database runtime**: batch sizes and lock budgets from the `settings`
//!    table, initialised with built-in defaults by [`crate::db::init_database`].
//!
//! Database path resolution priority:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`HOPE_REPR_DATABASE`)
//! 3. TOML config file (`database_path`)
//! 4. OS-dependent compiled default (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable overriding the database location
pub const DATABASE_ENV_VAR: &str = "HOPE_REPR_DATABASE";

/// Environment variable overriding the TOML config location
pub const CONFIG_ENV_VAR: &str = "HOPE_REPR_CONFIG";

/// Bootstrap configuration loaded from TOML file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TomlConfig {
    /// Path to SQLite database file
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Logging configuration (optional)
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level or `tracing_subscriber::EnvFilter` directive
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TomlConfig {
    /// Parse a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
    }

    /// Load the config file if one can be located, otherwise defaults.
    ///
    /// A missing or unreadable file is not fatal: the engine starts with
    /// defaults and logs a warning.
    pub fn load_or_default(explicit: Option<&Path>) -> Self {
        let path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => std::env::var(CONFIG_ENV_VAR)
                .ok()
                .map(PathBuf::from)
                .or_else(default_config_path),
        };

        match path {
            Some(p) if p.exists() => match Self::load(&p) {
                Ok(config) => {
                    info!("Loaded config file: {}", p.display());
                    config
                }
                Err(e) => {
                    warn!("{}; using defaults", e);
                    Self::default()
                }
            },
            Some(p) => {
                if explicit.is_some() {
                    warn!("Config file not found: {}; using defaults", p.display());
                }
                Self::default()
            }
            None => Self::default(),
        }
    }
}

/// Resolve the database path following the documented priority order
pub fn resolve_database_path(cli_arg: Option<&Path>, toml_config: &TomlConfig) -> PathBuf {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(DATABASE_ENV_VAR) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    // Priority 3: TOML config file
    if let Some(path) = &toml_config.database_path {
        return path.clone();
    }

    // Priority 4: OS-dependent compiled default
    default_database_path()
}

/// Platform config file location (`~/.config/hope-repr/config.toml` on Linux)
fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("hope-repr").join("config.toml"))
}

/// OS-dependent default database location
pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("hope-repr").join("hope.db"))
        .unwrap_or_else(|| PathBuf::from("./hope_data/hope.db"))
}

/// Runtime tunables loaded from the `settings` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub enrollment_batch_size: usize,
    pub merge_batch_size: usize,
    pub deduplication_batch_size: usize,
    pub database_max_lock_wait_ms: u64,
    pub database_lock_retry_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            enrollment_batch_size: 500,
            merge_batch_size: 500,
            deduplication_batch_size: 2500,
            database_max_lock_wait_ms: 5000,
            database_lock_retry_ms: 250,
        }
    }
}

impl EngineSettings {
    /// Load settings, falling back to the built-in default for any
    /// missing, NULL or unparsable value
    pub async fn load(pool: &SqlitePool) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            enrollment_batch_size: read_setting(
                pool,
                "enrollment_batch_size",
                defaults.enrollment_batch_size,
            )
            .await?,
            merge_batch_size: read_setting(
                pool,
                "merge_batch_size",
                defaults.merge_batch_size,
            )
            .await?,
            deduplication_batch_size: read_setting(
                pool,
                "deduplication_batch_size",
                defaults.deduplication_batch_size,
            )
            .await?,
            database_max_lock_wait_ms: read_setting(
                pool,
                "database_max_lock_wait_ms",
                defaults.database_max_lock_wait_ms,
            )
            .await?,
            database_lock_retry_ms: read_setting(
                pool,
                "database_lock_retry_ms",
                defaults.database_lock_retry_ms,
            )
            .await?,
        })
    }
}

async fn read_setting<T>(pool: &SqlitePool, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    let value: Option<Option<String>> =
        sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;

    match value.flatten() {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(parsed) => Ok(parsed),
            Err(_) => {
                warn!("Invalid value '{}' for setting '{}', using default {}", raw, key, default);
                Ok(default)
            }
        },
        None => Ok(default),
    }
}
