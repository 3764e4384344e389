//! Database schema migrations
//!
//! Versioned, idempotent migrations tracked in `schema_version`. Tables are
//! created by [`crate::db::init`] with `CREATE TABLE IF NOT EXISTS`; anything
//! that changes an existing table or backfills data belongs here.
//!
//! # Migration Guidelines
//!
//! 1. **Never modify existing migrations** - databases in the field depend on them
//! 2. **Always add new migrations** - one function per schema change
//! 3. **Check before altering** - every migration must be safe to run twice

use crate::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};

/// Current schema version
///
/// **IMPORTANT:** Increment this when adding new migrations
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Get current schema version from database
///
/// Returns 0 if schema_version table doesn't exist or has no rows
async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let table_exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM sqlite_master
            WHERE type='table' AND name='schema_version'
        )
        "#,
    )
    .fetch_one(pool)
    .await?;

    if !table_exists {
        return Ok(0);
    }

    let version: Option<i32> = sqlx::query_scalar(
        "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;

    Ok(version.unwrap_or(0))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;

    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let current_version = get_schema_version(pool).await?;

    if current_version == CURRENT_SCHEMA_VERSION {
        info!("Database schema is up to date (v{})", current_version);
        return Ok(());
    }

    if current_version > CURRENT_SCHEMA_VERSION {
        warn!(
            "Database schema version ({}) is newer than code version ({})",
            current_version, CURRENT_SCHEMA_VERSION
        );
        return Ok(());
    }

    info!(
        "Running database migrations: v{} -> v{}",
        current_version, CURRENT_SCHEMA_VERSION
    );

    if current_version < 1 {
        migrate_v1(pool).await?;
        set_schema_version(pool, 1).await?;
        info!("Migration v1 completed");
    }

    if current_version < 2 {
        migrate_v2(pool).await?;
        set_schema_version(pool, 2).await?;
        info!("Migration v2 completed");
    }

    Ok(())
}

async fn has_column(pool: &SqlitePool, table: &str, column: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?",
    )
    .bind(table)
    .bind(column)
    .fetch_one(pool)
    .await?;

    Ok(count > 0)
}

/// Migration v1: record the matching key on adjudication tickets
///
/// Tickets created before this column existed keep NULL; ticket reuse
/// works on implicated individuals, not on the key.
async fn migrate_v1(pool: &SqlitePool) -> Result<()> {
    if has_column(pool, "grievance_tickets", "matching_key").await? {
        info!("  matching_key column already exists - skipping");
        return Ok(());
    }

    sqlx::query("ALTER TABLE grievance_tickets ADD COLUMN matching_key TEXT")
        .execute(pool)
        .await?;

    info!("  Added matching_key column to grievance_tickets");
    Ok(())
}

/// Migration v2: backfill origin_unicef_id on in-place representations
///
/// Rows adjusted in place point at themselves through copied_from_id; older
/// rows were written without stamping their pre-copy identifier.
async fn migrate_v2(pool: &SqlitePool) -> Result<()> {
    for table in ["households", "individuals"] {
        let sql = format!(
            "UPDATE {} SET origin_unicef_id = unicef_id \
             WHERE copied_from_id = id AND origin_unicef_id IS NULL",
            table
        );
        let result = sqlx::query(&sql).execute(pool).await?;
        if result.rows_affected() > 0 {
            info!("  Backfilled origin_unicef_id on {} {} rows", result.rows_affected(), table);
        }
    }

    Ok(())
}
