//! Database initialization tests
//!
//! - Automatic database creation with the full schema
//! - Re-opening an existing database
//! - Default settings and NULL reset behavior
//! - Engine settings loading

use hope_common::config::EngineSettings;
use hope_common::db::init::{ensure_setting, init_database};
use tempfile::TempDir;

#[tokio::test]
async fn test_database_creation_when_missing() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("nested").join("hope.db");

    let pool = init_database(&db_path).await;

    assert!(pool.is_ok(), "Database initialization failed: {:?}", pool.err());
    assert!(db_path.exists(), "Database file was not created");
}

#[tokio::test]
async fn test_database_opens_existing() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("hope.db");

    let pool1 = init_database(&db_path).await.unwrap();
    sqlx::query(
        "INSERT INTO business_areas (id, slug, name) VALUES ('ba-1', 'afghanistan', 'Afghanistan')",
    )
    .execute(&pool1)
    .await
    .unwrap();
    pool1.close().await;

    let pool2 = init_database(&db_path).await.unwrap();
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM business_areas")
        .fetch_one(&pool2)
        .await
        .unwrap();
    assert_eq!(count, 1, "Existing rows must survive re-initialization");
}

#[tokio::test]
async fn test_all_tables_created() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("hope.db")).await.unwrap();

    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY \
         name",
    )
    .fetch_all(&pool)
    .await
    .unwrap();

    for expected in [
        "batch_journal",
        "business_areas",
        "collections",
        "document_types",
        "documents",
        "entitlement_cards",
        "financial_accounts",
        "grievance_tickets",
        "households",
        "identities",
        "individuals",
        "programs",
        "registration_imports",
        "roles",
        "schema_version",
        "settings",
        "ticket_decisions",
        "ticket_possible_duplicates",
    ] {
        assert!(tables.iter().any(|t| t == expected), "missing table {}", expected);
    }
}

#[tokio::test]
async fn test_default_settings_initialized() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("hope.db")).await.unwrap();

    let settings = EngineSettings::load(&pool).await.unwrap();
    assert_eq!(settings, EngineSettings::default());
    assert_eq!(settings.enrollment_batch_size, 500);
    assert_eq!(settings.deduplication_batch_size, 2500);
}

#[tokio::test]
async fn test_null_setting_reset_to_default() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("hope.db")).await.unwrap();

    sqlx::query("UPDATE settings SET value = NULL WHERE key = 'merge_batch_size'")
        .execute(&pool)
        .await
        .unwrap();
    ensure_setting(&pool, "merge_batch_size", "500").await.unwrap();

    let value: String =
        sqlx::query_scalar("SELECT value FROM settings WHERE key = 'merge_batch_size'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(value, "500");
}

#[tokio::test]
async fn test_custom_and_invalid_settings() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("hope.db")).await.unwrap();

    sqlx::query("UPDATE settings SET value = '50' WHERE key = 'enrollment_batch_size'")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("UPDATE settings SET value = 'lots' WHERE key = 'deduplication_batch_size'")
        .execute(&pool)
        .await
        .unwrap();

    let settings = EngineSettings::load(&pool).await.unwrap();
    assert_eq!(settings.enrollment_batch_size, 50);
    assert_eq!(settings.deduplication_batch_size, 2500, "unparsable value falls back to default");
}
