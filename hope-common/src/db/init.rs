//! Database initialization
//!
//! Opens (or creates) the store, creates every table idempotently, runs
//! versioned migrations and seeds default settings.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(5000));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .min_connections(1)
        .connect_with(options.clone())
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    init_schema(&pool).await?;

    // Short busy timeout so lock contention surfaces quickly and is retried
    // with backoff up to database_max_lock_wait_ms by the caller
    let timeout_ms: i64 = sqlx::query_scalar(
        "SELECT CAST(value AS INTEGER) FROM settings WHERE key = 'database_lock_retry_ms'",
    )
    .fetch_optional(&pool)
    .await?
    .unwrap_or(250);

    pool.set_connect_options(options.busy_timeout(Duration::from_millis(timeout_ms.max(0) as u64)));
    info!("Database busy timeout set to {} ms", timeout_ms);

    Ok(pool)
}

/// Open a private in-memory store with the full schema.
///
/// Single connection: every unit of work must run on the transaction it
/// was handed, never on a second pooled connection.
pub async fn open_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    init_schema(&pool).await?;
    Ok(pool)
}

/// Create all tables, run migrations, seed settings (idempotent)
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_settings_table(pool).await?;

    // Business-area configuration (read-only for the engine)
    create_business_areas_table(pool).await?;
    create_programs_table(pool).await?;
    create_document_types_table(pool).await?;
    create_registration_imports_table(pool).await?;

    // Entities and cross-program identity
    create_collections_table(pool).await?;
    create_households_table(pool).await?;
    create_individuals_table(pool).await?;
    create_roles_table(pool).await?;

    // Satellites
    create_documents_table(pool).await?;
    create_identities_table(pool).await?;
    create_financial_accounts_table(pool).await?;
    create_entitlement_cards_table(pool).await?;

    // Adjudication
    create_grievance_tables(pool).await?;

    // Unit-of-work journal
    create_batch_journal_table(pool).await?;

    crate::db::migrations::run_migrations(pool).await?;

    init_default_settings(pool).await?;

    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the settings table
///
/// Stores runtime tunables as key-value pairs.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Initialize or update default settings
///
/// Ensures all required settings exist with default values and resets
/// NULL values to defaults.
async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    // Unit-of-work sizes
    ensure_setting(pool, "enrollment_batch_size", "500").await?;
    ensure_setting(pool, "merge_batch_size", "500").await?;
    ensure_setting(pool, "deduplication_batch_size", "2500").await?;

    // Lock handling
    ensure_setting(pool, "database_max_lock_wait_ms", "5000").await?;
    ensure_setting(pool, "database_lock_retry_ms", "250").await?;

    Ok(())
}

/// Ensure a setting exists with the specified default value
///
/// If the setting doesn't exist, it will be created with the default.
/// If the setting exists but has a NULL value, it will be reset to the default.
pub async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    let value: Option<Option<String>> =
        sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;

    match value {
        None => {
            // INSERT OR IGNORE: concurrent initializers may pass the check together
            sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(default_value)
                .execute(pool)
                .await?;
            info!("Initialized setting '{}' with default value: {}", key, default_value);
        }
        Some(None) => {
            sqlx::query(
                "UPDATE settings SET value = ?, updated_at = CURRENT_TIMESTAMP WHERE key = ?",
            )
            .bind(default_value)
            .bind(key)
            .execute(pool)
            .await?;
            warn!("Setting '{}' was NULL, reset to default: {}", key, default_value);
        }
        Some(Some(_)) => {}
    }

    Ok(())
}

async fn create_business_areas_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS business_areas (
            id TEXT PRIMARY KEY,
            slug TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            postpone_deduplication INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_programs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS programs (
            id TEXT PRIMARY KEY,
            business_area_id TEXT NOT NULL REFERENCES business_areas(id),
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'ACTIVE' CHECK (status IN ('DRAFT', 'ACTIVE', 'FINISHED')),
            UNIQUE (business_area_id, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_document_types_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_types (
            key TEXT PRIMARY KEY,
            label TEXT NOT NULL,
            valid_for_deduplication INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_registration_imports_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS registration_imports (
            id TEXT PRIMARY KEY,
            business_area_id TEXT NOT NULL REFERENCES business_areas(id),
            program_id TEXT REFERENCES programs(id),
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'IMPORTED'
                CHECK (status IN ('IMPORTED', 'MERGING', 'MERGED', 'MERGE_ERROR')),
            error_message TEXT,
            created_at TEXT NOT NULL,
            merged_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_collections_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL CHECK (kind IN ('HOUSEHOLD', 'INDIVIDUAL')),
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the households table
///
/// `head_of_household_id` is deferred: a household copy writes its members
/// and itself in one transaction in either order.
pub async fn create_households_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS households (
            id TEXT PRIMARY KEY,
            unicef_id TEXT NOT NULL,
            business_area_id TEXT NOT NULL REFERENCES business_areas(id),
            program_id TEXT REFERENCES programs(id),
            registration_import_id TEXT REFERENCES registration_imports(id),
            collection_id TEXT REFERENCES collections(id),
            copied_from_id TEXT,
            origin_unicef_id TEXT,
            head_of_household_id TEXT REFERENCES individuals(id) DEFERRABLE INITIALLY DEFERRED,
            size INTEGER,
            address TEXT,
            withdrawn INTEGER NOT NULL DEFAULT 0,
            rdi_merge_status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (rdi_merge_status IN ('PENDING', 'MERGED', 'REMOVED')),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One representation per lineage per program
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS uq_households_collection_program
        ON households(collection_id, program_id)
        WHERE collection_id IS NOT NULL AND program_id IS NOT NULL AND rdi_merge_status <> 'REMOVED'
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_households_copied_from ON households(copied_from_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_households_import ON households(registration_import_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the individuals table
pub async fn create_individuals_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS individuals (
            id TEXT PRIMARY KEY,
            unicef_id TEXT NOT NULL,
            household_id TEXT REFERENCES households(id) DEFERRABLE INITIALLY DEFERRED,
            business_area_id TEXT NOT NULL REFERENCES business_areas(id),
            program_id TEXT REFERENCES programs(id),
            registration_import_id TEXT REFERENCES registration_imports(id),
            collection_id TEXT REFERENCES collections(id),
            copied_from_id TEXT,
            origin_unicef_id TEXT,
            full_name TEXT NOT NULL,
            birth_date TEXT,
            relationship TEXT NOT NULL DEFAULT 'UNKNOWN',
            withdrawn INTEGER NOT NULL DEFAULT 0,
            duplicate INTEGER NOT NULL DEFAULT 0,
            unique_individual_id TEXT REFERENCES individuals(id),
            rdi_merge_status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (rdi_merge_status IN ('PENDING', 'MERGED', 'REMOVED')),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS uq_individuals_collection_program
        ON individuals(collection_id, program_id)
        WHERE collection_id IS NOT NULL AND program_id IS NOT NULL AND rdi_merge_status <> 'REMOVED'
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_individuals_household ON individuals(household_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_individuals_copied_from ON individuals(copied_from_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_roles_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS roles (
            id TEXT PRIMARY KEY,
            household_id TEXT NOT NULL REFERENCES households(id) DEFERRABLE INITIALLY DEFERRED,
            individual_id TEXT NOT NULL REFERENCES individuals(id) DEFERRABLE INITIALLY DEFERRED,
            role TEXT NOT NULL CHECK (role IN ('PRIMARY', 'ALTERNATE')),
            rdi_merge_status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (rdi_merge_status IN ('PENDING', 'MERGED', 'REMOVED')),
            created_at TEXT NOT NULL,
            UNIQUE (household_id, role),
            UNIQUE (household_id, individual_id)
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_roles_individual ON roles(individual_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the documents table
///
/// The partial unique index is the matching-key constraint: at most one
/// VALID merged document per (number, type, country) within a program.
pub async fn create_documents_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            individual_id TEXT NOT NULL REFERENCES individuals(id) DEFERRABLE INITIALLY DEFERRED,
            program_id TEXT REFERENCES programs(id),
            type_key TEXT NOT NULL REFERENCES document_types(key),
            document_number TEXT NOT NULL,
            country TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (status IN ('PENDING', 'VALID', 'NEED_INVESTIGATION', 'INVALID')),
            copied_from_id TEXT,
            rdi_merge_status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (rdi_merge_status IN ('PENDING', 'MERGED', 'REMOVED')),
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS uq_documents_valid_matching_key
        ON documents(document_number, type_key, country, program_id)
        WHERE status = 'VALID' AND rdi_merge_status = 'MERGED'
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_matching_key ON documents(document_number, \
         type_key, country)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_individual ON documents(individual_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_identities_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS identities (
            id TEXT PRIMARY KEY,
            individual_id TEXT NOT NULL REFERENCES individuals(id) DEFERRABLE INITIALLY DEFERRED,
            partner TEXT NOT NULL,
            number TEXT NOT NULL,
            country TEXT,
            copied_from_id TEXT,
            rdi_merge_status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (rdi_merge_status IN ('PENDING', 'MERGED', 'REMOVED')),
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_identities_individual ON identities(individual_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_financial_accounts_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS financial_accounts (
            id TEXT PRIMARY KEY,
            individual_id TEXT NOT NULL REFERENCES individuals(id) DEFERRABLE INITIALLY DEFERRED,
            kind TEXT NOT NULL,
            data TEXT NOT NULL DEFAULT '{}',
            copied_from_id TEXT,
            rdi_merge_status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (rdi_merge_status IN ('PENDING', 'MERGED', 'REMOVED')),
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_accounts_individual ON financial_accounts(individual_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_entitlement_cards_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entitlement_cards (
            id TEXT PRIMARY KEY,
            household_id TEXT NOT NULL REFERENCES households(id) DEFERRABLE INITIALLY DEFERRED,
            card_number TEXT NOT NULL,
            card_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'ACTIVE',
            copied_from_id TEXT,
            rdi_merge_status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (rdi_merge_status IN ('PENDING', 'MERGED', 'REMOVED')),
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_cards_household ON entitlement_cards(household_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_grievance_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS grievance_tickets (
            id TEXT PRIMARY KEY,
            category TEXT NOT NULL DEFAULT 'NEEDS_ADJUDICATION',
            issue_type TEXT NOT NULL DEFAULT 'DOCUMENT',
            status TEXT NOT NULL DEFAULT 'OPEN' CHECK (status IN ('OPEN', 'CLOSED')),
            business_area_id TEXT NOT NULL REFERENCES business_areas(id),
            program_id TEXT REFERENCES programs(id),
            golden_record_individual_id TEXT NOT NULL REFERENCES individuals(id),
            created_at TEXT NOT NULL,
            closed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ticket_possible_duplicates (
            ticket_id TEXT NOT NULL REFERENCES grievance_tickets(id),
            individual_id TEXT NOT NULL REFERENCES individuals(id),
            PRIMARY KEY (ticket_id, individual_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ticket_decisions (
            ticket_id TEXT NOT NULL REFERENCES grievance_tickets(id),
            individual_id TEXT NOT NULL REFERENCES individuals(id),
            decision TEXT NOT NULL CHECK (decision IN ('DISTINCT', 'DUPLICATE')),
            decided_at TEXT NOT NULL,
            PRIMARY KEY (ticket_id, individual_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_batch_journal_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS batch_journal (
            id TEXT PRIMARY KEY,
            operation TEXT NOT NULL,
            batch_index INTEGER NOT NULL,
            item_count INTEGER NOT NULL,
            succeeded INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            finished_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
