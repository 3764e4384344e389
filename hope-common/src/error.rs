//! Common error types for the representation engine
//!
//! Store errors arrive as [`Error::Database`] through `?`. The batch boundary
//! calls [`Error::classify`] to turn them into the engine taxonomy
//! (duplicate constraint vs. transient) before deciding whether an item
//! failure is reportable or the whole unit of work must be abandoned.

use thiserror::Error;
use uuid::Uuid;

/// Common result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the engine
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Referenced entity, role or ticket does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Role conflict, uncovered reassignment, unresolved head of household
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Matching-key collision while writing a satellite row
    #[error("Duplicate constraint on {field} (entity {entity_id})")]
    DuplicateConstraint {
        /// Source entity whose write collided (nil when unknown)
        entity_id: Uuid,
        /// Constraint columns reported by the store
        field: String,
    },

    /// Lock timeout, busy store, lost connection. Safe to retry the batch.
    #[error("Transient store error: {0}")]
    Transient(String),

    /// Invalid caller input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map raw store errors onto the engine taxonomy.
    ///
    /// Non-database variants pass through untouched.
    pub fn classify(self) -> Self {
        match self {
            Error::Database(err) => classify_sqlx(err),
            other => other,
        }
    }

    /// Attach the source entity to a duplicate-constraint error.
    pub fn for_entity(self, id: Uuid) -> Self {
        match self.classify() {
            Error::DuplicateConstraint { field, .. } => Error::DuplicateConstraint {
                entity_id: id,
                field,
            },
            other => other,
        }
    }

    /// Whether the whole batch may be retried by the caller
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transient(_) => true,
            Error::Database(err) => is_lock_or_connection(err),
            _ => false,
        }
    }

    /// Whether the error belongs to a single item and the surrounding
    /// batch can still commit after rolling the item back
    pub fn is_item_level(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::Conflict(_)
                | Error::DuplicateConstraint { .. }
                | Error::InvalidInput(_)
        )
    }

    /// Short machine-readable kind used in failure reports
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Database(_) => "DATABASE",
            Error::Io(_) => "IO",
            Error::Config(_) => "CONFIG",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Conflict(_) => "CONFLICT",
            Error::DuplicateConstraint { .. } => "DUPLICATE_CONSTRAINT",
            Error::Transient(_) => "TRANSIENT",
            Error::InvalidInput(_) => "INVALID_INPUT",
            Error::Internal(_) => "INTERNAL",
        }
    }
}

fn classify_sqlx(err: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            // SQLite: "UNIQUE constraint failed: documents.document_number, ..."
            let message = db_err.message();
            let field = message
                .split_once(':')
                .map(|(_, cols)| cols.trim().to_string())
                .unwrap_or_else(|| message.to_string());
            return Error::DuplicateConstraint {
                entity_id: Uuid::nil(),
                field,
            };
        }
    }

    if is_lock_or_connection(&err) {
        return Error::Transient(err.to_string());
    }

    Error::Database(err)
}

fn is_lock_or_connection(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db_err) => {
            let message = db_err.message();
            message.contains("database is locked") || message.contains("database table is locked")
        }
        _ => false,
    }
}
