//! Repository layer
//!
//! Plain async query functions over `&mut SqliteConnection` returning value
//! objects. Every call runs on the connection of the unit of work that owns
//! it; nothing here opens its own transaction.
//!
//! Ids are stored as hyphenated UUID text and timestamps as fixed-width
//! RFC 3339 (microseconds, `Z`), so lexical order is chronological order.

pub mod accounts;
pub mod cards;
pub mod collections;
pub mod documents;
pub mod households;
pub mod identities;
pub mod imports;
pub mod individuals;
pub mod journal;
pub mod programs;
pub mod roles;
pub mod tickets;

use chrono::{DateTime, SecondsFormat, Utc};
use hope_common::{Error, Result};
use uuid::Uuid;

/// Current time in storage format
pub fn now_text() -> String {
    to_text(Utc::now())
}

/// Timestamp in storage format
pub fn to_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Invalid timestamp in database '{}': {}", raw, e)))
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| Error::Internal(format!("Invalid UUID in database '{}': {}", raw, e)))
}

pub(crate) fn parse_opt_uuid(raw: Option<String>) -> Result<Option<Uuid>> {
    raw.as_deref().map(parse_uuid).transpose()
}

pub(crate) fn opt_text(id: Option<Uuid>) -> Option<String> {
    id.map(|u| u.to_string())
}
