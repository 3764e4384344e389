//! # HOPE Common Library
//!
//! Shared code for the representation engine and its command-line front end:
//! - Error taxonomy (conflict, not found, duplicate constraint, transient)
//! - Database schema creation and migrations
//! - Shared status/role value types
//! - Configuration loading (TOML bootstrap + database settings)
//! - Event bus used for search re-index notifications

pub mod config;
pub mod db;
pub mod error;
pub mod events;

pub use error::{Error, Result};
