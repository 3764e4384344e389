//! hope-repr library interface
//!
//! Program representation engine: enrolls households and individuals into
//! programs, merges registration imports, deduplicates identity documents
//! and closes adjudication tickets.

pub mod db;
pub mod models;
pub mod services;
pub mod utils;
