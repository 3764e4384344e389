//! Typed payloads stored as JSON

pub mod account;

pub use account::{AccountDetails, AccountKind, Capability, CAPABILITIES};
