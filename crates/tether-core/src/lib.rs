//! Tether Core Library
//!
//! Shared functionality for Tether components:
//! - `SQLite` pool helpers and the shared `DatabaseError`
//! - Tracing subscriber initialisation
//! - Optional `OpenTelemetry` export (`metrics` feature)

pub mod db;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod tracing_init;

pub use db::{DatabaseError, unix_timestamp};
