//! Tether Relay Server Library
//!
//! Core functionality for the tether relay:
//! - Lease registration backed by a pluggable repository (`SQLite` by default)
//! - Connection registry of members parked on long-lived streams
//! - Session relaying of commands to members, one at a time
//! - Observer hooks for logging and metrics
//! - gRPC service adapter and a matching client

pub mod client;
pub mod config;
pub mod observer;
pub mod registration;
pub mod registry;
pub mod relay;
pub mod server;
pub mod storage;
