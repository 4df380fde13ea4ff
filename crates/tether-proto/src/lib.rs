//! Tether Protocol Buffers
//!
//! Generated protobuf code for the Tether relay gRPC API.
//!
//! This crate contains:
//! - `RelayService` for lease registration, member streams and sessions
//! - `Registration`, `Lease`, `Command` and `Output` messages

#![allow(clippy::derive_partial_eq_without_eq)]

/// Tether v1 API definitions.
///
/// All generated types and services are included here.
pub mod v1 {
    tonic::include_proto!("tether.v1");
}

// Re-export v1 as the default API version for convenience
pub use v1::*;
