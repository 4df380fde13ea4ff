//! Lease storage for the Tether relay.
//!
//! The relay core only talks to [`LeaseRepository`]; [`RelayDatabase`] is the
//! `SQLite` implementation used by the binary.

mod db;
mod models;
mod queries;
mod repository;


pub use db::RelayDatabase;
pub use models::LeaseRow;
pub use repository::LeaseRepository;
pub use tether_core::db::DatabaseError;
