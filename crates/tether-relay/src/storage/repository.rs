//! Storage abstraction consumed by the registration service.

use async_trait::async_trait;

use tether_core::db::DatabaseError;
use tether_proto::v1::{Lease, Registration};

/// Durable store of member leases.
///
/// Implementations must report an absent lease as [`DatabaseError::NotFound`];
/// every other error is treated as an infrastructure failure.
#[async_trait]
pub trait LeaseRepository: Send + Sync {
    /// Insert or overwrite the lease for `lease.identifier`.
    async fn store_lease(&self, lease: &Lease) -> Result<(), DatabaseError>;

    /// Fetch the live lease for the registration's identifier.
    async fn fetch_lease(&self, registration: &Registration) -> Result<Lease, DatabaseError>;

    /// Remove the lease for `lease.identifier`.
    async fn delete_lease(&self, lease: &Lease) -> Result<(), DatabaseError>;
}
