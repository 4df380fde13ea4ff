//! Database queries for the Tether relay server.

use async_trait::async_trait;
use tracing::debug;

use tether_core::db::{DatabaseError, unix_timestamp};
use tether_proto::v1::{Lease, Registration};

use super::db::RelayDatabase;
use super::models::LeaseRow;
use super::repository::LeaseRepository;

impl RelayDatabase {
    /// Get the stored lease row for an identifier, expired or not.
    pub async fn get_lease_row(&self, identifier: &str) -> Result<LeaseRow, DatabaseError> {
        sqlx::query_as::<_, LeaseRow>("SELECT * FROM leases WHERE identifier = ?")
            .bind(identifier)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Lease {identifier}")))
    }

    /// List identifiers whose lease has not expired yet.
    pub async fn list_live_identifiers(&self) -> Result<Vec<String>, DatabaseError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT identifier FROM leases WHERE expiration > ? ORDER BY identifier",
        )
        .bind(unix_timestamp())
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Delete every lease that expired at or before `now`.
    pub async fn delete_expired_leases(&self, now: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM leases WHERE expiration <= ?")
            .bind(now)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl LeaseRepository for RelayDatabase {
    async fn store_lease(&self, lease: &Lease) -> Result<(), DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            "INSERT INTO leases (identifier, expiration, created_at, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(identifier) DO UPDATE SET expiration = excluded.expiration, updated_at = excluded.updated_at",
        )
        .bind(&lease.identifier)
        .bind(lease.expiration)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        debug!(identifier = %lease.identifier, expiration = lease.expiration, "Lease stored");
        Ok(())
    }

    async fn fetch_lease(&self, registration: &Registration) -> Result<Lease, DatabaseError> {
        sqlx::query_as::<_, LeaseRow>("SELECT * FROM leases WHERE identifier = ? AND expiration > ?")
            .bind(&registration.identifier)
            .bind(unix_timestamp())
            .fetch_optional(self.pool())
            .await?
            .map(Lease::from)
            .ok_or_else(|| DatabaseError::NotFound(format!("Lease {}", registration.identifier)))
    }

    async fn delete_lease(&self, lease: &Lease) -> Result<(), DatabaseError> {
        let result = sqlx::query("DELETE FROM leases WHERE identifier = ?")
            .bind(&lease.identifier)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Lease {}", lease.identifier)));
        }
        debug!(identifier = %lease.identifier, "Lease deleted");
        Ok(())
    }
}
