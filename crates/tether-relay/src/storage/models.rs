//! Data models for Tether relay storage.

use tether_proto::v1::Lease;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LeaseRow {
    pub identifier: String,
    pub expiration: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<LeaseRow> for Lease {
    fn from(row: LeaseRow) -> Self {
        Self {
            identifier: row.identifier,
            expiration: row.expiration,
        }
    }
}
