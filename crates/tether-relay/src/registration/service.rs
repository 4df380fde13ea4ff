//! Registration service backed by a [`LeaseRepository`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use tether_core::db::{DatabaseError, unix_timestamp};
use tether_proto::v1::{Lease, Registration};

use crate::storage::LeaseRepository;

const REPOSITORY_MESSAGE: &str = "error communicating with repository";

/// Failures of the registration operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// Malformed request, rejected before any repository access.
    #[error("invalid request received: {0}")]
    Validation(String),

    /// The repository failed. The detail is for logs only.
    #[error("error communicating with repository: {0}")]
    Repository(String),

    /// No lease exists for the identifier.
    #[error("no lease matching identifier found")]
    NoLease,

    /// The call did not complete within the configured timeout.
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),
}

impl RegistrationError {
    /// Message that is safe to return to callers.
    pub fn sanitized(&self) -> String {
        match self {
            Self::Validation(_) => self.to_string(),
            Self::Repository(_) => REPOSITORY_MESSAGE.to_string(),
            Self::NoLease => self.to_string(),
            Self::DeadlineExceeded(_) => "deadline exceeded".to_string(),
        }
    }

    fn from_repository(err: DatabaseError) -> Self {
        if err.is_not_found() {
            Self::NoLease
        } else {
            Self::Repository(err.to_string())
        }
    }
}

/// Check the structural shape of a registration.
pub fn validate_registration(registration: &Registration) -> Result<(), RegistrationError> {
    validate_identifier(&registration.identifier)?;
    if registration.duration == 0 {
        return Err(RegistrationError::Validation(
            "duration must be greater than zero".into(),
        ));
    }
    Ok(())
}

fn validate_identifier(identifier: &str) -> Result<(), RegistrationError> {
    if identifier.is_empty() {
        return Err(RegistrationError::Validation("missing identifier".into()));
    }
    Ok(())
}

/// Creates, checks and removes leases.
///
/// Every operation is bounded by the timeout given at construction.
pub struct RegistrationService {
    repository: Arc<dyn LeaseRepository>,
    timeout: Duration,
}

impl RegistrationService {
    pub fn new(repository: Arc<dyn LeaseRepository>, timeout: Duration) -> Self {
        Self {
            repository,
            timeout,
        }
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, RegistrationError>>,
    ) -> Result<T, RegistrationError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| RegistrationError::DeadlineExceeded(self.timeout))?
    }

    /// Create or refresh the lease for `registration.identifier`.
    ///
    /// The new expiration is `now + duration`.
    pub async fn register(&self, registration: &Registration) -> Result<Lease, RegistrationError> {
        validate_registration(registration)?;
        self.bounded(async {
            let mut lease = match self.repository.fetch_lease(registration).await {
                Ok(lease) => lease,
                Err(e) if e.is_not_found() => Lease::default(),
                Err(e) => return Err(RegistrationError::from_repository(e)),
            };

            lease.expiration = unix_timestamp() + i64::from(registration.duration);
            lease.identifier.clone_from(&registration.identifier);
            self.repository
                .store_lease(&lease)
                .await
                .map_err(RegistrationError::from_repository)?;

            info!(
                identifier = %lease.identifier,
                expiration = lease.expiration,
                "Lease registered"
            );
            Ok(lease)
        })
        .await
    }

    /// Return the current lease for `registration.identifier`.
    pub async fn check_registration(
        &self,
        registration: &Registration,
    ) -> Result<Lease, RegistrationError> {
        validate_registration(registration)?;
        self.bounded(self.fetch(registration)).await
    }

    /// Return the current lease for a bare identifier.
    ///
    /// Used by stream handshakes, which carry an identifier but no duration.
    pub async fn check_identifier(&self, identifier: &str) -> Result<Lease, RegistrationError> {
        validate_identifier(identifier)?;
        let registration = Registration {
            identifier: identifier.to_string(),
            duration: 0,
        };
        self.bounded(self.fetch(&registration)).await
    }

    /// Remove the lease for `registration.identifier`.
    ///
    /// Returns an empty lease, not an error, when nothing was registered.
    pub async fn deregister(&self, registration: &Registration) -> Result<Lease, RegistrationError> {
        validate_registration(registration)?;
        self.bounded(async {
            let lease = match self.fetch(registration).await {
                Ok(lease) => lease,
                Err(RegistrationError::NoLease) => {
                    debug!(identifier = %registration.identifier, "Deregister without lease");
                    return Ok(Lease::default());
                }
                Err(e) => return Err(e),
            };

            match self.repository.delete_lease(&lease).await {
                // Removed concurrently; the outcome is the same.
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(RegistrationError::from_repository(e)),
                Ok(()) => {}
            }

            info!(identifier = %lease.identifier, "Lease deregistered");
            Ok(lease)
        })
        .await
    }

    async fn fetch(&self, registration: &Registration) -> Result<Lease, RegistrationError> {
        self.repository
            .fetch_lease(registration)
            .await
            .map_err(RegistrationError::from_repository)
    }
}
