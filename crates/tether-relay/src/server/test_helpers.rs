//! Shared test helpers for relay test modules.
//!
//! Provides stub repositories, a recording observer and channel-backed
//! streams used by the registration, relay and server tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Status;

use tether_core::db::{DatabaseError, unix_timestamp};
use tether_proto::v1::{Lease, Registration};

use crate::config::RelayConfig;
use crate::observer::{CallSite, RelayEvent, RelayObserver};
use crate::registration::RegistrationService;
use crate::registry::{ConnectionRegistry, InboundStream};
use crate::relay::RelayService;
use crate::storage::LeaseRepository;

/// In-memory repository with configurable latency and failure.
#[derive(Default)]
pub struct StubRepository {
    leases: Mutex<HashMap<String, Lease>>,
    delay: Duration,
    fail: bool,
    calls: AtomicUsize,
}

impl StubRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long before answering any call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail every call with an infrastructure error.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Seed a lease valid for the next hour.
    pub fn with_lease(self, identifier: &str) -> Self {
        self.leases.lock().unwrap().insert(
            identifier.to_string(),
            Lease {
                identifier: identifier.to_string(),
                expiration: unix_timestamp() + 3600,
            },
        );
        self
    }

    /// Number of repository calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn lease(&self, identifier: &str) -> Option<Lease> {
        self.leases.lock().unwrap().get(identifier).cloned()
    }

    async fn enter(&self) -> Result<(), DatabaseError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(DatabaseError::Query("disk I/O error at /var/lib/leases".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseRepository for StubRepository {
    async fn store_lease(&self, lease: &Lease) -> Result<(), DatabaseError> {
        self.enter().await?;
        self.leases
            .lock()
            .unwrap()
            .insert(lease.identifier.clone(), lease.clone());
        Ok(())
    }

    async fn fetch_lease(&self, registration: &Registration) -> Result<Lease, DatabaseError> {
        self.enter().await?;
        self.lease(&registration.identifier)
            .ok_or_else(|| DatabaseError::NotFound(registration.identifier.clone()))
    }

    async fn delete_lease(&self, lease: &Lease) -> Result<(), DatabaseError> {
        self.enter().await?;
        self.leases
            .lock()
            .unwrap()
            .remove(&lease.identifier)
            .map(|_| ())
            .ok_or_else(|| DatabaseError::NotFound(lease.identifier.clone()))
    }
}

/// Owned copy of a [`RelayEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Call { site: CallSite, error: Option<String> },
    Added(String),
    Removed(String),
    Throughput(CallSite, usize),
}

/// Observer that keeps every event for later assertions.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<Recorded>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    /// Number of failed calls recorded for `site`.
    pub fn failures(&self, site: CallSite) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Recorded::Call { site: s, error: Some(_) } if *s == site))
            .count()
    }

    pub fn contains(&self, event: &Recorded) -> bool {
        self.events().contains(event)
    }
}

impl RelayObserver for RecordingObserver {
    fn observe(&self, event: &RelayEvent<'_>) {
        let recorded = match *event {
            RelayEvent::Call { site, error } => Recorded::Call {
                site,
                error: error.map(ToString::to_string),
            },
            RelayEvent::ConnectionAdded { identifier } => Recorded::Added(identifier.into()),
            RelayEvent::ConnectionRemoved { identifier } => Recorded::Removed(identifier.into()),
            RelayEvent::Throughput { site, bytes } => Recorded::Throughput(site, bytes),
        };
        self.events.lock().unwrap().push(recorded);
    }
}

/// Channel-backed inbound stream plus the sender that feeds it.
pub fn inbound_stream<T: Send + 'static>() -> (mpsc::Sender<Result<T, Status>>, InboundStream<T>) {
    let (tx, rx) = mpsc::channel(16);
    (tx, Box::pin(ReceiverStream::new(rx)))
}

/// Everything a relay test needs to drive and inspect a [`RelayService`].
pub struct RelayHarness {
    pub relay: Arc<RelayService>,
    pub registration: Arc<RegistrationService>,
    pub registry: ConnectionRegistry,
    pub observer: Arc<RecordingObserver>,
    pub repository: Arc<StubRepository>,
    pub shutdown: CancellationToken,
}

/// Build a relay over `repository` with the given config.
pub fn relay_harness(repository: StubRepository, config: RelayConfig) -> RelayHarness {
    let repository = Arc::new(repository);
    let observer = Arc::new(RecordingObserver::default());
    let registry = ConnectionRegistry::new();
    let shutdown = CancellationToken::new();
    let registration = Arc::new(RegistrationService::new(
        Arc::clone(&repository) as Arc<dyn LeaseRepository>,
        config.validation_timeout,
    ));
    let relay = Arc::new(RelayService::new(
        Arc::clone(&registration),
        registry.clone(),
        Arc::clone(&observer) as Arc<dyn RelayObserver>,
        config,
        shutdown.clone(),
    ));
    RelayHarness {
        relay,
        registration,
        registry,
        observer,
        repository,
        shutdown,
    }
}

/// Relay config with a generous validation timeout for tests.
pub fn test_config() -> RelayConfig {
    RelayConfig {
        validation_timeout: Duration::from_secs(5),
        ..RelayConfig::default()
    }
}
