//! In-memory connection registry for member streams.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{OwnedMutexGuard, mpsc};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, warn};

use tether_proto::v1::{Command, Output};

/// Boxed inbound half of a gRPC stream.
pub type InboundStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send + 'static>>;

/// Registry lookups and insertions that cannot be satisfied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("ID {0} has already connected")]
    AlreadyConnected(String),

    #[error("no active client with ID {0}")]
    NotConnected(String),

    #[error("client with ID {0} is already serving a session")]
    Busy(String),
}

/// Live stream of one member.
///
/// Commands are pushed into the member's response stream; outputs are read
/// from its request stream. Only one [`MemberSession`] can hold the output
/// side at a time.
pub struct MemberConnection {
    identifier: String,
    commands: mpsc::Sender<Result<Command, Status>>,
    outputs: Arc<tokio::sync::Mutex<InboundStream<Output>>>,
    retired: CancellationToken,
}

impl MemberConnection {
    pub fn new(
        identifier: String,
        commands: mpsc::Sender<Result<Command, Status>>,
        outputs: InboundStream<Output>,
    ) -> Self {
        Self {
            identifier,
            commands,
            outputs: Arc::new(tokio::sync::Mutex::new(outputs)),
            retired: CancellationToken::new(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Whether the member has stopped reading commands or was retired.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed() || self.retired.is_cancelled()
    }

    /// Cancelled once a session retires this member.
    pub fn retired(&self) -> CancellationToken {
        self.retired.clone()
    }

    /// Take exclusive use of this member for one session.
    ///
    /// Fails with [`RegistryError::Busy`] while another session holds it.
    pub fn claim(&self) -> Result<MemberSession, RegistryError> {
        let outputs = Arc::clone(&self.outputs)
            .try_lock_owned()
            .map_err(|_| RegistryError::Busy(self.identifier.clone()))?;

        debug!(identifier = %self.identifier, "Member claimed by session");
        Ok(MemberSession {
            identifier: self.identifier.clone(),
            commands: self.commands.clone(),
            outputs,
            retired: self.retired.clone(),
        })
    }
}

/// Exclusive handle on a member, held by one session for its lifetime.
pub struct MemberSession {
    identifier: String,
    commands: mpsc::Sender<Result<Command, Status>>,
    outputs: OwnedMutexGuard<InboundStream<Output>>,
    retired: CancellationToken,
}

impl MemberSession {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Push a command to the member. Fails once the member stream is gone.
    pub async fn send(&mut self, command: Command) -> Result<(), Status> {
        self.commands.send(Ok(command)).await.map_err(|_| {
            Status::unavailable(format!("client with ID {} disconnected", self.identifier))
        })
    }

    /// Receive the member's next output. `None` means the member closed its
    /// side of the stream.
    pub async fn recv(&mut self) -> Option<Result<Output, Status>> {
        self.outputs.next().await
    }

    /// Take the member out of service.
    ///
    /// Used when a command was delivered but its output can no longer be
    /// routed; the member stream is then ended so a stale output never
    /// reaches another session.
    pub fn retire(&self) {
        warn!(identifier = %self.identifier, "Retiring member with an unanswered command");
        self.retired.cancel();
    }
}

/// Thread-safe registry of member connections.
///
/// At most one connection exists per identifier. Entries are removed when the
/// [`MemberRegistration`] returned by [`ConnectionRegistry::add`] is dropped.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    members: Arc<Mutex<HashMap<String, Arc<MemberConnection>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<MemberConnection>>> {
        // The map is never left half-updated, so a poisoned lock is still usable.
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a member connection.
    ///
    /// Fails without touching the existing entry if the identifier is
    /// already connected.
    pub fn add(
        &self,
        connection: Arc<MemberConnection>,
    ) -> Result<MemberRegistration, RegistryError> {
        let identifier = connection.identifier().to_string();
        {
            let mut members = self.lock();
            if members.contains_key(&identifier) {
                return Err(RegistryError::AlreadyConnected(identifier));
            }
            members.insert(identifier.clone(), Arc::clone(&connection));
        }
        info!(identifier = %identifier, "Member connection registered");

        Ok(MemberRegistration {
            registry: self.clone(),
            connection,
        })
    }

    /// Get a live member connection by identifier.
    ///
    /// An entry whose member is already gone counts as not connected.
    pub fn get(&self, identifier: &str) -> Result<Arc<MemberConnection>, RegistryError> {
        self.lock()
            .get(identifier)
            .filter(|conn| !conn.is_closed())
            .cloned()
            .ok_or_else(|| RegistryError::NotConnected(identifier.to_string()))
    }

    /// Remove a member connection.
    pub fn remove(&self, identifier: &str) -> Option<Arc<MemberConnection>> {
        let conn = self.lock().remove(identifier);
        if conn.is_some() {
            info!(identifier = %identifier, "Member connection unregistered");
        } else {
            warn!(identifier = %identifier, "Tried to unregister unknown connection");
        }
        conn
    }

    /// Remove `connection` only if it is still the registered entry.
    fn remove_if_current(&self, connection: &Arc<MemberConnection>) -> bool {
        let mut members = self.lock();
        match members.get(connection.identifier()) {
            Some(current) if Arc::ptr_eq(current, connection) => {
                members.remove(connection.identifier());
                true
            }
            _ => false,
        }
    }

    /// Check if a member is connected.
    pub fn is_connected(&self, identifier: &str) -> bool {
        self.lock().contains_key(identifier)
    }

    /// Get all connected member identifiers.
    pub fn connected_members(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Count of active connections.
    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }
}

/// Ownership of a registry entry. Dropping it unregisters the member.
pub struct MemberRegistration {
    registry: ConnectionRegistry,
    connection: Arc<MemberConnection>,
}

impl MemberRegistration {
    pub fn identifier(&self) -> &str {
        self.connection.identifier()
    }
}

impl Drop for MemberRegistration {
    fn drop(&mut self) {
        if self.registry.remove_if_current(&self.connection) {
            info!(identifier = %self.identifier(), "Member connection unregistered");
        }
    }
}
