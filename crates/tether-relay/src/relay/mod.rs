//! Member and session stream handling.
//!
//! A member opens one long-lived stream and parks in the registry. A session
//! addresses a member by identifier and relays commands to it, one at a time.

mod session;


use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, instrument, warn};

use tether_proto::v1::{Command, Lease, Output};

use crate::config::RelayConfig;
use crate::observer::{CallSite, RelayEvent, RelayObserver};
use crate::registration::{RegistrationError, RegistrationService};
use crate::registry::{ConnectionRegistry, InboundStream, MemberConnection, RegistryError};
use crate::server::grpc_util::closed_status;

use session::SessionRelay;

/// Response stream handed back to a member.
pub type CommandStream = ReceiverStream<Result<Command, Status>>;

/// Response stream handed back to a session caller.
pub type OutputStream = ReceiverStream<Result<Output, Status>>;

/// Terminal handshake failures.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("stream ended before the handshake message")]
    MissingHandshake,

    #[error("stream receive failed: {0}")]
    Stream(Box<Status>),

    #[error("relay is shutting down")]
    Cancelled,
}

/// Accepts member and session streams.
pub struct RelayService {
    registration: Arc<RegistrationService>,
    registry: ConnectionRegistry,
    observer: Arc<dyn RelayObserver>,
    config: RelayConfig,
    shutdown: CancellationToken,
}

impl RelayService {
    pub fn new(
        registration: Arc<RegistrationService>,
        registry: ConnectionRegistry,
        observer: Arc<dyn RelayObserver>,
        config: RelayConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registration,
            registry,
            observer,
            config,
            shutdown,
        }
    }

    pub fn observer(&self) -> &Arc<dyn RelayObserver> {
        &self.observer
    }

    /// Run a member handshake and park the member in the registry.
    ///
    /// Returns the stream of commands to deliver to the member. The stream
    /// ends with a `closed` trailer when the relay shuts down, or with
    /// `ABORTED` when a session retires the member. The registry entry is
    /// dropped as soon as the member goes away, is retired, or the relay stops.
    #[instrument(skip_all, fields(rpc = "JoinCluster"))]
    pub async fn join_cluster(
        &self,
        mut inbound: InboundStream<Output>,
    ) -> Result<CommandStream, RelayError> {
        let init = self
            .await_handshake(&mut inbound, CallSite::JoinClusterRecv)
            .await?;
        let identifier = init.identifier;

        self.validate(&identifier, CallSite::JoinClusterValidate)
            .await?;

        let (command_tx, command_rx) = mpsc::channel(self.config.channel_capacity);
        let connection = Arc::new(MemberConnection::new(
            identifier.clone(),
            command_tx.clone(),
            inbound,
        ));
        let retired = connection.retired();
        let registration = self
            .registry
            .add(connection)
            .map_err(|e| self.fail(CallSite::JoinClusterAdd, e))?;
        self.observer
            .observe(&RelayEvent::ConnectionAdded { identifier: &identifier });
        self.observer.observe(&RelayEvent::ok(CallSite::JoinClusterAdd));
        info!(identifier = %identifier, "Member joined");

        let shutdown = self.shutdown.clone();
        let observer = Arc::clone(&self.observer);
        tokio::spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!(identifier = %identifier, "Closing member stream on shutdown");
                    if command_tx.try_send(Err(closed_status())).is_err() {
                        warn!(identifier = %identifier, "Could not deliver closed trailer");
                    }
                }
                () = retired.cancelled() => {
                    let status = Status::aborted(format!(
                        "client with ID {identifier} was retired with an unanswered command"
                    ));
                    if command_tx.try_send(Err(status)).is_err() {
                        warn!(identifier = %identifier, "Could not deliver retirement status");
                    }
                }
                () = command_tx.closed() => {
                    debug!(identifier = %identifier, "Member disconnected");
                }
            }
            drop(registration);
            observer.observe(&RelayEvent::ConnectionRemoved { identifier: &identifier });
            info!(identifier = %identifier, "Member left");
        });

        Ok(ReceiverStream::new(command_rx))
    }

    /// Run a session handshake and start relaying to the target member.
    ///
    /// The handshake command names the target in `identifier` and the
    /// caller's own lease in `caller`. It is not forwarded to the member.
    #[instrument(skip_all, fields(rpc = "StartSession"))]
    pub async fn start_session(
        &self,
        mut inbound: InboundStream<Command>,
    ) -> Result<OutputStream, RelayError> {
        let init = self
            .await_handshake(&mut inbound, CallSite::StartSessionInitRecv)
            .await?;

        self.validate(&init.caller, CallSite::StartSessionValidate)
            .await?;

        let member = self
            .registry
            .get(&init.identifier)
            .and_then(|conn| conn.claim())
            .map_err(|e| self.fail(CallSite::StartSessionLookup, e))?;
        self.observer
            .observe(&RelayEvent::ok(CallSite::StartSessionLookup));
        info!(caller = %init.caller, identifier = %init.identifier, "Session started");

        let (output_tx, output_rx) = mpsc::channel(self.config.channel_capacity);
        let relay = SessionRelay::new(
            inbound,
            output_tx,
            member,
            Arc::clone(&self.observer),
            self.config.failure_policy,
            self.shutdown.clone(),
        );
        tokio::spawn(relay.run());

        Ok(ReceiverStream::new(output_rx))
    }

    /// Receive the first message of a stream.
    async fn await_handshake<T: Send + 'static>(
        &self,
        inbound: &mut InboundStream<T>,
        site: CallSite,
    ) -> Result<T, RelayError> {
        let first = tokio::select! {
            () = self.shutdown.cancelled() => return Err(self.fail(site, RelayError::Cancelled)),
            first = inbound.next() => first,
        };
        match first {
            Some(Ok(message)) => Ok(message),
            Some(Err(status)) => Err(self.fail(site, RelayError::Stream(Box::new(status)))),
            None => Err(self.fail(site, RelayError::MissingHandshake)),
        }
    }

    /// Check that `identifier` holds a lease.
    ///
    /// The check is bounded by the registration timeout and abandoned when
    /// the relay shuts down.
    async fn validate(&self, identifier: &str, site: CallSite) -> Result<Lease, RelayError> {
        let result = tokio::select! {
            () = self.shutdown.cancelled() => Err(RelayError::Cancelled),
            checked = self.registration.check_identifier(identifier) => checked.map_err(RelayError::from),
        };
        match result {
            Ok(lease) => {
                self.observer.observe(&RelayEvent::ok(site));
                Ok(lease)
            }
            Err(e) => Err(self.fail(site, e)),
        }
    }

    /// Report a terminal handshake failure and hand it back.
    fn fail<E: Into<RelayError>>(&self, site: CallSite, err: E) -> RelayError {
        let err = err.into();
        self.observer.observe(&RelayEvent::failed(site, &err));
        err
    }
}
