//! Relay client.
//!
//! Thin wrapper over the generated gRPC client. Unary calls are bounded by a
//! per-call timeout; the streaming calls send their handshake message and
//! hand back typed links.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint};
use tonic::{Response, Status, Streaming};
use tracing::{debug, info};

use tether_proto::v1::relay_service_client::RelayServiceClient;
use tether_proto::v1::{Command, Lease, Output, Registration};

use crate::server::grpc_util::has_closed_trailer;

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay address, e.g. `http://127.0.0.1:50051`.
    pub addr: String,
    pub connect_timeout: Duration,
    /// Upper bound on each unary call.
    pub request_timeout: Duration,
    /// Buffer size of the outbound stream channels.
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: "http://127.0.0.1:50051".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            channel_capacity: 32,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("RPC call failed: {0}")]
    Rpc(Box<Status>),

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Stream closed by the relay")]
    StreamClosed,
}

impl ClientError {
    /// The gRPC status, when the relay answered with one.
    pub fn status(&self) -> Option<&Status> {
        match self {
            Self::Rpc(status) => Some(status),
            _ => None,
        }
    }
}

impl From<Status> for ClientError {
    fn from(status: Status) -> Self {
        Self::Rpc(Box::new(status))
    }
}

/// Connection to a relay.
#[derive(Debug, Clone)]
pub struct RelayClient {
    config: ClientConfig,
    client: RelayServiceClient<Channel>,
}

impl RelayClient {
    /// Connect to the relay at `config.addr`.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let endpoint = Endpoint::from_shared(config.addr.clone())
            .map_err(|e| ClientError::InvalidAddress(e.to_string()))?
            .connect_timeout(config.connect_timeout)
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_timeout(Duration::from_secs(10));

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| ClientError::ConnectFailed(e.to_string()))?;

        info!(addr = %config.addr, "Connected to relay");
        Ok(Self::from_channel(channel, config))
    }

    pub fn from_channel(channel: Channel, config: ClientConfig) -> Self {
        Self {
            config,
            client: RelayServiceClient::new(channel),
        }
    }

    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<Response<T>, Status>>,
    ) -> Result<T, ClientError> {
        let response = tokio::time::timeout(self.config.request_timeout, call)
            .await
            .map_err(|_| ClientError::Timeout(self.config.request_timeout))??;
        Ok(response.into_inner())
    }

    /// Take or refresh the lease for `identifier`, valid `duration_secs`.
    pub async fn register(&self, identifier: &str, duration_secs: u32) -> Result<Lease, ClientError> {
        let mut client = self.client.clone();
        self.bounded(client.register(registration(identifier, duration_secs)))
            .await
    }

    pub async fn check_registration(
        &self,
        identifier: &str,
        duration_secs: u32,
    ) -> Result<Lease, ClientError> {
        let mut client = self.client.clone();
        self.bounded(client.check_registration(registration(identifier, duration_secs)))
            .await
    }

    /// Release the lease for `identifier`. Returns an empty lease when there
    /// was none.
    pub async fn deregister(&self, identifier: &str, duration_secs: u32) -> Result<Lease, ClientError> {
        let mut client = self.client.clone();
        self.bounded(client.deregister(registration(identifier, duration_secs)))
            .await
    }

    /// Join the cluster as `identifier`.
    ///
    /// The identifier must hold a lease. Resolves once the relay has
    /// accepted the member.
    pub async fn join_cluster(&self, identifier: &str) -> Result<MemberLink, ClientError> {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        // The relay answers only after reading the handshake.
        tx.send(Output {
            identifier: identifier.to_string(),
            ..Default::default()
        })
        .await
        .map_err(|_| ClientError::StreamClosed)?;

        let mut client = self.client.clone();
        let commands = client
            .join_cluster(ReceiverStream::new(rx))
            .await?
            .into_inner();
        debug!(identifier = %identifier, "Joined cluster");

        Ok(MemberLink {
            identifier: identifier.to_string(),
            outputs: tx,
            commands,
        })
    }

    /// Open a session from `caller` to the member `target`.
    pub async fn start_session(&self, caller: &str, target: &str) -> Result<SessionLink, ClientError> {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        tx.send(Command {
            identifier: target.to_string(),
            caller: caller.to_string(),
            ..Default::default()
        })
        .await
        .map_err(|_| ClientError::StreamClosed)?;

        let mut client = self.client.clone();
        let outputs = client
            .start_session(ReceiverStream::new(rx))
            .await?
            .into_inner();
        debug!(caller = %caller, target = %target, "Session started");

        Ok(SessionLink {
            identifier: target.to_string(),
            commands: tx,
            outputs,
        })
    }
}

fn registration(identifier: &str, duration: u32) -> Registration {
    Registration {
        identifier: identifier.to_string(),
        duration,
    }
}

/// A member's side of a `JoinCluster` stream.
#[derive(Debug)]
pub struct MemberLink {
    identifier: String,
    outputs: mpsc::Sender<Output>,
    commands: Streaming<Command>,
}

impl MemberLink {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Wait for the next command. `None` means the relay ended the stream.
    pub async fn next_command(&mut self) -> Result<Option<Command>, ClientError> {
        Ok(self.commands.message().await?)
    }

    /// Answer the current command.
    pub async fn reply(&self, contents: Vec<u8>) -> Result<(), ClientError> {
        self.outputs
            .send(Output {
                identifier: self.identifier.clone(),
                contents,
            })
            .await
            .map_err(|_| ClientError::StreamClosed)
    }

    /// After the command stream ended: whether the relay closed it on
    /// shutdown.
    pub async fn closed_by_relay(&mut self) -> Result<bool, ClientError> {
        let trailers = self.commands.trailers().await?;
        Ok(trailers.is_some_and(|t| has_closed_trailer(&t)))
    }
}

/// A caller's side of a `StartSession` stream.
#[derive(Debug)]
pub struct SessionLink {
    identifier: String,
    commands: mpsc::Sender<Command>,
    outputs: Streaming<Output>,
}

impl SessionLink {
    /// Identifier of the member this session talks to.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Send one command and wait for the member's output.
    pub async fn execute(&mut self, contents: Vec<u8>) -> Result<Output, ClientError> {
        self.commands
            .send(Command {
                identifier: self.identifier.clone(),
                contents,
                ..Default::default()
            })
            .await
            .map_err(|_| ClientError::StreamClosed)?;

        self.outputs
            .message()
            .await?
            .ok_or(ClientError::StreamClosed)
    }

    /// Wait for the next output without sending anything.
    pub async fn next_output(&mut self) -> Result<Option<Output>, ClientError> {
        Ok(self.outputs.message().await?)
    }

    /// After the output stream ended: whether the relay closed it on
    /// shutdown.
    pub async fn closed_by_relay(&mut self) -> Result<bool, ClientError> {
        let trailers = self.outputs.trailers().await?;
        Ok(trailers.is_some_and(|t| has_closed_trailer(&t)))
    }
}
