//! `RelayService` gRPC implementation.

use std::pin::Pin;
use std::sync::Arc;

use tonic::{Request, Response, Status, Streaming};
use tracing::instrument;

use tether_proto::v1::relay_service_server::RelayService as RelayRpc;
use tether_proto::v1::{Command, Lease, Output, Registration};

use crate::observer::{CallSite, RelayEvent};
use crate::registration::{RegistrationError, RegistrationService};
use crate::registry::InboundStream;
use crate::relay::RelayService;

type ResponseStream<T> = Pin<Box<dyn tokio_stream::Stream<Item = Result<T, Status>> + Send>>;

pub struct RelayServiceImpl {
    relay: Arc<RelayService>,
    registration: Arc<RegistrationService>,
}

impl RelayServiceImpl {
    pub const fn new(relay: Arc<RelayService>, registration: Arc<RegistrationService>) -> Self {
        Self {
            relay,
            registration,
        }
    }

    /// Report a unary outcome and convert it into a response.
    fn respond(
        &self,
        site: CallSite,
        result: Result<Lease, RegistrationError>,
    ) -> Result<Response<Lease>, Status> {
        let observer = self.relay.observer();
        match result {
            Ok(lease) => {
                observer.observe(&RelayEvent::ok(site));
                Ok(Response::new(lease))
            }
            Err(e) => {
                observer.observe(&RelayEvent::failed(site, &e));
                Err(e.into())
            }
        }
    }
}

fn inbound<T: Send + 'static>(request: Request<Streaming<T>>) -> InboundStream<T> {
    Box::pin(request.into_inner())
}

#[tonic::async_trait]
impl RelayRpc for RelayServiceImpl {
    type JoinClusterStream = ResponseStream<Command>;
    type StartSessionStream = ResponseStream<Output>;

    #[instrument(skip(self, request), fields(rpc = "Register"))]
    async fn register(
        &self,
        request: Request<Registration>,
    ) -> Result<Response<Lease>, Status> {
        let registration = request.into_inner();
        let result = self.registration.register(&registration).await;
        self.respond(CallSite::Register, result)
    }

    #[instrument(skip(self, request), fields(rpc = "CheckRegistration"))]
    async fn check_registration(
        &self,
        request: Request<Registration>,
    ) -> Result<Response<Lease>, Status> {
        let registration = request.into_inner();
        let result = self.registration.check_registration(&registration).await;
        self.respond(CallSite::CheckRegistration, result)
    }

    #[instrument(skip(self, request), fields(rpc = "Deregister"))]
    async fn deregister(
        &self,
        request: Request<Registration>,
    ) -> Result<Response<Lease>, Status> {
        let registration = request.into_inner();
        let result = self.registration.deregister(&registration).await;
        self.respond(CallSite::Deregister, result)
    }

    #[instrument(skip(self, request), fields(rpc = "JoinCluster"))]
    async fn join_cluster(
        &self,
        request: Request<Streaming<Output>>,
    ) -> Result<Response<Self::JoinClusterStream>, Status> {
        let commands = self.relay.join_cluster(inbound(request)).await?;
        Ok(Response::new(Box::pin(commands)))
    }

    #[instrument(skip(self, request), fields(rpc = "StartSession"))]
    async fn start_session(
        &self,
        request: Request<Streaming<Command>>,
    ) -> Result<Response<Self::StartSessionStream>, Status> {
        let outputs = self.relay.start_session(inbound(request)).await?;
        Ok(Response::new(Box::pin(outputs)))
    }
}
