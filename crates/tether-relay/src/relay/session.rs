//! Serialized command/output relay between one session and one member.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, warn};

use tether_proto::v1::{Command, Output};

use crate::config::FailurePolicy;
use crate::observer::{CallSite, RelayEvent, RelayObserver};
use crate::registry::{InboundStream, MemberSession};
use crate::server::grpc_util::{closed_status, is_peer_disconnect};

/// Outcome of one command/output exchange.
#[derive(Debug)]
enum Exchange {
    /// The output was delivered to the session.
    Completed,
    /// A step failed; the failure has already been observed.
    Failed(Status),
    /// The session caller hung up or closed its side.
    SessionEnded,
    /// The session caller hung up while the member owed it an output.
    Abandoned,
    /// The member stream is gone.
    MemberGone(Status),
    /// The relay is shutting down.
    Cancelled,
}

/// Why a relay loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    /// Relay shutdown; the session got a `closed` trailer.
    Closed,
    /// The session caller went away.
    CallerGone,
    /// The session caller went away mid-command; the member was retired.
    Abandoned,
    /// The member went away; the session got an error status.
    MemberGone,
    /// The failure policy gave up; the session got the last error status.
    Aborted,
}

// `member` drops before `outbound`, so the member is free again by the time
// the caller sees its stream end.
pub(crate) struct SessionRelay {
    inbound: InboundStream<Command>,
    member: MemberSession,
    outbound: mpsc::Sender<Result<Output, Status>>,
    observer: Arc<dyn RelayObserver>,
    policy: FailurePolicy,
    shutdown: CancellationToken,
}

impl SessionRelay {
    pub(crate) fn new(
        inbound: InboundStream<Command>,
        outbound: mpsc::Sender<Result<Output, Status>>,
        member: MemberSession,
        observer: Arc<dyn RelayObserver>,
        policy: FailurePolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inbound,
            member,
            outbound,
            observer,
            policy,
            shutdown,
        }
    }

    /// Relay until shutdown, hang-up, or the failure policy gives up.
    ///
    /// Command N+1 is only read from the session after output N has been
    /// handed back to it.
    pub(crate) async fn run(mut self) -> SessionEnd {
        let identifier = self.member.identifier().to_string();
        let mut consecutive_failures = 0u32;

        let end = loop {
            match self.exchange().await {
                Exchange::Completed => consecutive_failures = 0,
                Exchange::Failed(status) => {
                    consecutive_failures += 1;
                    if self.policy.gives_up_after(consecutive_failures) {
                        warn!(
                            identifier = %identifier,
                            consecutive_failures,
                            error = %status,
                            "Giving up on session"
                        );
                        let _ = self.outbound.send(Err(status)).await;
                        break SessionEnd::Aborted;
                    }
                }
                Exchange::SessionEnded => break SessionEnd::CallerGone,
                Exchange::Abandoned => {
                    self.member.retire();
                    break SessionEnd::Abandoned;
                }
                Exchange::MemberGone(status) => {
                    let _ = self.outbound.send(Err(status)).await;
                    break SessionEnd::MemberGone;
                }
                Exchange::Cancelled => {
                    let _ = self.outbound.try_send(Err(closed_status()));
                    break SessionEnd::Closed;
                }
            }
        };

        info!(identifier = %identifier, end = ?end, "Session ended");
        end
    }

    async fn exchange(&mut self) -> Exchange {
        // 1. Command from the session.
        let next = tokio::select! {
            () = self.shutdown.cancelled() => return Exchange::Cancelled,
            next = self.inbound.next() => next,
        };
        let command = match next {
            Some(Ok(command)) => command,
            Some(Err(status)) => {
                self.observe_failure(CallSite::StartSessionRecv, &status);
                if is_peer_disconnect(&status) {
                    return Exchange::SessionEnded;
                }
                return Exchange::Failed(status);
            }
            None => {
                debug!(identifier = %self.member.identifier(), "Session closed its stream");
                return Exchange::SessionEnded;
            }
        };
        self.observe_bytes(CallSite::StartSessionRecv, command.contents.len());

        // 2. Command to the member. Nothing is delivered if the caller
        // leaves first.
        let sent = tokio::select! {
            () = self.shutdown.cancelled() => return Exchange::Cancelled,
            () = self.outbound.closed() => {
                self.observe_failure(CallSite::StartSessionCmdSend, &caller_gone());
                return Exchange::SessionEnded;
            }
            sent = self.member.send(command) => sent,
        };
        if let Err(status) = sent {
            self.observe_failure(CallSite::StartSessionCmdSend, &status);
            return Exchange::MemberGone(status);
        }

        // 3. Output from the member.
        let reply = tokio::select! {
            () = self.shutdown.cancelled() => return Exchange::Cancelled,
            () = self.outbound.closed() => {
                self.observe_failure(CallSite::StartSessionOutputRecv, &caller_gone());
                return Exchange::Abandoned;
            }
            reply = self.member.recv() => reply,
        };
        let output = match reply {
            Some(Ok(output)) => output,
            Some(Err(status)) => {
                self.observe_failure(CallSite::StartSessionOutputRecv, &status);
                if is_peer_disconnect(&status) {
                    return Exchange::MemberGone(status);
                }
                return Exchange::Failed(status);
            }
            None => {
                let status = Status::unavailable(format!(
                    "client with ID {} closed its stream",
                    self.member.identifier()
                ));
                self.observe_failure(CallSite::StartSessionOutputRecv, &status);
                return Exchange::MemberGone(status);
            }
        };
        self.observe_bytes(CallSite::StartSessionOutputRecv, output.contents.len());

        // 4. Output back to the session.
        let delivered = tokio::select! {
            () = self.shutdown.cancelled() => return Exchange::Cancelled,
            delivered = self.outbound.send(Ok(output)) => delivered,
        };
        if delivered.is_err() {
            self.observe_failure(CallSite::StartSessionOutputSend, &caller_gone());
            return Exchange::SessionEnded;
        }

        Exchange::Completed
    }

    fn observe_failure(&self, site: CallSite, status: &Status) {
        self.observer.observe(&RelayEvent::failed(site, status));
    }

    fn observe_bytes(&self, site: CallSite, bytes: usize) {
        self.observer
            .observe(&RelayEvent::Throughput { site, bytes });
    }
}

fn caller_gone() -> Status {
    Status::cancelled("session caller went away")
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use tokio::task::JoinHandle;
    use tokio::time::timeout;
    use tonic::Code;

    use super::*;
    use crate::registry::MemberConnection;
    use crate::server::grpc_util::has_closed_trailer;
    use crate::server::test_helpers::{RecordingObserver, inbound_stream};

    const WAIT: Duration = Duration::from_secs(2);

    /// Both ends of a relay loop between one caller and one member.
    struct Ends {
        session_tx: mpsc::Sender<Result<Command, Status>>,
        outputs: mpsc::Receiver<Result<Output, Status>>,
        member_rx: mpsc::Receiver<Result<Command, Status>>,
        member_tx: mpsc::Sender<Result<Output, Status>>,
        retired: CancellationToken,
        shutdown: CancellationToken,
        observer: Arc<RecordingObserver>,
    }

    fn spawn_relay(policy: FailurePolicy) -> (JoinHandle<SessionEnd>, Ends) {
        let (session_tx, inbound) = inbound_stream();
        let (member_tx, member_outputs) = inbound_stream();
        let (command_tx, member_rx) = mpsc::channel(16);
        let (output_tx, outputs) = mpsc::channel(16);

        let connection = MemberConnection::new("w1".into(), command_tx, member_outputs);
        let retired = connection.retired();
        let member = connection.claim().unwrap();

        let observer = Arc::new(RecordingObserver::default());
        let shutdown = CancellationToken::new();
        let relay = SessionRelay::new(
            inbound,
            output_tx,
            member,
            Arc::clone(&observer) as Arc<dyn RelayObserver>,
            policy,
            shutdown.clone(),
        );

        let ends = Ends {
            session_tx,
            outputs,
            member_rx,
            member_tx,
            retired,
            shutdown,
            observer,
        };
        (tokio::spawn(relay.run()), ends)
    }

    fn command(contents: &[u8]) -> Result<Command, Status> {
        Ok(Command {
            contents: contents.to_vec(),
            ..Default::default()
        })
    }

    async fn finish(handle: JoinHandle<SessionEnd>) -> SessionEnd {
        timeout(WAIT, handle).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn completed_exchange_keeps_relaying() {
        let (handle, mut ends) = spawn_relay(FailurePolicy::Abort);

        ends.session_tx.send(command(b"uptime")).await.unwrap();
        let delivered = ends.member_rx.recv().await.unwrap().unwrap();
        assert_eq!(delivered.contents, b"uptime");
        ends.member_tx
            .send(Ok(Output {
                contents: b"up 3 days".to_vec(),
                ..Default::default()
            }))
            .await
            .unwrap();

        let output = ends.outputs.recv().await.unwrap().unwrap();
        assert_eq!(output.contents, b"up 3 days");
        assert!(!handle.is_finished());

        drop(ends.session_tx);
        assert_eq!(finish(handle).await, SessionEnd::CallerGone);
    }

    #[tokio::test]
    async fn shutdown_ends_with_closed_trailer() {
        let (handle, mut ends) = spawn_relay(FailurePolicy::Abort);

        ends.shutdown.cancel();

        assert_eq!(finish(handle).await, SessionEnd::Closed);
        let status = ends.outputs.recv().await.unwrap().unwrap_err();
        assert!(has_closed_trailer(status.metadata()));
        assert!(ends.outputs.recv().await.is_none());
    }

    #[tokio::test]
    async fn member_stream_end_is_reported_to_caller() {
        let (handle, mut ends) = spawn_relay(FailurePolicy::Abort);

        drop(ends.member_tx);
        ends.session_tx.send(command(b"ls")).await.unwrap();

        assert_eq!(finish(handle).await, SessionEnd::MemberGone);
        let status = ends.outputs.recv().await.unwrap().unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
        assert!(!ends.retired.is_cancelled());
    }

    #[tokio::test]
    async fn abort_policy_gives_up_on_first_failure() {
        let (handle, mut ends) = spawn_relay(FailurePolicy::Abort);

        ends.session_tx
            .send(Err(Status::internal("bad frame")))
            .await
            .unwrap();

        assert_eq!(finish(handle).await, SessionEnd::Aborted);
        let status = ends.outputs.recv().await.unwrap().unwrap_err();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(ends.observer.failures(CallSite::StartSessionRecv), 1);
    }

    #[tokio::test]
    async fn caller_leaving_mid_command_retires_member() {
        let (handle, mut ends) = spawn_relay(FailurePolicy::Abort);

        ends.session_tx.send(command(b"sleep 600")).await.unwrap();
        assert!(ends.member_rx.recv().await.is_some());
        drop(ends.outputs);

        assert_eq!(finish(handle).await, SessionEnd::Abandoned);
        assert!(ends.retired.is_cancelled());
        assert_eq!(ends.observer.failures(CallSite::StartSessionOutputRecv), 1);
    }
}
