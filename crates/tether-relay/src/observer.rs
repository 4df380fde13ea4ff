//! Observation hooks for relay activity.
//!
//! Every notable event is reported as a typed [`RelayEvent`]. Observers never
//! influence control flow.

use std::error::Error;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use tracing::{debug, info, trace, warn};

/// Where in the relay an event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallSite {
    Register,
    CheckRegistration,
    Deregister,
    JoinClusterRecv,
    JoinClusterValidate,
    JoinClusterAdd,
    StartSessionInitRecv,
    StartSessionValidate,
    StartSessionLookup,
    StartSessionRecv,
    StartSessionCmdSend,
    StartSessionOutputRecv,
    StartSessionOutputSend,
}

impl CallSite {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::CheckRegistration => "check_registration",
            Self::Deregister => "deregister",
            Self::JoinClusterRecv => "join_cluster_recv",
            Self::JoinClusterValidate => "join_cluster_validate",
            Self::JoinClusterAdd => "join_cluster_add",
            Self::StartSessionInitRecv => "start_session_init_recv",
            Self::StartSessionValidate => "start_session_validate",
            Self::StartSessionLookup => "start_session_lookup",
            Self::StartSessionRecv => "start_session_recv",
            Self::StartSessionCmdSend => "start_session_cmd_send",
            Self::StartSessionOutputRecv => "start_session_output_recv",
            Self::StartSessionOutputSend => "start_session_output_send",
        }
    }
}

impl std::fmt::Display for CallSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single observable event.
#[derive(Debug, Clone, Copy)]
pub enum RelayEvent<'a> {
    /// A call or stream step finished, successfully or not.
    Call {
        site: CallSite,
        error: Option<&'a (dyn Error + Send + Sync + 'static)>,
    },
    /// A member joined the connection registry.
    ConnectionAdded { identifier: &'a str },
    /// A member left the connection registry.
    ConnectionRemoved { identifier: &'a str },
    /// Payload bytes moved through a stream step.
    Throughput { site: CallSite, bytes: usize },
}

impl<'a> RelayEvent<'a> {
    pub const fn ok(site: CallSite) -> Self {
        Self::Call { site, error: None }
    }

    pub fn failed(site: CallSite, error: &'a (dyn Error + Send + Sync + 'static)) -> Self {
        Self::Call {
            site,
            error: Some(error),
        }
    }
}

/// Sink for relay events.
pub trait RelayObserver: Send + Sync {
    fn observe(&self, event: &RelayEvent<'_>);
}

/// Point-in-time copy of the [`TracingObserver`] counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ObserverSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub active_members: i64,
    pub throughput_bytes: u64,
}

/// Logs every event through `tracing` and keeps running totals.
///
/// With the `metrics` feature the totals are mirrored into `OpenTelemetry`
/// instruments labelled by call site.
#[derive(Default)]
pub struct TracingObserver {
    requests: AtomicU64,
    errors: AtomicU64,
    active_members: AtomicI64,
    throughput_bytes: AtomicU64,
    #[cfg(feature = "metrics")]
    instruments: Option<otel::Instruments>,
}

impl TracingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also export counters through the global `OpenTelemetry` meter.
    #[cfg(feature = "metrics")]
    pub fn with_otel(mut self) -> Self {
        self.instruments = Some(otel::Instruments::new());
        self
    }

    pub fn snapshot(&self) -> ObserverSnapshot {
        ObserverSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            active_members: self.active_members.load(Ordering::Relaxed),
            throughput_bytes: self.throughput_bytes.load(Ordering::Relaxed),
        }
    }
}

impl RelayObserver for TracingObserver {
    fn observe(&self, event: &RelayEvent<'_>) {
        match *event {
            RelayEvent::Call { site, error } => {
                self.requests.fetch_add(1, Ordering::Relaxed);
                if let Some(err) = error {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(call = %site, error = %err, "Relay call failed");
                } else {
                    debug!(call = %site, "Relay call completed");
                }
            }
            RelayEvent::ConnectionAdded { identifier } => {
                self.active_members.fetch_add(1, Ordering::Relaxed);
                info!(identifier = %identifier, "Member added");
            }
            RelayEvent::ConnectionRemoved { identifier } => {
                self.active_members.fetch_sub(1, Ordering::Relaxed);
                info!(identifier = %identifier, "Member removed");
            }
            RelayEvent::Throughput { site, bytes } => {
                self.throughput_bytes
                    .fetch_add(bytes as u64, Ordering::Relaxed);
                trace!(call = %site, bytes, "Relayed payload");
            }
        }

        #[cfg(feature = "metrics")]
        if let Some(instruments) = &self.instruments {
            instruments.record(event);
        }
    }
}

#[cfg(feature = "metrics")]
mod otel {
    use opentelemetry::KeyValue;
    use opentelemetry::metrics::{Counter, UpDownCounter};

    use super::RelayEvent;

    pub(super) struct Instruments {
        requests: Counter<u64>,
        errors: Counter<u64>,
        active_members: UpDownCounter<i64>,
        throughput: Counter<u64>,
    }

    impl Instruments {
        pub(super) fn new() -> Self {
            let meter = opentelemetry::global::meter("tether-relay");
            Self {
                requests: meter
                    .u64_counter("relay_requests")
                    .with_description("Relay calls by call site")
                    .build(),
                errors: meter
                    .u64_counter("relay_errors")
                    .with_description("Failed relay calls by call site")
                    .build(),
                active_members: meter
                    .i64_up_down_counter("relay_active_members")
                    .with_description("Members currently holding a relay stream")
                    .build(),
                throughput: meter
                    .u64_counter("relay_throughput_bytes")
                    .with_description("Payload bytes relayed by call site")
                    .with_unit("By")
                    .build(),
            }
        }

        pub(super) fn record(&self, event: &RelayEvent<'_>) {
            match *event {
                RelayEvent::Call { site, error } => {
                    let attrs = [KeyValue::new("caller", site.as_str())];
                    self.requests.add(1, &attrs);
                    if error.is_some() {
                        self.errors.add(1, &attrs);
                    }
                }
                RelayEvent::ConnectionAdded { .. } => self.active_members.add(1, &[]),
                RelayEvent::ConnectionRemoved { .. } => self.active_members.add(-1, &[]),
                RelayEvent::Throughput { site, bytes } => {
                    self.throughput
                        .add(bytes as u64, &[KeyValue::new("caller", site.as_str())]);
                }
            }
        }
    }
}
