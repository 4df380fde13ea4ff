//! Shared gRPC utility helpers.

use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::{Code, Status};

use crate::registration::RegistrationError;
use crate::registry::RegistryError;
use crate::relay::RelayError;

/// Trailer key attached when the relay closes a stream on shutdown.
pub const CLOSED_TRAILER: &str = "closed";

/// Terminal stream item that ends a response successfully with a
/// `closed: true` trailer.
///
/// tonic turns an `Err` item into the response trailers, so an `Ok` code here
/// finishes the stream without signalling a failure.
pub fn closed_status() -> Status {
    let mut metadata = MetadataMap::new();
    metadata.insert(CLOSED_TRAILER, MetadataValue::from_static("true"));
    Status::with_metadata(Code::Ok, "stream closed", metadata)
}

/// Whether a trailer map carries the `closed: true` marker.
pub fn has_closed_trailer(metadata: &MetadataMap) -> bool {
    metadata
        .get(CLOSED_TRAILER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "true")
}

/// Check if a gRPC Status represents a normal peer disconnect
/// (client exit, worker shutdown, TLS close without notify, etc.).
///
/// The status code is checked first: `Unavailable` and `Cancelled` are the
/// codes tonic surfaces when the transport drops. Otherwise we fall back to
/// substring matching on the message text.
///
/// NOTE: The substring checks below are **fragile** -- the exact wording
/// is an implementation detail of hyper / h2 / rustls and may change
/// across library versions.
pub fn is_peer_disconnect(status: &Status) -> bool {
    match status.code() {
        Code::Unavailable | Code::Cancelled => return true,
        _ => {}
    }

    let msg = status.message();
    msg.contains("h2 protocol error")
        || msg.contains("broken pipe")
        || msg.contains("connection reset")
        || msg.contains("close_notify")
}

impl From<RegistrationError> for Status {
    fn from(err: RegistrationError) -> Self {
        let message = err.sanitized();
        match err {
            RegistrationError::Validation(_) => Self::invalid_argument(message),
            RegistrationError::Repository(_) => Self::unavailable(message),
            RegistrationError::NoLease => Self::not_found(message),
            RegistrationError::DeadlineExceeded(_) => Self::deadline_exceeded(message),
        }
    }
}

impl From<RegistryError> for Status {
    fn from(err: RegistryError) -> Self {
        let message = err.to_string();
        match err {
            RegistryError::AlreadyConnected(_) => Self::already_exists(message),
            RegistryError::NotConnected(_) => Self::not_found(message),
            RegistryError::Busy(_) => Self::resource_exhausted(message),
        }
    }
}

impl From<RelayError> for Status {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Registration(e) => e.into(),
            RelayError::Registry(e) => e.into(),
            RelayError::MissingHandshake => Self::invalid_argument(err.to_string()),
            RelayError::Stream(status) => *status,
            RelayError::Cancelled => Self::cancelled(err.to_string()),
        }
    }
}
