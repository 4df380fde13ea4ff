//! gRPC server implementations for the tether relay.

pub mod grpc_util;
pub mod relay_svc;

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
pub(crate) mod test_helpers;


pub use relay_svc::RelayServiceImpl;
