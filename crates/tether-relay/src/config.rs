//! Relay runtime configuration.

use std::time::Duration;

/// What a session does when one step of the relay loop fails.
///
/// End-of-stream on either side always ends the session, whatever the
/// policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// End the session with the failing status on the first failure.
    #[default]
    Abort,
    /// Observe the failure and keep relaying. The session ends after
    /// `max_consecutive` failures in a row.
    Tolerate { max_consecutive: u32 },
}

impl FailurePolicy {
    /// Whether a session should stop after `consecutive` failures in a row.
    pub const fn gives_up_after(self, consecutive: u32) -> bool {
        match self {
            Self::Abort => consecutive >= 1,
            Self::Tolerate { max_consecutive } => consecutive >= max_consecutive,
        }
    }
}

/// Settings shared by every relay handler.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upper bound on each lease check, and on every registration call.
    pub validation_timeout: Duration,
    /// Failure handling inside session relay loops.
    pub failure_policy: FailurePolicy,
    /// Buffer size of the outbound stream channels.
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            validation_timeout: Duration::from_secs(5),
            failure_policy: FailurePolicy::default(),
            channel_capacity: 32,
        }
    }
}
