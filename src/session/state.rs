//! Connection lifecycle states and pure transition helpers.

use crate::config::ReconnectConfig;
use std::time::Duration;

/// Lifecycle state of the session.
///
/// Exactly one session exists per [`Session`](super::Session) value, and
/// exactly one connection attempt is in flight at any time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No connection and no attempt in progress.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// Connected and ready for traffic.
    Connected,
    /// Waiting out the backoff before reconnection attempt `n`.
    Reconnecting(u32),
    /// Terminal failure; a fresh `connect` call restarts the cycle.
    Failed(String),
}

impl SessionState {
    /// Whether a `connect` call is accepted in this state.
    pub fn accepts_connect(&self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Failed(_))
    }

    /// Whether an attempt (initial or reconnect) is currently in flight.
    pub fn attempt_in_flight(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Reconnecting(_)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Reconnecting(attempt) => write!(f, "reconnecting (attempt {attempt})"),
            SessionState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Decision for the next step of the reconnect cycle.
#[derive(Debug, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Wait `delay`, then start attempt `attempt`.
    Proceed { attempt: u32, delay: Duration },
    /// The policy is exhausted; settle into `Failed`.
    GiveUp,
}

/// Decide whether reconnection attempt `attempt` (1-based) may proceed.
pub fn next_reconnect_step(attempt: u32, config: &ReconnectConfig) -> ReconnectDecision {
    if !config.allows_attempt(attempt) {
        return ReconnectDecision::GiveUp;
    }
    ReconnectDecision::Proceed {
        attempt,
        delay: config.delay_for_attempt(attempt),
    }
}
