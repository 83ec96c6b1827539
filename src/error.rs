//! Error types for the session core.
//!
//! `SessionError` is the caller-facing taxonomy: connection arbitration
//! failures, transport-level failures that bubbled up, and the terminal
//! conditions the reconnect policy can settle into. Queue overflow is a
//! capacity policy, not a failure, so it is surfaced as an event instead.

use thiserror::Error;

use crate::config::ConfigError;

/// Main error type for session operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A connect attempt is already in flight; concurrent calls are
    /// rejected rather than queued.
    #[error("a connect attempt is already in progress")]
    AlreadyConnecting,

    /// The session already holds a live connection.
    #[error("session is already connected")]
    AlreadyConnected,

    /// The broker rejected the connection, or the network did.
    #[error("connect failed: {0}")]
    ConnectFailure(String),

    /// A connect attempt produced no success/failure outcome within the
    /// configured window.
    #[error("connect attempt timed out")]
    Timeout,

    /// The broker dropped an established connection.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A subscribe request was refused while connected.
    #[error("subscribe to '{filter}' failed: {reason}")]
    SubscribeFailure { filter: String, reason: String },

    /// A publish hand-off to the transport failed.
    #[error("publish to '{topic}' failed: {reason}")]
    PublishFailure { topic: String, reason: String },

    /// The session worker has shut down; no further intents are accepted.
    #[error("session is closed")]
    SessionClosed,
}

/// Result alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

impl From<ConfigError> for SessionError {
    fn from(err: ConfigError) -> Self {
        SessionError::ConnectFailure(err.to_string())
    }
}
