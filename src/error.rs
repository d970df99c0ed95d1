//! Error taxonomy surfaced to callers.
//!
//! Every failure in the protocol engine reaches the original caller as an
//! `Err` from the awaited operation. The layers never retry; retry policy
//! belongs to the caller.
//!
//! ```text
//! ErrorKind::Connection        NotConnected, ConnectFailed, Write, Closed, Handshake, Io
//! ErrorKind::Protocol          Protocol
//! ErrorKind::Subscription      Subscription (ack success=false)
//! ErrorKind::RemoteInvocation  Remote (response action "error")
//! ErrorKind::Timeout           Timeout (correlation deadline expired)
//! ```

use std::time::Duration;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the connection, bus, and gateway layers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// An operation was attempted while the channel is not open.
    #[error("not connected")]
    NotConnected,

    /// The WebSocket could not be established.
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// Writing a frame to the channel failed.
    #[error("write failed: {0}")]
    Write(String),

    /// The channel closed while the operation was outstanding.
    #[error("connection closed: {0}")]
    Closed(String),

    /// The authorization handshake did not complete.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Local I/O failure (token file write, gateway page materialization).
    #[error("i/o error: {0}")]
    Io(String),

    /// Malformed frame or unexpected response shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The runtime rejected a bus operation (`ack` with `success=false`).
    #[error("{action} rejected: {reason}")]
    Subscription {
        /// Wire action that was rejected (e.g. `subscribe`).
        action: String,
        /// Reason string echoed by the runtime.
        reason: String,
    },

    /// The remote gateway answered with action `error`.
    #[error("remote error: {message}")]
    Remote {
        /// Error message echoed by the remote gateway.
        message: String,
    },

    /// No correlated response arrived before the deadline.
    #[error("{what} timed out after {after:?}")]
    Timeout {
        /// What was being waited for (e.g. `ack #12`).
        what: String,
        /// Deadline that expired.
        after: Duration,
    },
}

/// Coarse classification of [`Error`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Channel unavailable, closed, or failed to write.
    Connection,
    /// Malformed or unexpected protocol traffic.
    Protocol,
    /// Bus registration rejected by the runtime.
    Subscription,
    /// Remote method or listener call failed.
    RemoteInvocation,
    /// Correlation deadline expired.
    Timeout,
}

impl Error {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotConnected
            | Self::ConnectFailed(_)
            | Self::Write(_)
            | Self::Closed(_)
            | Self::Handshake(_)
            | Self::Io(_) => ErrorKind::Connection,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Subscription { .. } => ErrorKind::Subscription,
            Self::Remote { .. } => ErrorKind::RemoteInvocation,
            Self::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Build a rejection error from an ack payload.
    pub(crate) fn rejected(action: &str, ack: &serde_json::Value) -> Self {
        let reason = ack
            .get("reason")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("no reason given")
            .to_string();
        Self::Subscription {
            action: action.to_string(),
            reason,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}
