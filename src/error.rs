//! Relay error taxonomy
//!
//! Every failure maps onto one [`ErrorClass`]. Nothing here is fatal to the
//! host process: transient errors feed the backoff logic, protocol errors
//! drop the offending item, upstream errors wait for the next cycle.

use crate::types::PeerEndpoint;

/// How a failure is handled by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connect/send failures; retried through backoff
    Transient,
    /// Malformed message or entry; discarded
    Protocol,
    /// Local node RPC unavailable; retried on the next scheduled cycle
    Upstream,
    /// Protected connection missing; self-healed
    Invariant,
    /// Local I/O, shutdown and the like
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("connection to {0} timed out")]
    ConnectTimeout(PeerEndpoint),

    #[error("connection to {0} refused")]
    ConnectRefused(PeerEndpoint),

    #[error("send to {0} timed out")]
    SendTimeout(PeerEndpoint),

    #[error("link to {0} is closed")]
    LinkClosed(PeerEndpoint),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid peer address: {0}")]
    InvalidAddress(String),

    #[error("local node unavailable: {0}")]
    Upstream(String),

    #[error("block rejected by {endpoint}: {reason}")]
    Rejected { endpoint: String, reason: String },

    #[error("protected connection to {0} is missing")]
    ProtectedMissing(PeerEndpoint),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("relay for chain {0} has shut down")]
    Shutdown(String),
}

impl RelayError {
    /// Classify a failed dial, keeping refusals apart from other I/O errors
    pub fn from_connect(endpoint: &PeerEndpoint, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => RelayError::ConnectRefused(endpoint.clone()),
            std::io::ErrorKind::TimedOut => RelayError::ConnectTimeout(endpoint.clone()),
            _ => RelayError::Transport(err),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            RelayError::ConnectTimeout(_)
            | RelayError::ConnectRefused(_)
            | RelayError::SendTimeout(_)
            | RelayError::LinkClosed(_)
            | RelayError::Transport(_) => ErrorClass::Transient,
            RelayError::Protocol(_) | RelayError::InvalidAddress(_) => ErrorClass::Protocol,
            RelayError::Upstream(_) | RelayError::Rejected { .. } => ErrorClass::Upstream,
            RelayError::ProtectedMissing(_) => ErrorClass::Invariant,
            RelayError::Snapshot(_) | RelayError::Shutdown(_) => ErrorClass::Internal,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RelayError::ConnectTimeout(_) | RelayError::SendTimeout(_))
    }

    pub fn is_refused(&self) -> bool {
        matches!(self, RelayError::ConnectRefused(_))
    }
}

impl From<bincode::Error> for RelayError {
    fn from(err: bincode::Error) -> Self {
        RelayError::Protocol(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Snapshot(err.to_string())
    }
}
