//! Engine error taxonomy.
//!
//! Connection errors are retried automatically up to the reconnect
//! cap, then surfaced as terminal. Send and parse errors degrade to
//! "that one operation did not sync" and never tear the session down.

use crate::protocol::ProtocolError;
use crate::transport::TransportError;

#[derive(Debug, Clone)]
pub enum SyncError {
    /// Handshake or transport failure while establishing a session.
    Connection(String),
    /// The transport rejected an outbound send while nominally
    /// connected. The payload is not requeued.
    Send(String),
    /// A malformed inbound message was discarded.
    Parse(String),
    /// The session is closed and the operation cannot proceed.
    Closed,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "Connection error: {e}"),
            Self::Send(e) => write!(f, "Send error: {e}"),
            Self::Parse(e) => write!(f, "Parse error: {e}"),
            Self::Closed => write!(f, "Session closed"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Deserialization(m) | ProtocolError::InvalidChannel(m) => {
                SyncError::Parse(m)
            }
            ProtocolError::Serialization(m) => SyncError::Send(m),
        }
    }
}

impl From<TransportError> for SyncError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Handshake(m) => SyncError::Connection(m),
            TransportError::Closed => SyncError::Closed,
        }
    }
}
