// ABOUTME: Error types for the buildwire-core crate.
// ABOUTME: Failures are scoped to the caller or thread that owns them; none are fatal to the engine.

use buildwire_proto::{DecodeError, EncodeError};
use thiserror::Error;

use crate::state::StaleTransition;

/// Errors surfaced by the protocol engine.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Inbound payload rejected by the codec.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Outbound envelope could not be serialized.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// A status change was refused by the thread state machine.
    #[error(transparent)]
    StaleTransition(#[from] StaleTransition),

    /// Every send attempt for a message failed.
    #[error("delivery of message '{message_id}' exhausted after {attempts} attempts: {last_error}")]
    DeliveryExhausted {
        message_id: String,
        attempts: u32,
        last_error: String,
    },

    /// The connection dropped while the send was in flight.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// No connection is currently established.
    #[error("not connected")]
    NotConnected,

    /// Transport-level failure not covered by the variants above.
    #[error("transport error: {0}")]
    Transport(String),

    /// A message id was already seen on this thread.
    #[error("duplicate message '{message_id}' on thread '{thread_id}'")]
    DuplicateMessage {
        thread_id: String,
        message_id: String,
    },

    /// The thread reached a terminal status and was archived.
    #[error("thread '{0}' is archived")]
    ThreadArchived(String),

    /// Heartbeats belong to the connection and never enter a thread.
    #[error("heartbeat is a connection-level message")]
    HeartbeatNotThreaded,

    /// No active thread with this id.
    #[error("thread not found: {0}")]
    ThreadNotFound(String),

    /// A message handler failed.
    #[error("handler failed: {0}")]
    Handler(String),
}

impl From<anyhow::Error> for ProtocolError {
    fn from(err: anyhow::Error) -> Self {
        ProtocolError::Handler(format!("{err:#}"))
    }
}
