//! Common error types for relayq
//!
//! This module defines the error type shared by the broker and its peers.
//! None of these errors is ever sent to a client: the broker recovers locally
//! and the only client-visible symptom of a failure is a missing reply.

use relayq_proto::ProtocolError;
use thiserror::Error;

/// Main error type for relayq
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection errors (bind, accept, connect, handshake)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Wire protocol errors; fatal to the affected peer only
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A worker replied without holding an assignment
    #[error("Unknown worker reply from {worker}")]
    UnknownWorkerReply { worker: String },

    /// An internal channel was closed while still in use
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for RelayError {
    fn from(err: config::ConfigError) -> Self {
        RelayError::Config(err.to_string())
    }
}

impl RelayError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        RelayError::Config(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        RelayError::Connection(msg.into())
    }

    /// Create an unknown worker reply error
    pub fn unknown_worker_reply(worker: impl ToString) -> Self {
        RelayError::UnknownWorkerReply {
            worker: worker.to_string(),
        }
    }

    /// Create a channel closed error
    pub fn channel_closed(msg: impl Into<String>) -> Self {
        RelayError::ChannelClosed(msg.into())
    }

    /// Whether the error only affects the peer connection it came from
    pub fn is_peer_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::Protocol(_) | RelayError::Io(_) | RelayError::Connection(_)
        )
    }
}

/// Result type alias for relayq operations
pub type Result<T> = std::result::Result<T, RelayError>;
