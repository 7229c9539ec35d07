//! Frame types exchanged between the broker and its peers
//!
//! Clients talk to the frontend, workers talk to the backend. Every
//! connection starts with a `Welcome` from the broker carrying the identity
//! the transport assigned to the peer.

use serde::{Deserialize, Serialize};

/// Opaque request/reply body. The broker never inspects it.
pub type Payload = Vec<u8>;

/// Frames sent by a client to the broker frontend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// A request awaiting exactly one reply
    Request { payload: Payload },
}

/// Frames sent by the broker frontend to a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrontendFrame {
    /// Handshake: the connection is registered with the broker
    Welcome { identity: String },

    /// The reply correlated with the client's last request
    Reply { payload: Payload },
}

/// Frames sent by a worker to the broker backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerFrame {
    /// The worker is available for work
    Ready {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    /// The result of the request last handed to this worker
    Reply { payload: Payload },
}

/// Frames sent by the broker backend to a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendFrame {
    /// Handshake: the connection is registered with the broker
    Welcome { identity: String },

    /// A client request to process
    Request { payload: Payload },
}
