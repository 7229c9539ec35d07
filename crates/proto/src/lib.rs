//! relayq wire protocol
//!
//! Frame definitions for the frontend (client) and backend (worker) sides of
//! the broker, and the length-prefixed codec that carries them.

pub mod codec;
pub mod frames;

pub use codec::{read_frame, write_frame, ProtocolError, MAX_FRAME_SIZE};
pub use frames::{BackendFrame, ClientFrame, FrontendFrame, Payload, WorkerFrame};
