//! Peer Wire Protocol engine: handshakes, message framing, per-connection state,
//! piece selection and the choking controller.
use thiserror::Error;

pub mod bitfield;
pub mod connection;
pub mod engine;
pub mod handshake;
pub mod message;
pub mod picker;
pub mod rate;

pub use bitfield::Bitfield;
pub use connection::PeerState;
pub use engine::{Engine, EngineConfig};
pub use message::Message;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake failed: Invalid protocol identifier")]
    HandshakeInvalidProtocol,

    #[error("Handshake failed: Info hash mismatch")]
    HandshakeInfoHashMismatch,

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("No message within the keep-alive window")]
    KeepAliveTimeout,
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;
