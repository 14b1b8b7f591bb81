//! Peer wire protocol: handshake, message framing, and per-peer sessions.
use std::net::SocketAddr;
use thiserror::Error;

pub mod handshake;
pub mod message;
pub mod session;

pub use handshake::Handshake;
pub use message::Message;
pub use session::{PeerEvent, PeerHandle, PeerState};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Failed to connect to peer {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Connect to peer {0} timed out")]
    ConnectTimeout(SocketAddr),

    #[error("Handshake failed: Invalid protocol identifier")]
    HandshakeInvalidProtocol,

    #[error("Handshake failed: Info hash mismatch")]
    HandshakeInfoHashMismatch,

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;
