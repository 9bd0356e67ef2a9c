//! The `mana.v1` framed transport: a 14-byte binary envelope over a
//! WebSocket (or any byte-stream binding) carrying the SSH byte stream as
//! data frames and CBOR control messages for handshake, heartbeats,
//! resume tickets and credit-based flow control.

#[macro_use]
extern crate tracing;

pub mod binding;
pub mod conduit;
pub mod control;
pub mod flow;
pub mod frame;
pub mod framer;
pub mod resume;
pub mod state;
pub mod websocket;

/// Subprotocol identifier, negotiated on the WebSocket upgrade and
/// repeated inside HELLO.
pub const SUBPROTOCOL: &str = "mana.v1";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Peer violated the framing rules. Fatal to the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer speaks a different framed codec.
    #[error("codec mismatch: peer offered {0:?}")]
    CodecMismatch(String),

    /// No HELLO arrived within the handshake deadline.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Malformed CBOR control payload.
    #[error("malformed control payload: {0}")]
    Control(String),

    /// The connection is closed.
    #[error("transport closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Ssh(#[from] mana_ssh::SshError),
}
