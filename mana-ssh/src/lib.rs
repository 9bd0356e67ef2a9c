//! Client-side SSHv2 protocol engine.
//!
//! The engine is a sans-IO reducer: the embedder feeds it raw transport
//! bytes through [`ClientSession::receive`], issues user intents through
//! [`ClientSession::command`], drains framed (and, once keys are active,
//! AEAD-sealed) outbound packets through [`ClientSession::flush_outbound`]
//! and observes protocol progress through [`SessionEvent`]s. No sockets,
//! no timers; the transport layer above decides how bytes move.
//!
//! Supported algorithm surface: `curve25519-sha256[@libssh.org]` and
//! `diffie-hellman-group14-sha256` key exchanges, `aes128-gcm@openssh.com`,
//! `ssh-ed25519` host keys and public-key user authentication.

#[macro_use]
extern crate tracing;

use std::fmt::{Display, Formatter};

pub mod auth;
pub mod cipher;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod hostkey;
pub mod kex;
pub mod msg;
pub mod negotiation;
mod session;

pub use config::{
    AlgorithmPreferences, ChannelAllow, ChannelDefaults, Guards, HostIdentity,
    IdentificationConfig, SessionConfig,
};
pub use session::channels::{ChannelRequest, ChannelSnapshot, ChannelStatus, Intent};
pub use session::events::{EncryptionPhase, SessionEvent, SessionEvents};
pub use session::{ClientSession, SessionPhase, SessionSnapshot};

/// Local identifier of a channel, allocated by this side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A reason for disconnection, per RFC 4253 §11.1.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    HostNotAllowedToConnect = 1,
    ProtocolError = 2,
    KeyExchangeFailed = 3,
    Reserved = 4,
    MacError = 5,
    CompressionError = 6,
    ServiceNotAvailable = 7,
    ProtocolVersionNotSupported = 8,
    HostKeyNotVerifiable = 9,
    ConnectionLost = 10,
    ByApplication = 11,
    TooManyConnections = 12,
    AuthCancelledByUser = 13,
    NoMoreAuthMethodsAvailable = 14,
    IllegalUserName = 15,
}

#[derive(Debug, thiserror::Error)]
pub enum SshError {
    /// Malformed wire bytes. Fatal to the session.
    #[error("malformed wire data: {0}")]
    Decode(&'static str),

    /// Peer violated the protocol. Fatal to the session.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Implementation bug or API misuse.
    #[error("invariant violation: {0}")]
    Invariant(&'static str),

    /// The requested operation is not supported by this engine. Returned
    /// to the caller without closing the session.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// No algorithm of the given category was acceptable to both sides.
    #[error("no common {0} algorithm")]
    NoCommonAlgorithm(&'static str),

    /// The server's signature over the exchange hash did not verify.
    #[error("wrong server signature")]
    WrongServerSignature,

    /// AEAD open failed on an inbound packet.
    #[error("failed to decrypt a packet")]
    Decryption,

    /// A monotonically increasing counter ran out of room.
    #[error("counter exhausted: {0}")]
    Exhausted(&'static str),

    /// The host key policy rejected the server's key.
    #[error("host key rejected for {0}")]
    HostKeyRejected(String),

    /// Channel commands require a completed user authentication.
    #[error("not yet authenticated")]
    NotAuthenticated,

    /// Message addressed to a channel that is not open.
    #[error("channel not open")]
    ChannelNotOpen,
}

impl SshError {
    /// Whether this error must tear the whole session down when it
    /// surfaces from packet processing.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SshError::NotImplemented(_)
                | SshError::NotAuthenticated
                | SshError::ChannelNotOpen
        )
    }
}
