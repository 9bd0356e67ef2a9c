//! Session configuration.

use std::sync::Arc;

use mana_common::DiagnosticSink;

use crate::auth::Identity;
use crate::crypto::{CryptoProvider, EntropySource, OsEntropy, StackProvider};
use crate::hostkey::{HostKeyPolicy, TofuPolicy};
use crate::{cipher, kex};

#[derive(Debug, Clone)]
pub struct IdentificationConfig {
    /// Must begin with `SSH-` and fit in 255 characters including the
    /// trailing CR LF.
    pub client_id: String,
    pub banner: Option<String>,
}

impl Default for IdentificationConfig {
    fn default() -> Self {
        IdentificationConfig {
            client_id: format!("SSH-2.0-{}_{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            banner: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmPreferences {
    pub key_exchange: Vec<String>,
    pub ciphers: Vec<String>,
    pub macs: Vec<String>,
    pub host_keys: Vec<String>,
    pub compression: Vec<String>,
    pub extensions: Vec<String>,
}

impl Default for AlgorithmPreferences {
    fn default() -> Self {
        AlgorithmPreferences {
            key_exchange: vec![
                kex::CURVE25519_LIBSSH.to_owned(),
                kex::CURVE25519.to_owned(),
                kex::DH_GROUP14_SHA256.to_owned(),
            ],
            ciphers: vec![cipher::aes128gcm::NAME.to_owned()],
            macs: vec!["AEAD_AES_128_GCM".to_owned(), "hmac-sha2-256".to_owned()],
            host_keys: vec![
                "ssh-ed25519".to_owned(),
                "rsa-sha2-512".to_owned(),
                "rsa-sha2-256".to_owned(),
            ],
            compression: vec!["none".to_owned()],
            extensions: vec!["ext-info-c".to_owned()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelAllow {
    pub session: bool,
    pub exec: bool,
    pub subsystem: bool,
    pub agent_forward: bool,
    pub port_forward: bool,
}

impl Default for ChannelAllow {
    fn default() -> Self {
        ChannelAllow {
            session: true,
            exec: true,
            subsystem: true,
            agent_forward: false,
            port_forward: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelDefaults {
    pub max_concurrent: Option<u32>,
    /// The initial inbound window offered on channel open.
    pub initial_window_size: u32,
    pub max_packet_size: u32,
    pub allow: ChannelAllow,
}

impl Default for ChannelDefaults {
    fn default() -> Self {
        ChannelDefaults {
            max_concurrent: None,
            initial_window_size: 131072,
            max_packet_size: 32768,
            allow: ChannelAllow::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Guards {
    pub allow_sha1_signatures: bool,
    pub enable_dropbear_compat: bool,
    /// Hard cap on the inbound `packet_length` field.
    pub max_payload_bytes: u32,
    /// Suppress the automatic userauth exchange after NEWKEYS.
    pub disable_auto_userauth: bool,
}

impl Default for Guards {
    fn default() -> Self {
        Guards {
            allow_sha1_signatures: false,
            enable_dropbear_compat: false,
            max_payload_bytes: 256 * 1024,
            disable_auto_userauth: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub host: String,
    pub port: u16,
}

pub struct SessionConfig {
    pub identification: IdentificationConfig,
    pub algorithms: AlgorithmPreferences,
    pub channels: ChannelDefaults,
    pub guards: Guards,
    pub host_identity: Option<HostIdentity>,
    pub identity: Option<Identity>,
    pub crypto: Arc<dyn CryptoProvider>,
    pub entropy: Box<dyn EntropySource>,
    pub host_keys: Box<dyn HostKeyPolicy>,
    pub diagnostics: Option<DiagnosticSink>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            identification: IdentificationConfig::default(),
            algorithms: AlgorithmPreferences::default(),
            channels: ChannelDefaults::default(),
            guards: Guards::default(),
            host_identity: None,
            identity: None,
            crypto: Arc::new(StackProvider),
            entropy: Box::new(OsEntropy),
            host_keys: Box::new(TofuPolicy::in_memory()),
            diagnostics: None,
        }
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("identification", &self.identification)
            .field("algorithms", &self.algorithms)
            .field("channels", &self.channels)
            .field("guards", &self.guards)
            .field("host_identity", &self.host_identity)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}
