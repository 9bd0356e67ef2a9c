//! Client-side key exchange: curve25519-sha256 (RFC 8731 and its
//! libssh.org predecessor) and diffie-hellman-group14-sha256.

pub mod group14;

use num_bigint::BigUint;

use crate::codec::Encoding;
use crate::crypto::{CryptoProvider, EntropySource, X25519_LEN};
use crate::{msg, SshError};

pub const CURVE25519_LIBSSH: &str = "curve25519-sha256@libssh.org";
pub const CURVE25519: &str = "curve25519-sha256";
pub const DH_GROUP14_SHA256: &str = "diffie-hellman-group14-sha256";

pub fn is_curve25519(name: &str) -> bool {
    name == CURVE25519 || name == CURVE25519_LIBSSH
}

pub fn is_group14(name: &str) -> bool {
    name == DH_GROUP14_SHA256
}

/// In-flight exchange secrets. Created when our kex init message goes
/// out, consumed by the server's reply.
pub enum KexState {
    Curve25519 {
        scalar: [u8; 32],
        public: [u8; 32],
    },
    Group14 {
        exponent: BigUint,
        public: BigUint,
    },
}

impl std::fmt::Debug for KexState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            KexState::Curve25519 { .. } => write!(f, "KexState::Curve25519 {{ [hidden] }}"),
            KexState::Group14 { .. } => write!(f, "KexState::Group14 {{ [hidden] }}"),
        }
    }
}

impl KexState {
    /// Draw the ephemeral secret and build the kex init payload
    /// (`SSH_MSG_KEX_ECDH_INIT` or `SSH_MSG_KEXDH_INIT`).
    pub fn initiate(
        name: &str,
        provider: &dyn CryptoProvider,
        entropy: &mut dyn EntropySource,
    ) -> Result<(KexState, Vec<u8>), SshError> {
        if is_curve25519(name) {
            let mut scalar = [0u8; X25519_LEN];
            entropy.fill(&mut scalar);
            let public = provider.x25519_base(&scalar)?;
            let mut payload = Vec::with_capacity(1 + 4 + X25519_LEN);
            payload.push(msg::KEX_ECDH_INIT);
            payload.extend_ssh_string(&public);
            Ok((KexState::Curve25519 { scalar, public }, payload))
        } else if is_group14(name) {
            let mut random = [0u8; 32];
            entropy.fill(&mut random);
            let exponent = group14::derive_exponent(&random);
            let public = group14::public_value(&exponent);
            let mut payload = Vec::new();
            payload.push(msg::KEXDH_INIT);
            payload.extend_ssh_mpint(&public.to_bytes_be());
            Ok((KexState::Group14 { exponent, public }, payload))
        } else {
            Err(SshError::NotImplemented("key exchange algorithm"))
        }
    }
}

/// One public-value field of the exchange hash: curve25519 public keys
/// travel as strings, group14 public values as mpints.
pub enum HashField<'a> {
    Str(&'a [u8]),
    Mpint(&'a [u8]),
}

impl HashField<'_> {
    fn encode_into(&self, buffer: &mut Vec<u8>) {
        match self {
            HashField::Str(s) => buffer.extend_ssh_string(s),
            HashField::Mpint(m) => buffer.extend_ssh_mpint(m),
        }
    }
}

/// Compute the exchange hash: SHA-256 over the identification lines, both
/// KEXINIT payloads, the host key blob, both public values and the shared
/// secret (RFC 5656 §4 layout).
#[allow(clippy::too_many_arguments)]
pub fn exchange_hash(
    provider: &dyn CryptoProvider,
    client_id: &str,
    server_id: &str,
    client_kexinit: &[u8],
    server_kexinit: &[u8],
    host_key_blob: &[u8],
    client_public: HashField<'_>,
    server_public: HashField<'_>,
    shared_magnitude: &[u8],
) -> [u8; 32] {
    let mut buffer = Vec::new();
    buffer.extend_ssh_string(client_id.as_bytes());
    buffer.extend_ssh_string(server_id.as_bytes());
    buffer.extend_ssh_string(client_kexinit);
    buffer.extend_ssh_string(server_kexinit);
    buffer.extend_ssh_string(host_key_blob);
    client_public.encode_into(&mut buffer);
    server_public.encode_into(&mut buffer);
    buffer.extend_ssh_mpint(shared_magnitude);
    provider.sha256(&buffer)
}

/// X25519 emits its output little-endian; the SSH shared secret is that
/// integer re-encoded big-endian for mpint purposes.
pub fn curve25519_shared_magnitude(shared: &[u8; 32]) -> Vec<u8> {
    let mut magnitude = shared.to_vec();
    magnitude.reverse();
    magnitude
}

/// The shared secret K as the mpint field it occupies in every KDF hash
/// input.
pub fn shared_mpint_field(magnitude: &[u8]) -> Vec<u8> {
    let mut field = Vec::with_capacity(magnitude.len() + 5);
    field.extend_ssh_mpint(magnitude);
    field
}
