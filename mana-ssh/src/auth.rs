//! Public-key user authentication (RFC 4252 §7, Ed25519 only). The
//! signing key never enters the engine: the embedder injects an identity
//! whose `signer` produces the signature over the session-binding
//! transcript.

use std::sync::Arc;

use ed25519_dalek::{Signer as _, SigningKey};

use crate::codec::Encoding;
use crate::crypto::{ED25519_KEY_LEN, ED25519_SIG_LEN};
use crate::msg;

pub const ED25519: &str = "ssh-ed25519";
pub const CONNECTION_SERVICE: &str = "ssh-connection";
pub const USERAUTH_SERVICE: &str = "ssh-userauth";

type SignFn = Arc<dyn Fn(&[u8]) -> [u8; ED25519_SIG_LEN] + Send + Sync>;

/// Injected identity hooks.
#[derive(Clone)]
pub struct Identity {
    pub username: String,
    pub algorithm: String,
    pub public_key: [u8; ED25519_KEY_LEN],
    signer: SignFn,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("username", &self.username)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl Identity {
    pub fn new(
        username: impl Into<String>,
        public_key: [u8; ED25519_KEY_LEN],
        signer: SignFn,
    ) -> Self {
        Identity {
            username: username.into(),
            algorithm: ED25519.to_owned(),
            public_key,
            signer,
        }
    }

    /// Convenience constructor holding the key in-process.
    pub fn from_signing_key(username: impl Into<String>, key: SigningKey) -> Self {
        let public_key = key.verifying_key().to_bytes();
        Identity::new(
            username,
            public_key,
            Arc::new(move |data| key.sign(data).to_bytes()),
        )
    }

    pub fn sign(&self, data: &[u8]) -> [u8; ED25519_SIG_LEN] {
        (self.signer)(data)
    }
}

/// The wire form of a public key: `string(algorithm) ‖ string(raw key)`.
pub fn public_key_blob(algorithm: &str, raw: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(8 + algorithm.len() + raw.len());
    blob.extend_ssh_string(algorithm.as_bytes());
    blob.extend_ssh_string(raw);
    blob
}

/// The wire form of a signature: `string(algorithm) ‖ string(raw
/// signature)`.
pub fn signature_blob(algorithm: &str, raw: &[u8]) -> Vec<u8> {
    public_key_blob(algorithm, raw)
}

fn request_body(identity: &Identity) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(msg::USERAUTH_REQUEST);
    body.extend_ssh_string(identity.username.as_bytes());
    body.extend_ssh_string(CONNECTION_SERVICE.as_bytes());
    body.extend_ssh_string(b"publickey");
    body.push(1); // signature follows
    body.extend_ssh_string(identity.algorithm.as_bytes());
    let blob = public_key_blob(&identity.algorithm, &identity.public_key);
    body.extend_ssh_string(&blob);
    body
}

/// The transcript the client signs: `string(session_id)` followed by the
/// USERAUTH_REQUEST body with the signature-follows flag set.
pub fn session_binding(session_id: &[u8], identity: &Identity) -> Vec<u8> {
    let mut transcript = Vec::new();
    transcript.extend_ssh_string(session_id);
    transcript.extend_from_slice(&request_body(identity));
    transcript
}

/// The complete USERAUTH_REQUEST payload, signature included.
pub fn userauth_request_payload(session_id: &[u8], identity: &Identity) -> Vec<u8> {
    let signature = identity.sign(&session_binding(session_id, identity));
    let mut payload = request_body(identity);
    payload.extend_ssh_string(&signature_blob(&identity.algorithm, &signature));
    payload
}

/// `SERVICE_REQUEST("ssh-userauth")`.
pub fn service_request_payload() -> Vec<u8> {
    let mut payload = Vec::new();
    payload.push(msg::SERVICE_REQUEST);
    payload.extend_ssh_string(USERAUTH_SERVICE.as_bytes());
    payload
}
