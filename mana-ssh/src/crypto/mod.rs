//! Thin capability surface over the cryptographic primitives. The session
//! consumes everything through [`CryptoProvider`] so embedders can swap in
//! hardware-backed or instrumented implementations; [`StackProvider`] is
//! the default, wrapping the pure-Rust sha2 / aes-gcm / dalek stack.

pub mod kdf;

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes128Gcm, KeyInit};
use curve25519_dalek::montgomery::MontgomeryPoint;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand_core::RngCore;
use sha2::{Digest, Sha256};

use crate::SshError;

pub const SHA256_LEN: usize = 32;
pub const AES128_KEY_LEN: usize = 16;
pub const GCM_NONCE_LEN: usize = 12;
pub const GCM_TAG_LEN: usize = 16;
pub const X25519_LEN: usize = 32;
pub const ED25519_KEY_LEN: usize = 32;
pub const ED25519_SIG_LEN: usize = 64;

pub trait CryptoProvider: Send + Sync {
    fn sha256(&self, data: &[u8]) -> [u8; SHA256_LEN];

    /// Seal `buffer` in place, returning the 16-byte tag.
    fn aes128_gcm_seal(
        &self,
        key: &[u8; AES128_KEY_LEN],
        nonce: &[u8; GCM_NONCE_LEN],
        aad: &[u8],
        buffer: &mut [u8],
    ) -> Result<[u8; GCM_TAG_LEN], SshError>;

    /// Open `buffer` in place, verifying the tag.
    fn aes128_gcm_open(
        &self,
        key: &[u8; AES128_KEY_LEN],
        nonce: &[u8; GCM_NONCE_LEN],
        aad: &[u8],
        buffer: &mut [u8],
        tag: &[u8; GCM_TAG_LEN],
    ) -> Result<(), SshError>;

    fn ed25519_verify(
        &self,
        public_key: &[u8; ED25519_KEY_LEN],
        signature: &[u8; ED25519_SIG_LEN],
        message: &[u8],
    ) -> bool;

    /// X25519 scalar multiplication by the base point. The scalar must be
    /// exactly 32 bytes; it is clamped per RFC 7748 before use.
    fn x25519_base(&self, scalar: &[u8]) -> Result<[u8; X25519_LEN], SshError>;

    /// X25519 scalar multiplication with a peer point.
    fn x25519(&self, scalar: &[u8], peer: &[u8; X25519_LEN])
        -> Result<[u8; X25519_LEN], SshError>;
}

/// Default provider over the RustCrypto / dalek crates.
#[derive(Debug, Default, Clone, Copy)]
pub struct StackProvider;

impl CryptoProvider for StackProvider {
    fn sha256(&self, data: &[u8]) -> [u8; SHA256_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn aes128_gcm_seal(
        &self,
        key: &[u8; AES128_KEY_LEN],
        nonce: &[u8; GCM_NONCE_LEN],
        aad: &[u8],
        buffer: &mut [u8],
    ) -> Result<[u8; GCM_TAG_LEN], SshError> {
        let cipher = Aes128Gcm::new_from_slice(key)
            .map_err(|_| SshError::Invariant("bad AES-128-GCM key length"))?;
        let tag = cipher
            .encrypt_in_place_detached(nonce.into(), aad, buffer)
            .map_err(|_| SshError::Invariant("AES-GCM seal failed"))?;
        Ok(tag.into())
    }

    fn aes128_gcm_open(
        &self,
        key: &[u8; AES128_KEY_LEN],
        nonce: &[u8; GCM_NONCE_LEN],
        aad: &[u8],
        buffer: &mut [u8],
        tag: &[u8; GCM_TAG_LEN],
    ) -> Result<(), SshError> {
        let cipher = Aes128Gcm::new_from_slice(key)
            .map_err(|_| SshError::Invariant("bad AES-128-GCM key length"))?;
        cipher
            .decrypt_in_place_detached(nonce.into(), aad, buffer, tag.into())
            .map_err(|_| SshError::Decryption)
    }

    fn ed25519_verify(
        &self,
        public_key: &[u8; ED25519_KEY_LEN],
        signature: &[u8; ED25519_SIG_LEN],
        message: &[u8],
    ) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(public_key) else {
            return false;
        };
        let signature = Signature::from_bytes(signature);
        key.verify(message, &signature).is_ok()
    }

    fn x25519_base(&self, scalar: &[u8]) -> Result<[u8; X25519_LEN], SshError> {
        let scalar = scalar_32(scalar)?;
        Ok(MontgomeryPoint::mul_base_clamped(scalar).0)
    }

    fn x25519(
        &self,
        scalar: &[u8],
        peer: &[u8; X25519_LEN],
    ) -> Result<[u8; X25519_LEN], SshError> {
        let scalar = scalar_32(scalar)?;
        Ok(MontgomeryPoint(*peer).mul_clamped(scalar).0)
    }
}

fn scalar_32(scalar: &[u8]) -> Result<[u8; 32], SshError> {
    scalar
        .try_into()
        .map_err(|_| SshError::Invariant("X25519 scalar must be 32 bytes"))
}

/// Source of random bytes for kex secrets, cookies and packet padding.
pub trait EntropySource: Send {
    fn fill(&mut self, dest: &mut [u8]);
}

/// OS randomness, the default.
#[derive(Debug, Default)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&mut self, dest: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(dest);
    }
}

/// Deterministic source replaying a fixed byte script, for tests and
/// reproduction. Once the script runs out, zero bytes follow.
#[derive(Debug, Default)]
pub struct ScriptedEntropy {
    script: std::collections::VecDeque<u8>,
}

impl ScriptedEntropy {
    pub fn new(script: &[u8]) -> Self {
        Self {
            script: script.iter().copied().collect(),
        }
    }
}

impl EntropySource for ScriptedEntropy {
    fn fill(&mut self, dest: &mut [u8]) {
        for byte in dest.iter_mut() {
            *byte = self.script.pop_front().unwrap_or(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7748 §5.2 test vectors.
    const SCALAR_A: [u8; 32] = [
        0x77, 0x07, 0x6d, 0x0a, 0x73, 0x18, 0xa5, 0x7d, 0x3c, 0x16, 0xc1, 0x72, 0x51, 0xb2,
        0x66, 0x45, 0xdf, 0x4c, 0x2f, 0x87, 0xeb, 0xc0, 0x99, 0x2a, 0xb1, 0x77, 0xfb, 0xa5,
        0x1d, 0xb9, 0x2c, 0x2a,
    ];
    const SCALAR_B: [u8; 32] = [
        0x5d, 0xab, 0x08, 0x7e, 0x62, 0x4a, 0x8a, 0x4b, 0x79, 0xe1, 0x7f, 0x8b, 0x83, 0x80,
        0x0e, 0xe6, 0x6f, 0x3b, 0xb1, 0x29, 0x26, 0x18, 0xb6, 0xfd, 0x1c, 0x2f, 0x8b, 0x27,
        0xff, 0x88, 0xe0, 0xeb,
    ];
    const SHARED: [u8; 32] = [
        0x4a, 0x5d, 0x9d, 0x5b, 0xa4, 0xce, 0x2d, 0xe1, 0x72, 0x8e, 0x3b, 0xf4, 0x80, 0x35,
        0x0f, 0x25, 0xe0, 0x7e, 0x21, 0xc9, 0x47, 0xd1, 0x9e, 0x33, 0x76, 0xf0, 0x9b, 0x3c,
        0x1e, 0x16, 0x17, 0x42,
    ];

    #[test]
    fn x25519_commutes_on_rfc7748_vectors() {
        let provider = StackProvider;
        let pub_a = provider.x25519_base(&SCALAR_A).unwrap();
        let pub_b = provider.x25519_base(&SCALAR_B).unwrap();
        let ab = provider.x25519(&SCALAR_A, &pub_b).unwrap();
        let ba = provider.x25519(&SCALAR_B, &pub_a).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab, SHARED);
    }

    #[test]
    fn x25519_rejects_short_scalar() {
        let provider = StackProvider;
        assert!(provider.x25519_base(&[0u8; 31]).is_err());
    }

    #[test]
    fn gcm_seal_open_round_trip() {
        let provider = StackProvider;
        let key = [7u8; 16];
        let nonce = [1u8; 12];
        let aad = [0u8, 0, 0, 16];
        let mut buffer = b"sixteen byte msg".to_vec();
        let tag = provider
            .aes128_gcm_seal(&key, &nonce, &aad, &mut buffer)
            .unwrap();
        assert_ne!(&buffer, b"sixteen byte msg");
        provider
            .aes128_gcm_open(&key, &nonce, &aad, &mut buffer, &tag)
            .unwrap();
        assert_eq!(&buffer, b"sixteen byte msg");
    }

    #[test]
    fn gcm_open_rejects_bad_tag() {
        let provider = StackProvider;
        let key = [7u8; 16];
        let nonce = [1u8; 12];
        let mut buffer = b"sixteen byte msg".to_vec();
        let mut tag = provider
            .aes128_gcm_seal(&key, &nonce, &[], &mut buffer)
            .unwrap();
        tag[0] ^= 1;
        assert!(matches!(
            provider.aes128_gcm_open(&key, &nonce, &[], &mut buffer, &tag),
            Err(SshError::Decryption)
        ));
    }

    #[test]
    fn scripted_entropy_replays_then_zeroes() {
        let mut entropy = ScriptedEntropy::new(&[1, 2, 3]);
        let mut buf = [0xffu8; 5];
        entropy.fill(&mut buf);
        assert_eq!(buf, [1, 2, 3, 0, 0]);
    }
}
