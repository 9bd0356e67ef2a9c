//! `aes128-gcm@openssh.com` direction state, RFC 5647.
//!
//! The 12-byte nonce is `fixed_iv(4) ‖ invocation_counter(8, big-endian)`;
//! the counter starts from the low 8 bytes of the derived IV and increments
//! once per packet. The 4-byte packet length is authenticated but not
//! encrypted.

use byteorder::{BigEndian, ByteOrder};
use zeroize::Zeroize;

use super::{padding_length, GCM_BLOCK, PACKET_LENGTH_LEN, PADDING_LENGTH_LEN};
use crate::codec::Encoding;
use crate::crypto::{
    CryptoProvider, EntropySource, AES128_KEY_LEN, GCM_NONCE_LEN, GCM_TAG_LEN,
};
use crate::SshError;

pub const NAME: &str = "aes128-gcm@openssh.com";

pub struct GcmDirection {
    key: [u8; AES128_KEY_LEN],
    fixed_iv: [u8; 4],
    invocation: u64,
    sequence: u32,
}

impl std::fmt::Debug for GcmDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("GcmDirection")
            .field("invocation", &self.invocation)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

impl Drop for GcmDirection {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl GcmDirection {
    /// Build a direction from KDF output. The initial IV splits into a
    /// 4-byte fixed prefix and the big-endian initial invocation counter.
    /// `sequence` continues the direction's running packet count.
    pub fn from_key_material(key: &[u8], iv: &[u8], sequence: u32) -> Result<Self, SshError> {
        if key.len() != AES128_KEY_LEN || iv.len() != GCM_NONCE_LEN {
            return Err(SshError::Invariant("bad AES-GCM key material length"));
        }
        let mut fixed_iv = [0u8; 4];
        fixed_iv.copy_from_slice(&iv[..4]);
        Ok(GcmDirection {
            key: key.try_into().map_err(|_| SshError::Invariant("key size"))?,
            fixed_iv,
            invocation: BigEndian::read_u64(&iv[4..]),
            sequence,
        })
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub(super) fn sequence_mut(&mut self) -> &mut u32 {
        &mut self.sequence
    }

    fn nonce(&self) -> [u8; GCM_NONCE_LEN] {
        let mut nonce = [0u8; GCM_NONCE_LEN];
        nonce[..4].copy_from_slice(&self.fixed_iv);
        BigEndian::write_u64(&mut nonce[4..], self.invocation);
        nonce
    }

    /// The invocation counter saturates at 2^64−1; reaching it is fatal
    /// exhaustion.
    fn advance_invocation(&mut self) -> Result<(), SshError> {
        self.invocation = self
            .invocation
            .checked_add(1)
            .ok_or(SshError::Exhausted("AES-GCM invocation counter"))?;
        Ok(())
    }

    /// Seal one payload into `length ‖ ciphertext ‖ tag`.
    pub fn seal(
        &mut self,
        provider: &dyn CryptoProvider,
        entropy: &mut dyn EntropySource,
        payload: &[u8],
    ) -> Result<Vec<u8>, SshError> {
        let padding = padding_length(payload.len(), GCM_BLOCK);
        let packet_length = PADDING_LENGTH_LEN + payload.len() + padding;

        let mut wire = Vec::with_capacity(PACKET_LENGTH_LEN + packet_length + GCM_TAG_LEN);
        wire.push_u32_be(packet_length as u32);
        wire.push(padding as u8);
        wire.extend_from_slice(payload);
        let pad_start = wire.len();
        wire.resize(pad_start + padding, 0);
        entropy.fill(&mut wire[pad_start..]);

        let nonce = self.nonce();
        let (aad, plaintext) = wire.split_at_mut(PACKET_LENGTH_LEN);
        let tag = provider.aes128_gcm_seal(&self.key, &nonce, aad, plaintext)?;
        wire.extend_from_slice(&tag);

        self.advance_invocation()?;
        Ok(wire)
    }

    /// Open one full wire chunk `length ‖ ciphertext ‖ tag` and return the
    /// payload with padding stripped.
    pub fn open(
        &mut self,
        provider: &dyn CryptoProvider,
        wire: &[u8],
    ) -> Result<Vec<u8>, SshError> {
        if wire.len() < PACKET_LENGTH_LEN + GCM_TAG_LEN {
            return Err(SshError::Decode("short AES-GCM packet"));
        }
        let (aad, rest) = wire.split_at(PACKET_LENGTH_LEN);
        let packet_length = BigEndian::read_u32(aad) as usize;
        let (ciphertext, tag) = rest.split_at(rest.len() - GCM_TAG_LEN);
        if ciphertext.len() != packet_length {
            return Err(SshError::Protocol(format!(
                "AES-GCM ciphertext length {} does not match packet length {}",
                ciphertext.len(),
                packet_length
            )));
        }

        let nonce = self.nonce();
        let mut plaintext = ciphertext.to_vec();
        let tag: [u8; GCM_TAG_LEN] = tag.try_into().map_err(|_| SshError::Decryption)?;
        provider.aes128_gcm_open(&self.key, &nonce, aad, &mut plaintext, &tag)?;

        if plaintext.len() != packet_length {
            return Err(SshError::Protocol(
                "decrypted length does not match packet length".into(),
            ));
        }
        let padding = plaintext[0] as usize;
        if padding < super::MIN_PADDING {
            return Err(SshError::Protocol(format!("padding length {padding} < 4")));
        }
        let payload_end = plaintext
            .len()
            .checked_sub(padding)
            .filter(|&end| end >= PADDING_LENGTH_LEN)
            .ok_or_else(|| SshError::Protocol("padding longer than packet".into()))?;

        self.advance_invocation()?;
        Ok(plaintext[PADDING_LENGTH_LEN..payload_end].to_vec())
    }
}
