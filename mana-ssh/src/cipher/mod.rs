//! Packet sealing and opening, RFC 4253 §6. Before key activation the
//! direction runs in the clear with an 8-byte block; after NEWKEYS it runs
//! AES-128-GCM (RFC 5647) with the 4-byte length prefix authenticated as
//! associated data.

pub mod aes128gcm;

use crate::codec::Encoding;
use crate::crypto::{CryptoProvider, EntropySource};
use crate::SshError;

pub use aes128gcm::GcmDirection;

pub const PACKET_LENGTH_LEN: usize = 4;
pub const PADDING_LENGTH_LEN: usize = 1;
pub const MIN_PADDING: usize = 4;
pub const MAX_PADDING: usize = 255;
/// Minimum size of the whole packet, length field included.
const MIN_PACKET_LEN: usize = 16;

pub const PLAIN_BLOCK: usize = 8;
pub const GCM_BLOCK: usize = 16;

/// Cipher state of one direction of the connection.
#[derive(Debug)]
pub enum DirectionState {
    Plain { sequence: u32 },
    Aes128Gcm(GcmDirection),
}

impl DirectionState {
    pub fn new_plain() -> Self {
        DirectionState::Plain { sequence: 0 }
    }

    pub fn sequence(&self) -> u32 {
        match self {
            DirectionState::Plain { sequence } => *sequence,
            DirectionState::Aes128Gcm(gcm) => gcm.sequence(),
        }
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self, DirectionState::Aes128Gcm(_))
    }

    /// Sequence numbers run modulo 2^32; a wrap within one key epoch is
    /// treated as exhaustion.
    pub fn advance_sequence(&mut self) -> Result<(), SshError> {
        let sequence = match self {
            DirectionState::Plain { sequence } => sequence,
            DirectionState::Aes128Gcm(gcm) => gcm.sequence_mut(),
        };
        *sequence = sequence
            .checked_add(1)
            .ok_or(SshError::Exhausted("packet sequence number"))?;
        Ok(())
    }

    /// Frame (and, when active, seal) one payload into a wire packet.
    pub fn seal(
        &mut self,
        provider: &dyn CryptoProvider,
        entropy: &mut dyn EntropySource,
        payload: &[u8],
    ) -> Result<Vec<u8>, SshError> {
        let wire = match self {
            DirectionState::Plain { .. } => {
                let padding = padding_length(payload.len(), PLAIN_BLOCK);
                let packet_length = PADDING_LENGTH_LEN + payload.len() + padding;
                let mut wire = Vec::with_capacity(PACKET_LENGTH_LEN + packet_length);
                wire.push_u32_be(packet_length as u32);
                wire.push(padding as u8);
                wire.extend_from_slice(payload);
                let pad_start = wire.len();
                wire.resize(pad_start + padding, 0);
                entropy.fill(&mut wire[pad_start..]);
                wire
            }
            DirectionState::Aes128Gcm(gcm) => gcm.seal(provider, entropy, payload)?,
        };
        self.advance_sequence()?;
        Ok(wire)
    }
}

/// Padding needed so that `padding_length ‖ payload ‖ padding` fills whole
/// cipher blocks, with at least [`MIN_PADDING`] bytes and a whole-packet
/// floor of 16 bytes.
pub(crate) fn padding_length(payload_len: usize, block: usize) -> usize {
    let mut padding = block - ((PADDING_LENGTH_LEN + payload_len) % block);
    if padding < MIN_PADDING {
        padding += block;
    }
    while PACKET_LENGTH_LEN + PADDING_LENGTH_LEN + payload_len + padding < MIN_PACKET_LEN {
        padding += block;
    }
    debug_assert!(padding <= MAX_PADDING);
    padding
}
