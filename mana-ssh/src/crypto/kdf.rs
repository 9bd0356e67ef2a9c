//! SSH key derivation, RFC 4253 §7.2.

use super::CryptoProvider;

/// Derivation letters: client-to-server IV, server-to-client IV,
/// client-to-server key, server-to-client key, client-to-server
/// integrity, server-to-client integrity.
pub const LETTERS: [u8; 6] = [b'A', b'B', b'C', b'D', b'E', b'F'];

/// Derive `len` bytes of key material.
///
/// `shared_mpint` is the shared secret K already encoded as an mpint
/// field (the form it takes inside every hash input). The initial block
/// is `HASH(K ‖ H ‖ letter ‖ session_id)`; the material is extended with
/// `HASH(K ‖ H ‖ accumulated)` until long enough, then truncated.
pub fn derive_key_material(
    provider: &dyn CryptoProvider,
    shared_mpint: &[u8],
    exchange_hash: &[u8],
    letter: u8,
    session_id: &[u8],
    len: usize,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(shared_mpint.len() + exchange_hash.len() + 1 + session_id.len());
    buffer.extend_from_slice(shared_mpint);
    buffer.extend_from_slice(exchange_hash);
    buffer.push(letter);
    buffer.extend_from_slice(session_id);

    let mut material = provider.sha256(&buffer).to_vec();
    while material.len() < len {
        buffer.clear();
        buffer.extend_from_slice(shared_mpint);
        buffer.extend_from_slice(exchange_hash);
        buffer.extend_from_slice(&material);
        let next = provider.sha256(&buffer);
        material.extend_from_slice(&next);
    }
    material.truncate(len);
    material
}
