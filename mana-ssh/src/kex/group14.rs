//! diffie-hellman-group14-sha256: the fixed 2048-bit MODP group of
//! RFC 3526 §3 with generator 2.

use num_bigint::BigUint;

use crate::SshError;

const GROUP14_PRIME_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D",
    "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F",
    "83655D23DCA3AD961C62F356208552BB9ED529077096966D",
    "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9",
    "DE2BCBF6955817183995497CEA956AE515D2261898FA0510",
    "15728E5A8AACAA68FFFFFFFFFFFFFFFF",
);

pub fn prime() -> BigUint {
    BigUint::parse_bytes(GROUP14_PRIME_HEX.as_bytes(), 16)
        .unwrap_or_else(|| unreachable!("group 14 prime constant parses"))
}

pub fn generator() -> BigUint {
    BigUint::from(2u8)
}

/// Map raw entropy onto an exponent in `[2, p−1)`: `(x mod (p−2)) + 2`.
pub fn derive_exponent(random: &[u8]) -> BigUint {
    let p = prime();
    let x = BigUint::from_bytes_be(random);
    x % (&p - 2u8) + 2u8
}

/// `g^x mod p`.
pub fn public_value(exponent: &BigUint) -> BigUint {
    generator().modpow(exponent, &prime())
}

/// `peer^x mod p` after checking `1 < peer < p−1`.
pub fn shared_secret(peer: &BigUint, exponent: &BigUint) -> Result<BigUint, SshError> {
    let p = prime();
    let one = BigUint::from(1u8);
    if *peer <= one || *peer >= &p - &one {
        return Err(SshError::Protocol(
            "DH peer value outside (1, p-1)".into(),
        ));
    }
    Ok(peer.modpow(exponent, &p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prime_has_expected_shape() {
        let p = prime();
        assert_eq!(p.bits(), 2048);
        // Both ends of the constant are runs of ones.
        let bytes = p.to_bytes_be();
        assert_eq!(&bytes[..8], &[0xff; 8]);
        assert_eq!(&bytes[bytes.len() - 8..], &[0xff; 8]);
    }

    #[test]
    fn exponent_lands_in_range() {
        let small = derive_exponent(&[0u8; 32]);
        assert_eq!(small, BigUint::from(2u8));
        let big = derive_exponent(&[0xff; 64]);
        assert!(big >= BigUint::from(2u8));
        assert!(big < prime() - 1u8);
    }

    #[test]
    fn dh_agreement() {
        let a = derive_exponent(b"alice-entropy-alice-entropy-alice");
        let b = derive_exponent(b"bob-entropy-bob-entropy-bob-bob-b");
        let pub_a = public_value(&a);
        let pub_b = public_value(&b);
        let s1 = shared_secret(&pub_b, &a).unwrap();
        let s2 = shared_secret(&pub_a, &b).unwrap();
        assert_eq!(s1, s2);
    }

    #[test]
    fn degenerate_peer_values_rejected() {
        let x = derive_exponent(&[7u8; 32]);
        assert!(shared_secret(&BigUint::from(1u8), &x).is_err());
        assert!(shared_secret(&(prime() - 1u8), &x).is_err());
        assert!(shared_secret(&BigUint::from(0u8), &x).is_err());
    }
}
