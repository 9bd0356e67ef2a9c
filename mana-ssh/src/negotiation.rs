//! Algorithm negotiation, RFC 4253 §7.1. The client's preference order
//! wins: for each category we pick the first client-preferred name that
//! also appears in the server's list.

use crate::codec::{Encoding, Reader};
use crate::config::AlgorithmPreferences;
use crate::crypto::EntropySource;
use crate::{msg, SshError};

/// The eight names fixed by a successful negotiation. Immutable once set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    pub kex: String,
    pub host_key: String,
    pub cipher_c2s: String,
    pub cipher_s2c: String,
    pub mac_c2s: String,
    pub mac_s2c: String,
    pub compression_c2s: String,
    pub compression_s2c: String,
}

/// Parsed server KEXINIT.
#[derive(Debug, Clone)]
pub struct ServerKexInit {
    pub kex: Vec<String>,
    pub host_keys: Vec<String>,
    pub ciphers_c2s: Vec<String>,
    pub ciphers_s2c: Vec<String>,
    pub macs_c2s: Vec<String>,
    pub macs_s2c: Vec<String>,
    pub compression_c2s: Vec<String>,
    pub compression_s2c: Vec<String>,
    pub languages_c2s: Vec<String>,
    pub languages_s2c: Vec<String>,
    pub first_kex_packet_follows: bool,
}

pub const COOKIE_LEN: usize = 16;

/// Parse a KEXINIT payload (message byte included). The cookie is read
/// and discarded.
pub fn parse_kexinit(payload: &[u8]) -> Result<ServerKexInit, SshError> {
    let mut r = Reader::new(payload);
    if r.read_byte()? != msg::KEXINIT {
        return Err(SshError::Decode("not a KEXINIT payload"));
    }
    r.skip(COOKIE_LEN)?;
    let kexinit = ServerKexInit {
        kex: r.read_name_list()?,
        host_keys: r.read_name_list()?,
        ciphers_c2s: r.read_name_list()?,
        ciphers_s2c: r.read_name_list()?,
        macs_c2s: r.read_name_list()?,
        macs_s2c: r.read_name_list()?,
        compression_c2s: r.read_name_list()?,
        compression_s2c: r.read_name_list()?,
        languages_c2s: r.read_name_list()?,
        languages_s2c: r.read_name_list()?,
        first_kex_packet_follows: r.read_bool()?,
    };
    r.read_u32()?; // reserved
    Ok(kexinit)
}

/// Serialize our KEXINIT payload. The `ext-info-c` style extension
/// markers ride at the end of the kex name list (RFC 8308 §2.1).
pub fn write_kexinit(prefs: &AlgorithmPreferences, entropy: &mut dyn EntropySource) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(msg::KEXINIT);

    let mut cookie = [0u8; COOKIE_LEN];
    entropy.fill(&mut cookie);
    buf.extend_from_slice(&cookie);

    buf.extend_list(prefs.key_exchange.iter().chain(prefs.extensions.iter()));
    buf.extend_list(prefs.host_keys.iter());
    buf.extend_list(prefs.ciphers.iter()); // client to server
    buf.extend_list(prefs.ciphers.iter()); // server to client
    buf.extend_list(prefs.macs.iter());
    buf.extend_list(prefs.macs.iter());
    buf.extend_list(prefs.compression.iter());
    buf.extend_list(prefs.compression.iter());
    buf.write_empty_list(); // languages client to server
    buf.write_empty_list(); // languages server to client

    buf.push(0); // first_kex_packet_follows
    buf.extend_from_slice(&[0, 0, 0, 0]); // reserved
    buf
}

/// First client-preferred name also present on the server side.
fn select<'a>(client: &'a [String], server: &[String]) -> Option<&'a str> {
    client
        .iter()
        .find(|c| server.iter().any(|s| s == *c))
        .map(|s| s.as_str())
}

/// Run negotiation across all categories. Any category without a common
/// name is fatal.
pub fn negotiate(
    prefs: &AlgorithmPreferences,
    server: &ServerKexInit,
) -> Result<NegotiatedAlgorithms, SshError> {
    let kex = select(&prefs.key_exchange, &server.kex)
        .ok_or(SshError::NoCommonAlgorithm("key exchange"))?;
    let host_key =
        select(&prefs.host_keys, &server.host_keys).ok_or(SshError::NoCommonAlgorithm("host key"))?;
    let cipher_c2s = select(&prefs.ciphers, &server.ciphers_c2s)
        .ok_or(SshError::NoCommonAlgorithm("client-to-server cipher"))?;
    let cipher_s2c = select(&prefs.ciphers, &server.ciphers_s2c)
        .ok_or(SshError::NoCommonAlgorithm("server-to-client cipher"))?;
    let mac_c2s = select(&prefs.macs, &server.macs_c2s)
        .ok_or(SshError::NoCommonAlgorithm("client-to-server MAC"))?;
    let mac_s2c = select(&prefs.macs, &server.macs_s2c)
        .ok_or(SshError::NoCommonAlgorithm("server-to-client MAC"))?;
    let compression_c2s = select(&prefs.compression, &server.compression_c2s)
        .ok_or(SshError::NoCommonAlgorithm("client-to-server compression"))?;
    let compression_s2c = select(&prefs.compression, &server.compression_s2c)
        .ok_or(SshError::NoCommonAlgorithm("server-to-client compression"))?;

    Ok(NegotiatedAlgorithms {
        kex: kex.to_owned(),
        host_key: host_key.to_owned(),
        cipher_c2s: cipher_c2s.to_owned(),
        cipher_s2c: cipher_s2c.to_owned(),
        mac_c2s: mac_c2s.to_owned(),
        mac_s2c: mac_s2c.to_owned(),
        compression_c2s: compression_c2s.to_owned(),
        compression_s2c: compression_s2c.to_owned(),
    })
}

/// Whether the server's optimistic first kex packet used the algorithms
/// we would pick: both sides' first kex and host key preferences match.
pub fn guess_matches(prefs: &AlgorithmPreferences, server: &ServerKexInit) -> bool {
    prefs.key_exchange.first() == server.kex.first()
        && prefs.host_keys.first() == server.host_keys.first()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ScriptedEntropy;

    fn server_with(kex: &[&str]) -> ServerKexInit {
        ServerKexInit {
            kex: kex.iter().map(|s| s.to_string()).collect(),
            host_keys: vec!["ssh-ed25519".into()],
            ciphers_c2s: vec!["aes128-gcm@openssh.com".into()],
            ciphers_s2c: vec!["aes128-gcm@openssh.com".into()],
            macs_c2s: vec!["hmac-sha2-256".into()],
            macs_s2c: vec!["hmac-sha2-256".into()],
            compression_c2s: vec!["none".into()],
            compression_s2c: vec!["none".into()],
            languages_c2s: vec![],
            languages_s2c: vec![],
            first_kex_packet_follows: false,
        }
    }

    #[test]
    fn client_preference_wins_the_tie_break() {
        let prefs = AlgorithmPreferences::default();
        let server = server_with(&[
            "diffie-hellman-group14-sha256",
            "curve25519-sha256@libssh.org",
        ]);
        let names = negotiate(&prefs, &server).unwrap();
        assert_eq!(names.kex, "curve25519-sha256@libssh.org");
    }

    #[test]
    fn falls_back_to_group14() {
        let prefs = AlgorithmPreferences::default();
        let server = server_with(&["diffie-hellman-group14-sha256"]);
        let names = negotiate(&prefs, &server).unwrap();
        assert_eq!(names.kex, "diffie-hellman-group14-sha256");
    }

    #[test]
    fn mismatch_is_an_error() {
        let prefs = AlgorithmPreferences::default();
        let server = server_with(&["ecdh-sha2-nistp256"]);
        assert!(matches!(
            negotiate(&prefs, &server),
            Err(SshError::NoCommonAlgorithm("key exchange"))
        ));
    }

    #[test]
    fn kexinit_round_trip() {
        let prefs = AlgorithmPreferences::default();
        let mut entropy = ScriptedEntropy::new(&[0x5a; COOKIE_LEN]);
        let payload = write_kexinit(&prefs, &mut entropy);
        let parsed = parse_kexinit(&payload).unwrap();
        // Our own extension marker rides in the kex list.
        assert!(parsed.kex.iter().any(|k| k == "ext-info-c"));
        assert_eq!(parsed.host_keys, prefs.host_keys);
        assert!(!parsed.first_kex_packet_follows);
    }
}
