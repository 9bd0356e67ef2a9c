//! Host key policy and storage. The session hands every received host
//! key to the injected policy; trust-on-first-use, pinned keys and
//! managed allowlists all live behind the same two-method capability.

use std::collections::HashMap;

use data_encoding::BASE64_NOPAD;

/// A server host key as presented during key exchange.
#[derive(Debug, Clone)]
pub struct HostKeyCandidate {
    pub host: String,
    pub port: u16,
    pub key_type: String,
    /// `SHA256:` + unpadded base64 over the raw key bytes.
    pub fingerprint: String,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyDecision {
    Trusted,
    Mismatch { fatal: bool },
}

pub trait HostKeyPolicy: Send {
    fn evaluate(&mut self, candidate: &HostKeyCandidate) -> HostKeyDecision;

    /// Optionally persist a trust decision.
    fn remember(&mut self, _candidate: &HostKeyCandidate, _decision: &HostKeyDecision) {}
}

pub fn format_fingerprint(digest: &[u8]) -> String {
    format!("SHA256:{}", BASE64_NOPAD.encode(digest))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredHostKey {
    pub raw: Vec<u8>,
    pub fingerprint: String,
}

/// Pluggable persistence keyed by `host:port:key_type`.
pub trait HostKeyStore: Send {
    fn lookup(&self, host: &str, port: u16, key_type: &str) -> Option<StoredHostKey>;
    fn insert(&mut self, host: &str, port: u16, key_type: &str, key: StoredHostKey);
}

#[derive(Debug, Default)]
pub struct MemoryHostKeyStore {
    entries: HashMap<(String, u16, String), StoredHostKey>,
}

impl HostKeyStore for MemoryHostKeyStore {
    fn lookup(&self, host: &str, port: u16, key_type: &str) -> Option<StoredHostKey> {
        self.entries
            .get(&(host.to_owned(), port, key_type.to_owned()))
            .cloned()
    }

    fn insert(&mut self, host: &str, port: u16, key_type: &str, key: StoredHostKey) {
        self.entries
            .insert((host.to_owned(), port, key_type.to_owned()), key);
    }
}

/// Trust-on-first-use over a [`HostKeyStore`]: unknown keys are trusted
/// and recorded, changed keys are a fatal mismatch.
pub struct TofuPolicy<S: HostKeyStore> {
    store: S,
}

impl TofuPolicy<MemoryHostKeyStore> {
    pub fn in_memory() -> Self {
        TofuPolicy {
            store: MemoryHostKeyStore::default(),
        }
    }
}

impl<S: HostKeyStore> TofuPolicy<S> {
    pub fn new(store: S) -> Self {
        TofuPolicy { store }
    }
}

impl<S: HostKeyStore> HostKeyPolicy for TofuPolicy<S> {
    fn evaluate(&mut self, candidate: &HostKeyCandidate) -> HostKeyDecision {
        match self
            .store
            .lookup(&candidate.host, candidate.port, &candidate.key_type)
        {
            Some(stored) if stored.raw == candidate.raw => HostKeyDecision::Trusted,
            Some(stored) => {
                warn!(
                    host = %candidate.host,
                    known = %stored.fingerprint,
                    received = %candidate.fingerprint,
                    "host key changed"
                );
                HostKeyDecision::Mismatch { fatal: true }
            }
            None => HostKeyDecision::Trusted,
        }
    }

    fn remember(&mut self, candidate: &HostKeyCandidate, decision: &HostKeyDecision) {
        if matches!(decision, HostKeyDecision::Trusted) {
            self.store.insert(
                &candidate.host,
                candidate.port,
                &candidate.key_type,
                StoredHostKey {
                    raw: candidate.raw.clone(),
                    fingerprint: candidate.fingerprint.clone(),
                },
            );
        }
    }
}
