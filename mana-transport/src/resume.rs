//! Resume token persistence. Records are keyed by transport URL and
//! carry an absolute expiry; expired records are purged on read.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeRecord {
    pub token: String,
    pub expires_at: u64,
    /// Server-side session identifier the token was issued under; a
    /// change invalidates the token.
    pub session: Option<String>,
}

pub trait ResumeStore: Send {
    /// Load the record for `url`, purging it when expired.
    fn load(&mut self, url: &str, now: u64) -> Option<ResumeRecord>;
    fn store(&mut self, url: &str, record: ResumeRecord);
    fn purge(&mut self, url: &str);
}

#[derive(Debug, Default)]
pub struct MemoryResumeStore {
    records: HashMap<String, ResumeRecord>,
}

impl ResumeStore for MemoryResumeStore {
    fn load(&mut self, url: &str, now: u64) -> Option<ResumeRecord> {
        match self.records.get(url) {
            Some(record) if record.expires_at > now => Some(record.clone()),
            Some(_) => {
                debug!(url, "purging expired resume token");
                self.records.remove(url);
                None
            }
            None => None,
        }
    }

    fn store(&mut self, url: &str, record: ResumeRecord) {
        self.records.insert(url.to_owned(), record);
    }

    fn purge(&mut self, url: &str) {
        self.records.remove(url);
    }
}

/// No-op store for deployments with resume disabled.
#[derive(Debug, Default)]
pub struct DisabledResumeStore;

impl ResumeStore for DisabledResumeStore {
    fn load(&mut self, _url: &str, _now: u64) -> Option<ResumeRecord> {
        None
    }

    fn store(&mut self, _url: &str, _record: ResumeRecord) {}

    fn purge(&mut self, _url: &str) {}
}
