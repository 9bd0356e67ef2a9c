//! Shared plumbing for the mana workspace: diagnostic records and the
//! filtered event hub used by the transport's connection state machine.

mod diagnostics;
pub mod eventhub;

pub use diagnostics::{DiagnosticRecord, DiagnosticSink, Severity};
