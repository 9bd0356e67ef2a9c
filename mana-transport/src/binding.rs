//! Byte-level transport binding contract. The conduit drives the SSH
//! engine over anything that can send bytes and deliver inbound bytes,
//! close and error notifications through registered callbacks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::TransportError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseSummary {
    pub code: Option<u16>,
    pub reason: Option<String>,
}

pub type DataCallback = Box<dyn FnMut(Bytes) + Send>;
pub type CloseCallback = Box<dyn FnMut(CloseSummary) + Send>;
pub type ErrorCallback = Box<dyn FnMut(TransportError) + Send>;

/// Undoes a callback registration.
pub struct Disposer(Option<Box<dyn FnOnce() + Send>>);

impl Disposer {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Disposer(Some(Box::new(f)))
    }

    pub fn dispose(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

pub trait TransportBinding: Send {
    fn send(&mut self, bytes: Bytes) -> Result<(), TransportError>;
    fn on_data(&mut self, callback: DataCallback) -> Disposer;
    fn on_close(&mut self, callback: CloseCallback) -> Disposer;
    fn on_error(&mut self, callback: ErrorCallback) -> Disposer;

    /// Outbound bytes accepted but not yet handed to the OS, for
    /// backpressure sampling. Bindings without visibility report zero.
    fn buffered_bytes(&self) -> u64 {
        0
    }
}

pub(crate) type Registry<C> = Arc<Mutex<HashMap<u64, C>>>;

pub(crate) fn register<C>(registry: &Registry<C>, ids: &AtomicU64, callback: C) -> Disposer
where
    C: Send + 'static,
{
    let id = ids.fetch_add(1, Ordering::Relaxed);
    registry
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(id, callback);
    let registry = registry.clone();
    Disposer::new(move || {
        registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    })
}

struct PairShared {
    data: Registry<DataCallback>,
    close: Registry<CloseCallback>,
    closed: std::sync::atomic::AtomicBool,
}

/// In-memory duplex binding: bytes sent on one endpoint are delivered
/// synchronously to the peer's data callbacks. Used in tests and as the
/// reference for the callback contract.
pub struct PairBinding {
    local: Arc<PairShared>,
    peer: Arc<PairShared>,
    errors: Registry<ErrorCallback>,
    ids: Arc<AtomicU64>,
}

pub fn pair() -> (PairBinding, PairBinding) {
    let a = Arc::new(PairShared {
        data: Arc::new(Mutex::new(HashMap::new())),
        close: Arc::new(Mutex::new(HashMap::new())),
        closed: std::sync::atomic::AtomicBool::new(false),
    });
    let b = Arc::new(PairShared {
        data: Arc::new(Mutex::new(HashMap::new())),
        close: Arc::new(Mutex::new(HashMap::new())),
        closed: std::sync::atomic::AtomicBool::new(false),
    });
    let ids = Arc::new(AtomicU64::new(0));
    (
        PairBinding {
            local: a.clone(),
            peer: b.clone(),
            errors: Arc::new(Mutex::new(HashMap::new())),
            ids: ids.clone(),
        },
        PairBinding {
            local: b,
            peer: a,
            errors: Arc::new(Mutex::new(HashMap::new())),
            ids,
        },
    )
}

impl PairBinding {
    /// Close both endpoints, notifying close callbacks.
    pub fn close(&mut self, summary: CloseSummary) {
        for shared in [&self.local, &self.peer] {
            shared.closed.store(true, Ordering::SeqCst);
            let mut callbacks = shared.close.lock().unwrap_or_else(|e| e.into_inner());
            for callback in callbacks.values_mut() {
                callback(summary.clone());
            }
        }
    }
}

impl TransportBinding for PairBinding {
    fn send(&mut self, bytes: Bytes) -> Result<(), TransportError> {
        if self.local.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut callbacks = self.peer.data.lock().unwrap_or_else(|e| e.into_inner());
        for callback in callbacks.values_mut() {
            callback(bytes.clone());
        }
        Ok(())
    }

    fn on_data(&mut self, callback: DataCallback) -> Disposer {
        register(&self.local.data, &self.ids, callback)
    }

    fn on_close(&mut self, callback: CloseCallback) -> Disposer {
        register(&self.local.close, &self.ids, callback)
    }

    fn on_error(&mut self, callback: ErrorCallback) -> Disposer {
        register(&self.errors, &self.ids, callback)
    }
}
