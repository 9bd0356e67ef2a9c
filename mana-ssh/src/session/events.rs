//! Session events: queued synchronously for `next_event()` polling and
//! mirrored into a single takeable async stream.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::negotiation::NegotiatedAlgorithms;
use crate::ChannelId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionPhase {
    Initial,
    Rekey,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    IdentificationSent {
        line: String,
    },
    IdentificationReceived {
        line: String,
    },
    KexInitSent,
    KexInitReceived,
    KeysEstablished {
        algorithms: NegotiatedAlgorithms,
    },
    /// Raw bytes the embedder must put on the wire outside the packet
    /// stream; only the identification line travels this way.
    OutboundData {
        payload: Bytes,
        encryption: EncryptionPhase,
    },
    AuthBanner {
        message: String,
    },
    AuthPrompt {
        prompt: String,
    },
    AuthSuccess,
    AuthFailure {
        methods: Vec<String>,
        partial: bool,
    },
    ChannelOpen {
        id: ChannelId,
        remote_id: u32,
        window_size: u32,
        max_packet_size: u32,
    },
    ChannelData {
        id: ChannelId,
        data: Bytes,
    },
    ChannelWindowAdjust {
        id: ChannelId,
        new_size: u32,
    },
    ChannelRequestOutcome {
        id: ChannelId,
        request: String,
        success: bool,
    },
    ChannelEof {
        id: ChannelId,
    },
    ChannelClose {
        id: ChannelId,
        exit_status: Option<u32>,
    },
    ChannelExitStatus {
        id: ChannelId,
        status: u32,
    },
    ChannelExitSignal {
        id: ChannelId,
        signal: String,
        core_dumped: bool,
        message: String,
        language: String,
    },
    GlobalRequest {
        name: String,
        want_reply: bool,
    },
    Disconnect {
        code: u32,
        description: String,
        language: String,
    },
    Warning {
        code: String,
        message: String,
        detail: Option<String>,
    },
}

/// Single producer, two consumption paths: a synchronous queue and an
/// async mirror. Dropping the mirror sender terminates the stream.
pub(crate) struct EventQueue {
    queue: VecDeque<SessionEvent>,
    mirror: Option<UnboundedSender<SessionEvent>>,
}

impl EventQueue {
    pub fn new() -> (Self, SessionEvents) {
        let (tx, rx) = unbounded_channel();
        (
            EventQueue {
                queue: VecDeque::new(),
                mirror: Some(tx),
            },
            SessionEvents { rx },
        )
    }

    pub fn push(&mut self, event: SessionEvent) {
        trace!(?event, "session event");
        if let Some(mirror) = &self.mirror {
            // A dropped consumer is not an error; the queue still serves
            // next_event().
            let _ = mirror.send(event.clone());
        }
        self.queue.push_back(event);
    }

    pub fn pop(&mut self) -> Option<SessionEvent> {
        self.queue.pop_front()
    }

    /// Terminate the async stream. Queued events stay pollable.
    pub fn close(&mut self) {
        self.mirror = None;
    }
}

/// The lazy, finite async sequence of session events.
pub struct SessionEvents {
    rx: UnboundedReceiver<SessionEvent>,
}

impl SessionEvents {
    /// Next event, or `None` once the session has closed the stream.
    pub async fn next(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}
