//! The framer state machine: HELLO handshake, per-direction sequence
//! tracking, heartbeat supervision, resume ticket capture and data-frame
//! reassembly. Pure state: time arrives as a millisecond parameter and
//! wire bytes leave as [`FramerOutput`] values.

use bytes::{Bytes, BytesMut};
use mana_common::DiagnosticRecord;

use crate::control::{
    decode_control, encode_control, CloseHint, ControlMessage, FlowGrant, Heartbeat, Hello,
    ResumeTicket, CLOSE_CODE_CODEC_MISMATCH,
};
use crate::frame::{self, Frame, FrameDecoder, FrameKind};
use crate::resume::{DisabledResumeStore, ResumeRecord, ResumeStore};
use crate::{TransportError, SUBPROTOCOL};

#[derive(Debug, Clone)]
pub struct FramerConfig {
    pub codec: String,
    /// Client-chosen session identifier carried in HELLO.
    pub session: String,
    pub capabilities: Vec<String>,
    /// Resume store key.
    pub url: String,
    pub heartbeat_interval_ms: u64,
    pub hello_deadline_ms: u64,
    /// Fallback lifetime for resume tickets arriving without one.
    pub resume_ttl_ms: u64,
}

impl FramerConfig {
    pub fn new(session: impl Into<String>, url: impl Into<String>) -> Self {
        FramerConfig {
            codec: SUBPROTOCOL.to_owned(),
            session: session.into(),
            capabilities: vec![],
            url: url.into(),
            heartbeat_interval_ms: 10_000,
            hello_deadline_ms: 1_000,
            resume_ttl_ms: 60_000,
        }
    }
}

#[derive(Debug)]
pub enum FramerOutput {
    /// Encoded frame bytes for the carrier.
    Send(Bytes),
    /// Reassembled inbound SSH payload bytes.
    SshData(Bytes),
    HelloReceived(Hello),
    /// The peer granted us transport-level credit.
    FlowGranted(FlowGrant),
    /// Heartbeat supervision gave up; the carrier should reconnect.
    Reconnect,
    /// The peer asked for an orderly close.
    Closed { code: u16, reason: String },
    Diagnostic(DiagnosticRecord),
}

pub struct FrameEngine {
    config: FramerConfig,
    decoder: FrameDecoder,
    next_outbound_seq: u32,
    expected_inbound_seq: u32,
    started_at: Option<u64>,
    hello_received: bool,
    server_session: Option<String>,
    reassembly: BytesMut,
    heartbeat_seq: u64,
    last_probe_at: u64,
    outstanding_probes: u8,
    resume: Box<dyn ResumeStore>,
    closed: bool,
}

impl FrameEngine {
    pub fn new(config: FramerConfig, resume: Box<dyn ResumeStore>) -> Self {
        FrameEngine {
            config,
            decoder: FrameDecoder::new(),
            next_outbound_seq: 0,
            expected_inbound_seq: 0,
            started_at: None,
            hello_received: false,
            server_session: None,
            reassembly: BytesMut::new(),
            heartbeat_seq: 0,
            last_probe_at: 0,
            outstanding_probes: 0,
            resume,
            closed: false,
        }
    }

    pub fn without_resume(config: FramerConfig) -> Self {
        Self::new(config, Box::new(DisabledResumeStore))
    }

    pub fn hello_received(&self) -> bool {
        self.hello_received
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn control_frame(&mut self, message: &ControlMessage) -> Result<Bytes, TransportError> {
        let payload = encode_control(message)?;
        let sequence = frame::allocate_sequence(&mut self.next_outbound_seq)?;
        frame::encode_frame(&Frame::control(sequence, payload))
    }

    /// Send our HELLO (with any stored, unexpired resume token) and start
    /// the handshake deadline.
    pub fn start(&mut self, now: u64) -> Result<Vec<FramerOutput>, TransportError> {
        self.ensure_open()?;
        let resume_token = self
            .resume
            .load(&self.config.url, now)
            .map(|record| record.token);
        let hello = Hello {
            codec: self.config.codec.clone(),
            session: self.config.session.clone(),
            capabilities: if self.config.capabilities.is_empty() {
                None
            } else {
                Some(self.config.capabilities.clone())
            },
            resume_token,
        };
        self.started_at = Some(now);
        self.last_probe_at = now;
        let wire = self.control_frame(&ControlMessage::Hello(hello))?;
        Ok(vec![FramerOutput::Send(wire)])
    }

    /// Frame an outbound SSH payload, splitting past the 1 MiB cap.
    pub fn send_ssh(&mut self, payload: Bytes) -> Result<Vec<FramerOutput>, TransportError> {
        self.ensure_open()?;
        let frames = frame::fragment(FrameKind::Data, payload, &mut self.next_outbound_seq)?;
        frames
            .iter()
            .map(|f| frame::encode_frame(f).map(FramerOutput::Send))
            .collect()
    }

    pub fn send_control(&mut self, message: &ControlMessage) -> Result<FramerOutput, TransportError> {
        self.ensure_open()?;
        Ok(FramerOutput::Send(self.control_frame(message)?))
    }

    /// Ingest carrier bytes; frames are validated, sequence-checked and
    /// dispatched.
    pub fn on_bytes(&mut self, bytes: &[u8], now: u64) -> Result<Vec<FramerOutput>, TransportError> {
        self.ensure_open()?;
        self.decoder.push(bytes);
        let mut outputs = Vec::new();
        while let Some(frame) = self.decoder.next_frame()? {
            if frame.sequence != self.expected_inbound_seq {
                return Err(TransportError::Protocol(format!(
                    "inbound sequence {} where {} was expected",
                    frame.sequence, self.expected_inbound_seq
                )));
            }
            self.expected_inbound_seq = self
                .expected_inbound_seq
                .checked_add(1)
                .ok_or_else(|| TransportError::Protocol("inbound sequence wrapped".into()))?;
            self.on_frame(frame, now, &mut outputs)?;
            if self.closed {
                break;
            }
        }
        Ok(outputs)
    }

    fn on_frame(
        &mut self,
        frame: Frame,
        now: u64,
        outputs: &mut Vec<FramerOutput>,
    ) -> Result<(), TransportError> {
        match frame.kind {
            FrameKind::Data => {
                self.reassembly.extend_from_slice(&frame.payload);
                if frame.fin {
                    let payload = std::mem::take(&mut self.reassembly).freeze();
                    outputs.push(FramerOutput::SshData(payload));
                }
                Ok(())
            }
            FrameKind::Control => self.on_control(&frame.payload, now, outputs),
        }
    }

    fn on_control(
        &mut self,
        payload: &[u8],
        now: u64,
        outputs: &mut Vec<FramerOutput>,
    ) -> Result<(), TransportError> {
        match decode_control(payload)? {
            ControlMessage::Hello(hello) => {
                if hello.codec != self.config.codec {
                    warn!(offered = %hello.codec, "codec mismatch");
                    let close = self.control_frame(&ControlMessage::CloseHint(CloseHint {
                        code: CLOSE_CODE_CODEC_MISMATCH,
                        reason: "codec-mismatch".into(),
                    }))?;
                    outputs.push(FramerOutput::Send(close));
                    // The local close output names the offending codec so
                    // the consumer can raise a typed error.
                    outputs.push(FramerOutput::Closed {
                        code: CLOSE_CODE_CODEC_MISMATCH,
                        reason: hello.codec,
                    });
                    self.closed = true;
                    return Ok(());
                }
                // A token issued under a different server session is dead.
                if let Some(record) = self.resume.load(&self.config.url, now) {
                    if record.session.as_deref().is_some_and(|s| s != hello.session) {
                        debug!("server session changed, purging resume token");
                        self.resume.purge(&self.config.url);
                    }
                }
                self.hello_received = true;
                self.server_session = Some(hello.session.clone());
                outputs.push(FramerOutput::HelloReceived(hello));
                Ok(())
            }
            ControlMessage::Heartbeat(beat) if !beat.reply => {
                let ack = self.control_frame(&ControlMessage::Heartbeat(Heartbeat {
                    seq: beat.seq,
                    reply: true,
                }))?;
                outputs.push(FramerOutput::Send(ack));
                Ok(())
            }
            ControlMessage::Heartbeat(beat) => {
                if beat.seq == self.heartbeat_seq {
                    self.outstanding_probes = 0;
                }
                Ok(())
            }
            ControlMessage::ResumeTicket(ResumeTicket { token, ttl_ms }) => {
                let ttl = if ttl_ms == 0 {
                    self.config.resume_ttl_ms
                } else {
                    ttl_ms
                };
                self.resume.store(
                    &self.config.url,
                    ResumeRecord {
                        token,
                        expires_at: now + ttl,
                        session: self.server_session.clone(),
                    },
                );
                Ok(())
            }
            ControlMessage::CloseHint(hint) => {
                info!(code = hint.code, reason = %hint.reason, "peer close hint");
                outputs.push(FramerOutput::Closed {
                    code: hint.code,
                    reason: hint.reason,
                });
                self.closed = true;
                Ok(())
            }
            ControlMessage::ErrorReport(report) => {
                outputs.push(FramerOutput::Diagnostic(
                    DiagnosticRecord::warning(&report.code, report.message)
                        .with_detail(report.detail.unwrap_or_default()),
                ));
                Ok(())
            }
            ControlMessage::Flow(grant) => {
                outputs.push(FramerOutput::FlowGranted(grant));
                Ok(())
            }
        }
    }

    /// Time-driven duties: the HELLO deadline and the heartbeat cadence.
    pub fn tick(&mut self, now: u64) -> Result<Vec<FramerOutput>, TransportError> {
        self.ensure_open()?;
        let Some(started_at) = self.started_at else {
            return Ok(vec![]);
        };
        if !self.hello_received {
            if now >= started_at + self.config.hello_deadline_ms {
                return Err(TransportError::HandshakeTimeout);
            }
            return Ok(vec![]);
        }
        let mut outputs = Vec::new();
        if now.saturating_sub(self.last_probe_at) >= self.config.heartbeat_interval_ms {
            if self.outstanding_probes >= 2 {
                warn!("two heartbeat probes unacknowledged");
                self.outstanding_probes = 0;
                outputs.push(FramerOutput::Reconnect);
                return Ok(outputs);
            }
            self.heartbeat_seq += 1;
            self.outstanding_probes += 1;
            self.last_probe_at = now;
            let probe = self.control_frame(&ControlMessage::Heartbeat(Heartbeat {
                seq: self.heartbeat_seq,
                reply: false,
            }))?;
            outputs.push(FramerOutput::Send(probe));
        }
        Ok(outputs)
    }
}
