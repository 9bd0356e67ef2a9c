//! The client session reducer.

pub(crate) mod channels;
pub(crate) mod events;
mod kexflow;

use std::collections::VecDeque;

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use mana_common::DiagnosticRecord;

use crate::cipher::{DirectionState, MIN_PADDING, PACKET_LENGTH_LEN};
use crate::crypto::GCM_TAG_LEN;
use crate::codec::Reader;
use crate::config::SessionConfig;
use crate::negotiation::NegotiatedAlgorithms;
use crate::{msg, Disconnect, SshError};

use channels::{ChannelSnapshot, ChannelTable, Intent};
use events::{EncryptionPhase, EventQueue, SessionEvent, SessionEvents};
use kexflow::PendingKeys;

/// Maximum length of an identification line, CR LF included
/// (RFC 4253 §4.2).
const MAX_IDENT_LINE: usize = 255;
/// Ceiling on buffered preface bytes while waiting for the server's
/// identification line.
const MAX_PREFACE_BYTES: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Initial,
    Identification,
    Negotiating,
    Kex,
    Authenticated,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub negotiated_algorithms: Option<NegotiatedAlgorithms>,
    pub pending_outbound_packets: usize,
    pub channels: Vec<ChannelSnapshot>,
    pub server_sig_algs: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthProgress {
    Idle,
    ServiceRequested,
    Requested,
    Succeeded,
    Failed,
}

pub struct ClientSession {
    pub(crate) config: SessionConfig,
    pub(crate) phase: SessionPhase,
    client_id_line: String,
    server_id_line: Option<String>,
    preface: Vec<u8>,
    inbound: Vec<u8>,
    outbound: VecDeque<Bytes>,
    pub(crate) events: EventQueue,
    events_stream: Option<SessionEvents>,
    pub(crate) seal: DirectionState,
    pub(crate) open: DirectionState,
    pub(crate) pending_seal: Option<PendingKeys>,
    pub(crate) pending_open: Option<PendingKeys>,
    pub(crate) awaiting_server_newkeys: bool,
    pub(crate) negotiated: Option<NegotiatedAlgorithms>,
    pub(crate) session_id: Option<[u8; 32]>,
    pub(crate) client_kexinit: Option<Vec<u8>>,
    pub(crate) server_kexinit: Option<Vec<u8>>,
    pub(crate) kex_state: Option<crate::kex::KexState>,
    pub(crate) ignore_next_kex_packet: bool,
    pub(crate) auth: AuthProgress,
    pub(crate) channels: ChannelTable,
    pub(crate) server_sig_algs: Option<Vec<String>>,
}

impl ClientSession {
    /// Build a session and queue the identification line. The client id
    /// must begin with `SSH-` and fit the 255-character line limit.
    pub fn new(config: SessionConfig) -> Result<Self, SshError> {
        let client_id_line = config
            .identification
            .client_id
            .trim_end_matches(['\r', '\n'])
            .to_owned();
        if !client_id_line.starts_with("SSH-") {
            return Err(SshError::Invariant("client id must begin with \"SSH-\""));
        }
        if client_id_line.len() + 2 > MAX_IDENT_LINE {
            return Err(SshError::Invariant("client id exceeds 255 characters"));
        }

        let (events, events_stream) = EventQueue::new();
        let mut session = ClientSession {
            phase: SessionPhase::Initial,
            client_id_line,
            server_id_line: None,
            preface: Vec::new(),
            inbound: Vec::new(),
            outbound: VecDeque::new(),
            events,
            events_stream: Some(events_stream),
            seal: DirectionState::new_plain(),
            open: DirectionState::new_plain(),
            pending_seal: None,
            pending_open: None,
            awaiting_server_newkeys: false,
            negotiated: None,
            session_id: None,
            client_kexinit: None,
            server_kexinit: None,
            kex_state: None,
            ignore_next_kex_packet: false,
            auth: AuthProgress::Idle,
            channels: ChannelTable::default(),
            server_sig_algs: None,
            config,
        };

        let mut wire = Vec::new();
        if let Some(banner) = &session.config.identification.banner {
            for line in banner.lines() {
                wire.extend_from_slice(line.as_bytes());
                wire.extend_from_slice(b"\r\n");
            }
        }
        wire.extend_from_slice(session.client_id_line.as_bytes());
        wire.extend_from_slice(b"\r\n");

        session.events.push(SessionEvent::IdentificationSent {
            line: session.client_id_line.clone(),
        });
        session.events.push(SessionEvent::OutboundData {
            payload: Bytes::from(wire),
            encryption: EncryptionPhase::Initial,
        });
        session.phase = SessionPhase::Identification;
        Ok(session)
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Feed raw transport bytes into the reducer.
    pub fn receive(&mut self, bytes: &[u8]) -> Result<(), SshError> {
        self.ensure_live()?;
        match self.receive_inner(bytes) {
            Err(err) if err.is_fatal() => {
                self.fail(&err);
                Err(err)
            }
            other => other,
        }
    }

    /// Apply a user intent.
    pub fn command(&mut self, intent: Intent) -> Result<(), SshError> {
        self.ensure_live()?;
        match self.handle_intent(intent) {
            Err(err) if err.is_fatal() => {
                self.fail(&err);
                Err(err)
            }
            other => other,
        }
    }

    /// Next queued event, if any.
    pub fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.pop()
    }

    /// Take the async event stream. Only one consumer exists; subsequent
    /// calls return `None`.
    pub fn events(&mut self) -> Option<SessionEvents> {
        self.events_stream.take()
    }

    /// Drain queued outbound packets (already framed and, once keys are
    /// active, sealed).
    pub fn flush_outbound(&mut self) -> Vec<Bytes> {
        self.outbound.drain(..).collect()
    }

    pub fn inspect(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            negotiated_algorithms: self.negotiated.clone(),
            pending_outbound_packets: self.outbound.len(),
            channels: self.channels.snapshots(),
            server_sig_algs: self.server_sig_algs.clone(),
        }
    }

    /// Mark the session closed and terminate the event stream.
    /// Idempotent.
    pub fn close(&mut self, reason: Option<&str>) {
        if matches!(self.phase, SessionPhase::Closed) {
            return;
        }
        if let Some(reason) = reason {
            debug!(reason, "session closed");
        }
        self.phase = SessionPhase::Closed;
        self.events.close();
    }

    /// Resolves when all internally queued work has landed. The reducer
    /// runs synchronously, so queued effects are already visible by the
    /// time any entry point returns.
    pub async fn wait_for_idle(&self) {}

    fn ensure_live(&self) -> Result<(), SshError> {
        match self.phase {
            SessionPhase::Closed | SessionPhase::Failed => {
                Err(SshError::Invariant("session closed"))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn diagnostic(&self, record: DiagnosticRecord) {
        debug!(code = %record.code, message = %record.message, "diagnostic");
        if let Some(sink) = &self.config.diagnostics {
            sink(record);
        }
    }

    /// Frame, seal and queue one packet.
    pub(crate) fn send_packet(&mut self, payload: &[u8]) -> Result<(), SshError> {
        let provider = self.config.crypto.clone();
        let wire = self
            .seal
            .seal(provider.as_ref(), self.config.entropy.as_mut(), payload)?;
        self.outbound.push_back(Bytes::from(wire));
        Ok(())
    }

    fn fail(&mut self, err: &SshError) {
        if matches!(self.phase, SessionPhase::Closed | SessionPhase::Failed) {
            return;
        }
        error!(error = %err, "fatal session failure");
        self.phase = SessionPhase::Failed;
        self.diagnostic(DiagnosticRecord::error("fatal", err.to_string()));
        self.events.push(SessionEvent::Warning {
            code: "fatal".into(),
            message: err.to_string(),
            detail: None,
        });
        self.events.push(SessionEvent::Disconnect {
            code: Disconnect::ProtocolError as u32,
            description: "Protocol failure".into(),
            language: String::new(),
        });
        self.events.close();
    }

    fn receive_inner(&mut self, bytes: &[u8]) -> Result<(), SshError> {
        if self.server_id_line.is_none() {
            self.preface.extend_from_slice(bytes);
            self.consume_preface()?;
            if self.server_id_line.is_none() {
                if self.preface.len() > MAX_PREFACE_BYTES {
                    return Err(SshError::Protocol(
                        "no identification line within preface limit".into(),
                    ));
                }
                return Ok(());
            }
        } else {
            self.inbound.extend_from_slice(bytes);
        }
        self.process_inbound()
    }

    /// Line mode: split on LF, strip an optional trailing CR, discard
    /// non-`SSH-` lines, adopt the first `SSH-` line as the server
    /// identification.
    fn consume_preface(&mut self) -> Result<(), SshError> {
        while let Some(newline) = self.preface.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.preface.drain(..=newline).collect();
            line.pop(); // LF
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8(line)
                .map_err(|_| SshError::Decode("identification line is not UTF-8"))?;
            if line.starts_with("SSH-") {
                if line.len() + 2 > MAX_IDENT_LINE {
                    return Err(SshError::Protocol(format!(
                        "server identification line of {} characters",
                        line.len()
                    )));
                }
                debug!(server = %line, "identification received");
                self.server_id_line = Some(line.clone());
                self.phase = SessionPhase::Negotiating;
                self.events
                    .push(SessionEvent::IdentificationReceived { line });
                self.send_client_kexinit()?;
                // Re-feed residual bytes into packet mode.
                let residual = std::mem::take(&mut self.preface);
                self.inbound.extend_from_slice(&residual);
                return Ok(());
            }
            if line.len() + 2 > MAX_IDENT_LINE && !self.config.guards.enable_dropbear_compat {
                return Err(SshError::Protocol("oversized preface line".into()));
            }
            debug!(banner = %line, "discarding preface line");
        }
        Ok(())
    }

    fn send_client_kexinit(&mut self) -> Result<(), SshError> {
        if self.client_kexinit.is_some() {
            return Ok(());
        }
        let payload = crate::negotiation::write_kexinit(
            &self.config.algorithms,
            self.config.entropy.as_mut(),
        );
        self.send_packet(&payload)?;
        self.client_kexinit = Some(payload);
        self.events.push(SessionEvent::KexInitSent);
        Ok(())
    }

    /// Packet mode: extract complete packets under the current inbound
    /// cipher state and dispatch them in order.
    fn process_inbound(&mut self) -> Result<(), SshError> {
        loop {
            if matches!(self.phase, SessionPhase::Closed | SessionPhase::Failed) {
                self.inbound.clear();
                return Ok(());
            }
            if self.inbound.len() < PACKET_LENGTH_LEN {
                return Ok(());
            }
            let packet_length = BigEndian::read_u32(&self.inbound[..PACKET_LENGTH_LEN]) as usize;
            if packet_length == 0 {
                return Err(SshError::Protocol("zero-length packet".into()));
            }
            if packet_length > self.config.guards.max_payload_bytes as usize {
                return Err(SshError::Protocol(format!(
                    "packet length {packet_length} exceeds the {} byte cap",
                    self.config.guards.max_payload_bytes
                )));
            }
            let total = if self.open.is_sealed() {
                PACKET_LENGTH_LEN + packet_length + GCM_TAG_LEN
            } else {
                PACKET_LENGTH_LEN + packet_length
            };
            if self.inbound.len() < total {
                return Ok(());
            }
            let wire: Vec<u8> = self.inbound.drain(..total).collect();
            let payload = match &mut self.open {
                DirectionState::Plain { .. } => {
                    let padding = wire[PACKET_LENGTH_LEN] as usize;
                    if padding < MIN_PADDING {
                        return Err(SshError::Protocol(format!("padding length {padding} < 4")));
                    }
                    if padding + 1 > packet_length {
                        return Err(SshError::Protocol("padding longer than packet".into()));
                    }
                    wire[PACKET_LENGTH_LEN + 1..PACKET_LENGTH_LEN + packet_length - padding]
                        .to_vec()
                }
                DirectionState::Aes128Gcm(gcm) => {
                    let provider = self.config.crypto.clone();
                    gcm.open(provider.as_ref(), &wire)?
                }
            };
            self.open.advance_sequence()?;
            self.dispatch(&payload)?;
        }
    }

    fn dispatch(&mut self, payload: &[u8]) -> Result<(), SshError> {
        let Some(&msg_type) = payload.first() else {
            return Err(SshError::Protocol("empty packet payload".into()));
        };
        trace!(msg_type, len = payload.len(), "inbound packet");

        if self.ignore_next_kex_packet && (30..=49).contains(&msg_type) {
            self.ignore_next_kex_packet = false;
            self.diagnostic(DiagnosticRecord::info(
                "guessed-kex-dropped",
                "dropped the server's mis-guessed first kex packet",
            ));
            return Ok(());
        }

        match msg_type {
            msg::KEXINIT => self.on_kexinit(payload),
            msg::KEX_ECDH_REPLY => self.on_kex_reply(payload),
            msg::NEWKEYS => self.on_newkeys(),
            msg::SERVICE_ACCEPT => self.on_service_accept(payload),
            msg::EXT_INFO => self.on_ext_info(payload),
            msg::USERAUTH_SUCCESS => {
                debug!("userauth success");
                self.auth = AuthProgress::Succeeded;
                self.events.push(SessionEvent::AuthSuccess);
                Ok(())
            }
            msg::USERAUTH_FAILURE => {
                let mut r = Reader::starting_at(payload, 1);
                let methods = r.read_name_list()?;
                let partial = r.read_bool()?;
                debug!(?methods, partial, "userauth failure");
                self.auth = AuthProgress::Failed;
                self.events
                    .push(SessionEvent::AuthFailure { methods, partial });
                Ok(())
            }
            msg::USERAUTH_BANNER => {
                let mut r = Reader::starting_at(payload, 1);
                let message = r.read_utf8()?.to_owned();
                self.events.push(SessionEvent::AuthBanner { message });
                Ok(())
            }
            msg::GLOBAL_REQUEST => self.on_global_request(payload),
            msg::REQUEST_SUCCESS | msg::REQUEST_FAILURE => {
                self.diagnostic(DiagnosticRecord::warning(
                    "unexpected-global-reply",
                    "global request reply without outstanding request",
                ));
                Ok(())
            }
            msg::CHANNEL_OPEN_CONFIRMATION => self.on_channel_open_confirmation(payload),
            msg::CHANNEL_OPEN_FAILURE => self.on_channel_open_failure(payload),
            msg::CHANNEL_WINDOW_ADJUST => self.on_channel_window_adjust(payload),
            msg::CHANNEL_DATA => self.on_channel_data(payload),
            msg::CHANNEL_EXTENDED_DATA => self.on_channel_extended_data(payload),
            msg::CHANNEL_EOF => self.on_channel_eof(payload),
            msg::CHANNEL_CLOSE => self.on_channel_close(payload),
            msg::CHANNEL_REQUEST => self.on_channel_request(payload),
            msg::CHANNEL_SUCCESS => self.on_channel_reply(payload, true),
            msg::CHANNEL_FAILURE => self.on_channel_reply(payload, false),
            msg::DISCONNECT => {
                let mut r = Reader::starting_at(payload, 1);
                let code = r.read_u32()?;
                let description = r.read_utf8()?.to_owned();
                let language = r.read_utf8().unwrap_or_default().to_owned();
                info!(code, description = %description, "server disconnected");
                self.events.push(SessionEvent::Disconnect {
                    code,
                    description,
                    language,
                });
                self.close(Some("server disconnect"));
                Ok(())
            }
            msg::IGNORE => Ok(()),
            msg::DEBUG => {
                let mut r = Reader::starting_at(payload, 1);
                let _always_display = r.read_bool()?;
                debug!(message = %r.read_utf8().unwrap_or(""), "peer debug message");
                Ok(())
            }
            msg::UNIMPLEMENTED => {
                let mut r = Reader::starting_at(payload, 1);
                let sequence = r.read_u32()?;
                self.diagnostic(DiagnosticRecord::warning(
                    "peer-unimplemented",
                    format!("peer reported packet {sequence} as unimplemented"),
                ));
                Ok(())
            }
            other => {
                self.diagnostic(DiagnosticRecord::warning(
                    "unhandled-message",
                    format!("unhandled message number {other}"),
                ));
                Ok(())
            }
        }
    }

    fn on_service_accept(&mut self, payload: &[u8]) -> Result<(), SshError> {
        let mut r = Reader::starting_at(payload, 1);
        let service = r.read_utf8()?;
        if service != crate::auth::USERAUTH_SERVICE {
            return Err(SshError::Protocol(format!(
                "unexpected service accept for {service:?}"
            )));
        }
        if self.auth != AuthProgress::ServiceRequested {
            return Err(SshError::Protocol("service accept without request".into()));
        }
        let (Some(identity), Some(session_id)) = (&self.config.identity, &self.session_id) else {
            return Err(SshError::Invariant("userauth without identity or session id"));
        };
        let payload = crate::auth::userauth_request_payload(session_id.as_ref(), identity);
        let identity = identity.clone();
        debug!(username = %identity.username, "sending publickey userauth request");
        self.send_packet(&payload)?;
        self.auth = AuthProgress::Requested;
        Ok(())
    }

    fn on_ext_info(&mut self, payload: &[u8]) -> Result<(), SshError> {
        let mut r = Reader::starting_at(payload, 1);
        let count = r.read_u32()?;
        for _ in 0..count {
            let name = r.read_utf8()?;
            let value = r.read_string()?;
            if name == "server-sig-algs" {
                let algs = std::str::from_utf8(value)
                    .map_err(|_| SshError::Decode("invalid server-sig-algs"))?
                    .split(',')
                    .map(|s| s.to_owned())
                    .collect::<Vec<_>>();
                debug!(?algs, "server signature algorithms");
                self.server_sig_algs = Some(algs);
            } else {
                debug!(extension = name, "ignoring extension");
            }
        }
        Ok(())
    }

    fn on_global_request(&mut self, payload: &[u8]) -> Result<(), SshError> {
        let mut r = Reader::starting_at(payload, 1);
        let name = r.read_utf8()?.to_owned();
        let want_reply = r.read_bool()?;
        let recognized = matches!(
            name.as_str(),
            "tcpip-forward" | "cancel-tcpip-forward" | "keepalive@openssh.com"
        );
        if recognized {
            self.events.push(SessionEvent::GlobalRequest {
                name: name.clone(),
                want_reply,
            });
        } else if want_reply {
            self.diagnostic(DiagnosticRecord::warning(
                "unhandled-global-request",
                format!("unhandled global request {name:?}"),
            ));
        } else {
            debug!(request = %name, "ignoring global request");
        }
        if want_reply {
            // We take no action for any of these as a client; a failure
            // reply satisfies keepalive probes either way.
            self.send_packet(&[msg::REQUEST_FAILURE])?;
        }
        Ok(())
    }

    pub(crate) fn client_id_line(&self) -> &str {
        &self.client_id_line
    }

    pub(crate) fn server_id_line(&self) -> Option<&str> {
        self.server_id_line.as_deref()
    }
}
