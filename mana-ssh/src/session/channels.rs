//! Channel bookkeeping and the user-intent surface (RFC 4254).

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use mana_common::DiagnosticRecord;

use super::events::SessionEvent;
use super::{AuthProgress, ClientSession, SessionPhase};
use crate::codec::{Encoding, Reader};
use crate::{msg, ChannelId, Disconnect, SshError};

/// User intents accepted by [`ClientSession::command`].
#[derive(Debug, Clone)]
pub enum Intent {
    OpenChannel {
        channel_type: String,
        initial_window_size: Option<u32>,
        max_packet_size: Option<u32>,
    },
    SendChannelData {
        id: ChannelId,
        data: Bytes,
    },
    AdjustWindow {
        id: ChannelId,
        delta: u32,
    },
    RequestChannel {
        id: ChannelId,
        request: ChannelRequest,
        want_reply: bool,
    },
    CloseChannel {
        id: ChannelId,
    },
    Disconnect {
        reason: Option<String>,
    },
}

/// Channel request kinds serialized per RFC 4254 §6.
#[derive(Debug, Clone)]
pub enum ChannelRequest {
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(u8, u32)>,
    },
    Shell,
    Exec {
        command: String,
    },
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Env {
        name: String,
        value: String,
    },
    Subsystem {
        name: String,
    },
    Signal {
        name: String,
    },
}

impl ChannelRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelRequest::Pty { .. } => "pty-req",
            ChannelRequest::Shell => "shell",
            ChannelRequest::Exec { .. } => "exec",
            ChannelRequest::WindowChange { .. } => "window-change",
            ChannelRequest::Env { .. } => "env",
            ChannelRequest::Subsystem { .. } => "subsystem",
            ChannelRequest::Signal { .. } => "signal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Opening,
    Open,
    Closing,
    Closed,
}

#[derive(Debug)]
pub(crate) struct Channel {
    pub local_id: ChannelId,
    pub remote_id: Option<u32>,
    pub status: ChannelStatus,
    pub inbound_window: u32,
    pub outbound_window: u32,
    pub max_inbound_packet: u32,
    pub max_outbound_packet: Option<u32>,
    pub remote_eof: bool,
    pub exit_status: Option<u32>,
    pub sent_close: bool,
    /// Names of requests awaiting a reply, strict FIFO.
    pub pending_requests: VecDeque<&'static str>,
}

#[derive(Debug, Clone)]
pub struct ChannelSnapshot {
    pub id: ChannelId,
    pub remote_id: Option<u32>,
    pub status: ChannelStatus,
    pub inbound_window: u32,
    pub outbound_window: u32,
    pub max_inbound_packet: u32,
    pub max_outbound_packet: Option<u32>,
    pub exit_status: Option<u32>,
}

#[derive(Debug, Default)]
pub(crate) struct ChannelTable {
    channels: BTreeMap<u32, Channel>,
    next_id: u32,
    exhausted: bool,
}

impl ChannelTable {
    pub fn allocate(
        &mut self,
        window: u32,
        max_inbound_packet: u32,
    ) -> Result<ChannelId, SshError> {
        if self.exhausted {
            return Err(SshError::Exhausted("channel identifiers"));
        }
        let id = ChannelId(self.next_id);
        match self.next_id.checked_add(1) {
            Some(next) => self.next_id = next,
            None => self.exhausted = true,
        }
        self.channels.insert(
            id.0,
            Channel {
                local_id: id,
                remote_id: None,
                status: ChannelStatus::Opening,
                inbound_window: window,
                outbound_window: 0,
                max_inbound_packet,
                max_outbound_packet: None,
                remote_eof: false,
                exit_status: None,
                sent_close: false,
                pending_requests: VecDeque::new(),
            },
        );
        Ok(id)
    }

    pub fn get(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id.0)
    }

    pub fn get_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.channels.get_mut(&id.0)
    }

    pub fn remove(&mut self, id: ChannelId) -> Option<Channel> {
        self.channels.remove(&id.0)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn snapshots(&self) -> Vec<ChannelSnapshot> {
        self.channels
            .values()
            .map(|c| ChannelSnapshot {
                id: c.local_id,
                remote_id: c.remote_id,
                status: c.status,
                inbound_window: c.inbound_window,
                outbound_window: c.outbound_window,
                max_inbound_packet: c.max_inbound_packet,
                max_outbound_packet: c.max_outbound_packet,
                exit_status: c.exit_status,
            })
            .collect()
    }
}

impl ClientSession {
    pub(super) fn handle_intent(&mut self, intent: Intent) -> Result<(), SshError> {
        match intent {
            Intent::OpenChannel {
                channel_type,
                initial_window_size,
                max_packet_size,
            } => self.open_channel(&channel_type, initial_window_size, max_packet_size),
            Intent::SendChannelData { id, data } => self.send_channel_data(id, &data),
            Intent::AdjustWindow { id, delta } => self.adjust_window(id, delta),
            Intent::RequestChannel {
                id,
                request,
                want_reply,
            } => self.request_channel(id, request, want_reply),
            Intent::CloseChannel { id } => self.close_channel(id),
            Intent::Disconnect { reason } => self.disconnect_intent(reason),
        }
    }

    fn require_authenticated(&self) -> Result<(), SshError> {
        if self.auth == AuthProgress::Succeeded {
            Ok(())
        } else {
            Err(SshError::NotAuthenticated)
        }
    }

    fn open_channel(
        &mut self,
        channel_type: &str,
        initial_window_size: Option<u32>,
        max_packet_size: Option<u32>,
    ) -> Result<(), SshError> {
        self.require_authenticated()?;
        if channel_type != "session" {
            return Err(SshError::NotImplemented("only session channels are supported"));
        }
        if !self.config.channels.allow.session {
            return Err(SshError::NotImplemented("session channels disabled"));
        }
        if let Some(max) = self.config.channels.max_concurrent {
            if self.channels.len() as u32 >= max {
                return Err(SshError::Invariant("channel limit reached"));
            }
        }
        let window = initial_window_size.unwrap_or(self.config.channels.initial_window_size);
        let max_packet = max_packet_size.unwrap_or(self.config.channels.max_packet_size);
        let id = self.channels.allocate(window, max_packet)?;

        let mut payload = Vec::new();
        payload.push(msg::CHANNEL_OPEN);
        payload.extend_ssh_string(b"session");
        payload.push_u32_be(id.0);
        payload.push_u32_be(window);
        payload.push_u32_be(max_packet);
        self.send_packet(&payload)?;
        debug!(channel = %id, window, max_packet, "channel open requested");
        Ok(())
    }

    fn send_channel_data(&mut self, id: ChannelId, data: &[u8]) -> Result<(), SshError> {
        let channel = self.channels.get(id).ok_or(SshError::ChannelNotOpen)?;
        if channel.status != ChannelStatus::Open {
            return Err(SshError::ChannelNotOpen);
        }
        let len = data.len() as u64;
        if len > u64::from(channel.outbound_window) {
            return Err(SshError::Invariant("data exceeds outbound window"));
        }
        if let Some(max) = channel.max_outbound_packet {
            if len > u64::from(max) {
                return Err(SshError::Invariant("data exceeds peer maximum packet size"));
            }
        }
        let remote_id = channel
            .remote_id
            .ok_or(SshError::Invariant("open channel without remote id"))?;

        let mut payload = Vec::with_capacity(9 + data.len());
        payload.push(msg::CHANNEL_DATA);
        payload.push_u32_be(remote_id);
        payload.extend_ssh_string(data);
        self.send_packet(&payload)?;

        let channel = self
            .channels
            .get_mut(id)
            .ok_or(SshError::ChannelNotOpen)?;
        channel.outbound_window -= data.len() as u32;
        Ok(())
    }

    fn adjust_window(&mut self, id: ChannelId, delta: u32) -> Result<(), SshError> {
        if delta == 0 {
            return Err(SshError::Invariant("window adjustment must be positive"));
        }
        let channel = self.channels.get(id).ok_or(SshError::ChannelNotOpen)?;
        let remote_id = channel.remote_id.ok_or(SshError::ChannelNotOpen)?;

        let mut payload = Vec::new();
        payload.push(msg::CHANNEL_WINDOW_ADJUST);
        payload.push_u32_be(remote_id);
        payload.push_u32_be(delta);
        self.send_packet(&payload)?;

        let channel = self
            .channels
            .get_mut(id)
            .ok_or(SshError::ChannelNotOpen)?;
        channel.inbound_window = channel.inbound_window.saturating_add(delta);
        Ok(())
    }

    fn request_channel(
        &mut self,
        id: ChannelId,
        request: ChannelRequest,
        want_reply: bool,
    ) -> Result<(), SshError> {
        match &request {
            ChannelRequest::Exec { .. } if !self.config.channels.allow.exec => {
                return Err(SshError::NotImplemented("exec requests disabled"));
            }
            ChannelRequest::Subsystem { .. } if !self.config.channels.allow.subsystem => {
                return Err(SshError::NotImplemented("subsystem requests disabled"));
            }
            _ => {}
        }
        let channel = self.channels.get(id).ok_or(SshError::ChannelNotOpen)?;
        let remote_id = channel.remote_id.ok_or(SshError::ChannelNotOpen)?;
        // window-change never takes a reply (RFC 4254 §6.7).
        let want_reply = want_reply && !matches!(request, ChannelRequest::WindowChange { .. });

        let mut payload = Vec::new();
        payload.push(msg::CHANNEL_REQUEST);
        payload.push_u32_be(remote_id);
        payload.extend_ssh_string(request.name().as_bytes());
        payload.push_bool(want_reply);
        match &request {
            ChannelRequest::Pty {
                term,
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes,
            } => {
                payload.extend_ssh_string(term.as_bytes());
                payload.push_u32_be(*col_width);
                payload.push_u32_be(*row_height);
                payload.push_u32_be(*pix_width);
                payload.push_u32_be(*pix_height);
                payload.push_u32_be((1 + 5 * modes.len()) as u32);
                for &(code, value) in modes {
                    payload.push(code);
                    payload.push_u32_be(value);
                }
                payload.push(0); // TTY_OP_END
            }
            ChannelRequest::Shell => {}
            ChannelRequest::Exec { command } => {
                payload.extend_ssh_string(command.as_bytes());
            }
            ChannelRequest::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            } => {
                payload.push_u32_be(*col_width);
                payload.push_u32_be(*row_height);
                payload.push_u32_be(*pix_width);
                payload.push_u32_be(*pix_height);
            }
            ChannelRequest::Env { name, value } => {
                payload.extend_ssh_string(name.as_bytes());
                payload.extend_ssh_string(value.as_bytes());
            }
            ChannelRequest::Subsystem { name } => {
                payload.extend_ssh_string(name.as_bytes());
            }
            ChannelRequest::Signal { name } => {
                payload.extend_ssh_string(name.as_bytes());
            }
        }
        self.send_packet(&payload)?;

        if want_reply {
            let channel = self
                .channels
                .get_mut(id)
                .ok_or(SshError::ChannelNotOpen)?;
            channel.pending_requests.push_back(request.name());
        }
        Ok(())
    }

    fn close_channel(&mut self, id: ChannelId) -> Result<(), SshError> {
        let channel = self.channels.get_mut(id).ok_or(SshError::ChannelNotOpen)?;
        if channel.sent_close {
            return Ok(());
        }
        let remote_id = channel.remote_id.ok_or(SshError::ChannelNotOpen)?;
        channel.sent_close = true;
        if matches!(channel.status, ChannelStatus::Opening | ChannelStatus::Open) {
            channel.status = ChannelStatus::Closing;
        }
        let mut payload = Vec::new();
        payload.push(msg::CHANNEL_CLOSE);
        payload.push_u32_be(remote_id);
        self.send_packet(&payload)
    }

    fn disconnect_intent(&mut self, reason: Option<String>) -> Result<(), SshError> {
        let description = reason.unwrap_or_default();
        let mut payload = Vec::new();
        payload.push(msg::DISCONNECT);
        payload.push_u32_be(Disconnect::ByApplication as u32);
        payload.extend_ssh_string(description.as_bytes());
        payload.extend_ssh_string(b"");
        self.send_packet(&payload)?;
        self.close(None);
        Ok(())
    }

    // ---- inbound channel packets -------------------------------------

    pub(super) fn on_channel_open_confirmation(&mut self, payload: &[u8]) -> Result<(), SshError> {
        let mut r = Reader::starting_at(payload, 1);
        let id = ChannelId(r.read_u32()?);
        let remote_id = r.read_u32()?;
        let window = r.read_u32()?;
        let max_packet = r.read_u32()?;

        let channel = self
            .channels
            .get_mut(id)
            .ok_or_else(|| SshError::Protocol("confirmation for unknown channel".into()))?;
        channel.remote_id = Some(remote_id);
        channel.outbound_window = window;
        channel.max_outbound_packet = Some(max_packet);
        channel.status = if channel.remote_eof {
            ChannelStatus::Closing
        } else {
            ChannelStatus::Open
        };
        debug!(channel = %id, remote_id, window, max_packet, "channel open");
        self.events.push(SessionEvent::ChannelOpen {
            id,
            remote_id,
            window_size: window,
            max_packet_size: max_packet,
        });
        if self.phase == SessionPhase::Authenticated {
            self.phase = SessionPhase::Connected;
        }
        Ok(())
    }

    pub(super) fn on_channel_open_failure(&mut self, payload: &[u8]) -> Result<(), SshError> {
        let mut r = Reader::starting_at(payload, 1);
        let id = ChannelId(r.read_u32()?);
        let reason = r.read_u32()?;
        let description = r.read_utf8()?.to_owned();
        self.channels.remove(id);
        self.diagnostic(
            DiagnosticRecord::warning("channel-open-failure", description)
                .with_detail(format!("channel {id} reason {reason}")),
        );
        Ok(())
    }

    pub(super) fn on_channel_data(&mut self, payload: &[u8]) -> Result<(), SshError> {
        let mut r = Reader::starting_at(payload, 1);
        let id = ChannelId(r.read_u32()?);
        let data = r.read_string()?;
        let Some(channel) = self.channels.get_mut(id) else {
            self.diagnostic(DiagnosticRecord::warning(
                "unknown-channel",
                format!("data for unknown channel {id}"),
            ));
            return Ok(());
        };
        channel.inbound_window = channel.inbound_window.saturating_sub(data.len() as u32);
        let data = Bytes::copy_from_slice(data);
        self.events.push(SessionEvent::ChannelData { id, data });
        Ok(())
    }

    /// Extended data is window-accounted but deliberately not surfaced;
    /// stderr mapping is re-enabled here when needed.
    pub(super) fn on_channel_extended_data(&mut self, payload: &[u8]) -> Result<(), SshError> {
        let mut r = Reader::starting_at(payload, 1);
        let id = ChannelId(r.read_u32()?);
        let ext = r.read_u32()?;
        let data = r.read_string()?;
        if let Some(channel) = self.channels.get_mut(id) {
            channel.inbound_window = channel.inbound_window.saturating_sub(data.len() as u32);
        }
        self.diagnostic(
            DiagnosticRecord::warning(
                "extended-data",
                format!("discarded {} extended-data bytes (stream {ext})", data.len()),
            )
            .with_detail(format!("channel {id}")),
        );
        Ok(())
    }

    pub(super) fn on_channel_window_adjust(&mut self, payload: &[u8]) -> Result<(), SshError> {
        let mut r = Reader::starting_at(payload, 1);
        let id = ChannelId(r.read_u32()?);
        let delta = r.read_u32()?;
        let Some(channel) = self.channels.get_mut(id) else {
            return Err(SshError::Protocol("window adjust for unknown channel".into()));
        };
        channel.outbound_window = channel.outbound_window.saturating_add(delta);
        let new_size = channel.outbound_window;
        self.events
            .push(SessionEvent::ChannelWindowAdjust { id, new_size });
        Ok(())
    }

    pub(super) fn on_channel_eof(&mut self, payload: &[u8]) -> Result<(), SshError> {
        let mut r = Reader::starting_at(payload, 1);
        let id = ChannelId(r.read_u32()?);
        if let Some(channel) = self.channels.get_mut(id) {
            channel.remote_eof = true;
            if channel.status == ChannelStatus::Open {
                channel.status = ChannelStatus::Closing;
            }
        }
        self.events.push(SessionEvent::ChannelEof { id });
        Ok(())
    }

    pub(super) fn on_channel_close(&mut self, payload: &[u8]) -> Result<(), SshError> {
        let mut r = Reader::starting_at(payload, 1);
        let id = ChannelId(r.read_u32()?);
        let mut exit_status = None;
        let mut reply = None;
        if let Some(channel) = self.channels.get_mut(id) {
            if !channel.sent_close {
                channel.sent_close = true;
                reply = channel.remote_id;
            }
            channel.status = ChannelStatus::Closed;
            exit_status = channel.exit_status;
        }
        if let Some(remote_id) = reply {
            let mut payload = Vec::new();
            payload.push(msg::CHANNEL_CLOSE);
            payload.push_u32_be(remote_id);
            self.send_packet(&payload)?;
        }
        self.events
            .push(SessionEvent::ChannelClose { id, exit_status });
        Ok(())
    }

    pub(super) fn on_channel_request(&mut self, payload: &[u8]) -> Result<(), SshError> {
        let mut r = Reader::starting_at(payload, 1);
        let id = ChannelId(r.read_u32()?);
        let kind = r.read_utf8()?.to_owned();
        let want_reply = r.read_bool()?;
        match kind.as_str() {
            "exit-status" => {
                let status = r.read_u32()?;
                if let Some(channel) = self.channels.get_mut(id) {
                    channel.exit_status = Some(status);
                }
                self.events
                    .push(SessionEvent::ChannelExitStatus { id, status });
            }
            "exit-signal" => {
                let signal = r.read_utf8()?.to_owned();
                let core_dumped = r.read_bool()?;
                let message = r.read_utf8()?.to_owned();
                let language = r.read_utf8()?.to_owned();
                self.events.push(SessionEvent::ChannelExitSignal {
                    id,
                    signal,
                    core_dumped,
                    message,
                    language,
                });
            }
            other => {
                debug!(channel = %id, request = other, "unhandled channel request");
                if want_reply {
                    if let Some(remote_id) = self.channels.get(id).and_then(|c| c.remote_id) {
                        let mut payload = Vec::new();
                        payload.push(msg::CHANNEL_FAILURE);
                        payload.push_u32_be(remote_id);
                        self.send_packet(&payload)?;
                    }
                }
            }
        }
        Ok(())
    }

    pub(super) fn on_channel_reply(&mut self, payload: &[u8], success: bool) -> Result<(), SshError> {
        let mut r = Reader::starting_at(payload, 1);
        let id = ChannelId(r.read_u32()?);
        let Some(channel) = self.channels.get_mut(id) else {
            self.diagnostic(DiagnosticRecord::warning(
                "unknown-channel",
                format!("request reply for unknown channel {id}"),
            ));
            return Ok(());
        };
        match channel.pending_requests.pop_front() {
            Some(request) => {
                self.events.push(SessionEvent::ChannelRequestOutcome {
                    id,
                    request: request.to_owned(),
                    success,
                });
            }
            None => {
                self.diagnostic(DiagnosticRecord::warning(
                    "unexpected-channel-reply",
                    format!("reply without pending request on channel {id}"),
                ));
            }
        }
        Ok(())
    }
}
