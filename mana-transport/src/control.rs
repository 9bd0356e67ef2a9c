//! Control frame payloads: one opcode byte followed by a CBOR map with
//! text-string keys (RFC 8949).

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::TransportError;

pub const OP_HELLO: u8 = 0x01;
pub const OP_HEARTBEAT: u8 = 0x02;
pub const OP_RESUME_TICKET: u8 = 0x03;
pub const OP_CLOSE_HINT: u8 = 0x04;
pub const OP_ERROR_REPORT: u8 = 0x05;
pub const OP_FLOW: u8 = 0x06;

/// Close code used when the peer offers a different framed codec.
pub const CLOSE_CODE_CODEC_MISMATCH: u16 = 4600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub codec: String,
    pub session: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub seq: u64,
    /// `false` for a probe, `true` for its acknowledgement.
    pub reply: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeTicket {
    pub token: String,
    pub ttl_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseHint {
    pub code: u16,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Credit grant for one logical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowGrant {
    pub id: u32,
    pub credit: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Hello(Hello),
    Heartbeat(Heartbeat),
    ResumeTicket(ResumeTicket),
    CloseHint(CloseHint),
    ErrorReport(ErrorReport),
    Flow(FlowGrant),
}

impl ControlMessage {
    pub fn opcode(&self) -> u8 {
        match self {
            ControlMessage::Hello(_) => OP_HELLO,
            ControlMessage::Heartbeat(_) => OP_HEARTBEAT,
            ControlMessage::ResumeTicket(_) => OP_RESUME_TICKET,
            ControlMessage::CloseHint(_) => OP_CLOSE_HINT,
            ControlMessage::ErrorReport(_) => OP_ERROR_REPORT,
            ControlMessage::Flow(_) => OP_FLOW,
        }
    }
}

fn cbor<T: Serialize>(opcode: u8, value: &T) -> Result<Bytes, TransportError> {
    let mut payload = vec![opcode];
    ciborium::into_writer(value, &mut payload)
        .map_err(|e| TransportError::Control(e.to_string()))?;
    Ok(Bytes::from(payload))
}

pub fn encode_control(message: &ControlMessage) -> Result<Bytes, TransportError> {
    match message {
        ControlMessage::Hello(body) => cbor(OP_HELLO, body),
        ControlMessage::Heartbeat(body) => cbor(OP_HEARTBEAT, body),
        ControlMessage::ResumeTicket(body) => cbor(OP_RESUME_TICKET, body),
        ControlMessage::CloseHint(body) => cbor(OP_CLOSE_HINT, body),
        ControlMessage::ErrorReport(body) => cbor(OP_ERROR_REPORT, body),
        ControlMessage::Flow(body) => cbor(OP_FLOW, body),
    }
}

pub fn decode_control(payload: &[u8]) -> Result<ControlMessage, TransportError> {
    let (&opcode, body) = payload
        .split_first()
        .ok_or_else(|| TransportError::Control("empty control payload".into()))?;
    fn read<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, TransportError> {
        ciborium::from_reader(body).map_err(|e| TransportError::Control(e.to_string()))
    }
    match opcode {
        OP_HELLO => Ok(ControlMessage::Hello(read(body)?)),
        OP_HEARTBEAT => Ok(ControlMessage::Heartbeat(read(body)?)),
        OP_RESUME_TICKET => Ok(ControlMessage::ResumeTicket(read(body)?)),
        OP_CLOSE_HINT => Ok(ControlMessage::CloseHint(read(body)?)),
        OP_ERROR_REPORT => Ok(ControlMessage::ErrorReport(read(body)?)),
        OP_FLOW => Ok(ControlMessage::Flow(read(body)?)),
        other => Err(TransportError::Protocol(format!(
            "unknown control opcode {other:#x}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: ControlMessage) {
        let wire = encode_control(&message).unwrap();
        assert_eq!(wire[0], message.opcode());
        assert_eq!(decode_control(&wire).unwrap(), message);
    }

    #[test]
    fn hello_round_trip() {
        round_trip(ControlMessage::Hello(Hello {
            codec: crate::SUBPROTOCOL.into(),
            session: "sess-1".into(),
            capabilities: Some(vec!["resume".into()]),
            resume_token: None,
        }));
    }

    #[test]
    fn heartbeat_round_trip() {
        round_trip(ControlMessage::Heartbeat(Heartbeat {
            seq: 42,
            reply: true,
        }));
    }

    #[test]
    fn resume_ticket_round_trip() {
        round_trip(ControlMessage::ResumeTicket(ResumeTicket {
            token: "opaque".into(),
            ttl_ms: 60_000,
        }));
    }

    #[test]
    fn close_hint_round_trip() {
        round_trip(ControlMessage::CloseHint(CloseHint {
            code: CLOSE_CODE_CODEC_MISMATCH,
            reason: "codec-mismatch".into(),
        }));
    }

    #[test]
    fn error_report_round_trip() {
        round_trip(ControlMessage::ErrorReport(ErrorReport {
            code: "protocol-error".into(),
            message: "sequence gap".into(),
            detail: Some("expected 4, got 6".into()),
        }));
    }

    #[test]
    fn flow_round_trip() {
        round_trip(ControlMessage::Flow(FlowGrant {
            id: 3,
            credit: 16384,
        }));
    }

    #[test]
    fn unknown_opcode_rejected() {
        assert!(matches!(
            decode_control(&[0x7f, 0xa0]),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn empty_payload_rejected() {
        assert!(matches!(
            decode_control(&[]),
            Err(TransportError::Control(_))
        ));
    }

    #[test]
    fn keys_are_text_strings() {
        // A CBOR map with text keys starts with a map major type and the
        // first key is a text string (major type 3).
        let wire = encode_control(&ControlMessage::Heartbeat(Heartbeat {
            seq: 1,
            reply: false,
        }))
        .unwrap();
        let map_header = wire[1];
        assert_eq!(map_header >> 5, 5, "body must be a CBOR map");
        let first_key = wire[2];
        assert_eq!(first_key >> 5, 3, "keys must be text strings");
    }
}
