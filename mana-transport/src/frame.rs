//! The `mana.v1` frame envelope.
//!
//! 14-byte big-endian header:
//! `magic(u16 0x6d61) ‖ version(u8, major:4|minor:4) ‖ type(u8) ‖
//! flags(u8) ‖ reserved(u8) ‖ length(u32) ‖ sequence(u32)`, followed by
//! `length` payload bytes.

use byteorder::{BigEndian, ByteOrder};
use bytes::{Bytes, BytesMut};

use crate::TransportError;

pub const MAGIC: u16 = 0x6d61;
pub const VERSION: u8 = 0x10;
pub const HEADER_LEN: usize = 14;
/// Per-frame payload cap; larger payloads are fragmented.
pub const MAX_PAYLOAD: usize = 1 << 20;

pub const FLAG_FIN: u8 = 0x01;
pub const FLAG_CHECKPOINT: u8 = 0x02;
const FLAG_RESERVED: u8 = !(FLAG_FIN | FLAG_CHECKPOINT);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data = 0x00,
    Control = 0x01,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub fin: bool,
    pub checkpoint: bool,
    pub sequence: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn data(sequence: u32, payload: Bytes) -> Self {
        Frame {
            kind: FrameKind::Data,
            fin: true,
            checkpoint: false,
            sequence,
            payload,
        }
    }

    pub fn control(sequence: u32, payload: Bytes) -> Self {
        Frame {
            kind: FrameKind::Control,
            fin: true,
            checkpoint: false,
            sequence,
            payload,
        }
    }
}

pub fn encode_frame(frame: &Frame) -> Result<Bytes, TransportError> {
    if frame.payload.len() > MAX_PAYLOAD {
        return Err(TransportError::Protocol(format!(
            "frame payload of {} bytes exceeds the 1 MiB cap",
            frame.payload.len()
        )));
    }
    let mut wire = BytesMut::with_capacity(HEADER_LEN + frame.payload.len());
    wire.resize(HEADER_LEN, 0);
    BigEndian::write_u16(&mut wire[0..2], MAGIC);
    wire[2] = VERSION;
    wire[3] = frame.kind as u8;
    wire[4] = (frame.fin as u8 * FLAG_FIN) | (frame.checkpoint as u8 * FLAG_CHECKPOINT);
    wire[5] = 0;
    BigEndian::write_u32(&mut wire[6..10], frame.payload.len() as u32);
    BigEndian::write_u32(&mut wire[10..14], frame.sequence);
    wire.extend_from_slice(&frame.payload);
    Ok(wire.freeze())
}

/// Incremental decoder over a byte-stream carrier. Header violations are
/// fatal; a partially buffered frame just waits for more bytes.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = &self.buffer[..HEADER_LEN];
        if BigEndian::read_u16(&header[0..2]) != MAGIC {
            return Err(TransportError::Protocol("bad frame magic".into()));
        }
        if header[2] >> 4 != VERSION >> 4 {
            return Err(TransportError::Protocol(format!(
                "unknown major version {:#x}",
                header[2]
            )));
        }
        let kind = match header[3] {
            0x00 => FrameKind::Data,
            0x01 => FrameKind::Control,
            other => {
                return Err(TransportError::Protocol(format!(
                    "unknown frame type {other:#x}"
                )));
            }
        };
        let flags = header[4];
        if flags & FLAG_RESERVED != 0 {
            return Err(TransportError::Protocol(format!(
                "reserved flag bits set: {flags:#x}"
            )));
        }
        if header[5] != 0 {
            return Err(TransportError::Protocol("reserved header byte set".into()));
        }
        let length = BigEndian::read_u32(&header[6..10]) as usize;
        if length > MAX_PAYLOAD {
            return Err(TransportError::Protocol(format!(
                "frame length {length} exceeds the 1 MiB cap"
            )));
        }
        if self.buffer.len() < HEADER_LEN + length {
            return Ok(None);
        }
        let sequence = BigEndian::read_u32(&header[10..14]);
        let _ = self.buffer.split_to(HEADER_LEN);
        let payload = self.buffer.split_to(length).freeze();
        Ok(Some(Frame {
            kind,
            fin: flags & FLAG_FIN != 0,
            checkpoint: flags & FLAG_CHECKPOINT != 0,
            sequence,
            payload,
        }))
    }
}

/// Split a payload into maximal frames: every fragment but the last has
/// FIN=0. Sequence numbers are drawn from `next_sequence`; wrap-around is
/// fatal.
pub fn fragment(
    kind: FrameKind,
    payload: Bytes,
    next_sequence: &mut u32,
) -> Result<Vec<Frame>, TransportError> {
    let mut frames = Vec::new();
    let mut rest = payload;
    loop {
        let take = rest.len().min(MAX_PAYLOAD);
        let chunk = rest.split_to(take);
        let fin = rest.is_empty();
        frames.push(Frame {
            kind,
            fin,
            checkpoint: false,
            sequence: allocate_sequence(next_sequence)?,
            payload: chunk,
        });
        if fin {
            return Ok(frames);
        }
    }
}

pub fn allocate_sequence(next_sequence: &mut u32) -> Result<u32, TransportError> {
    let sequence = *next_sequence;
    *next_sequence = next_sequence
        .checked_add(1)
        .ok_or_else(|| TransportError::Protocol("outbound sequence wrapped".into()))?;
    Ok(sequence)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) -> Frame {
        let wire = encode_frame(&frame).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.push(&wire);
        let decoded = decoder.next_frame().unwrap().unwrap();
        assert!(decoder.next_frame().unwrap().is_none());
        decoded
    }

    #[test]
    fn data_frame_round_trip() {
        let frame = Frame::data(7, Bytes::from_static(b"ssh bytes"));
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn control_frame_round_trip() {
        let frame = Frame {
            kind: FrameKind::Control,
            fin: true,
            checkpoint: true,
            sequence: 0,
            payload: Bytes::from_static(&[0x01, 0xa0]),
        };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn empty_payload_round_trip() {
        let frame = Frame::data(0, Bytes::new());
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn partial_header_waits() {
        let wire = encode_frame(&Frame::data(1, Bytes::from_static(b"abc"))).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.push(&wire[..5]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.push(&wire[5..]);
        assert!(decoder.next_frame().unwrap().is_some());
    }

    #[test]
    fn bad_magic_is_fatal() {
        let mut wire = encode_frame(&Frame::data(0, Bytes::new())).unwrap().to_vec();
        wire[0] = 0x00;
        let mut decoder = FrameDecoder::new();
        decoder.push(&wire);
        assert!(matches!(
            decoder.next_frame(),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn unknown_major_version_is_fatal() {
        let mut wire = encode_frame(&Frame::data(0, Bytes::new())).unwrap().to_vec();
        wire[2] = 0x20;
        let mut decoder = FrameDecoder::new();
        decoder.push(&wire);
        assert!(decoder.next_frame().is_err());
    }

    #[test]
    fn minor_version_is_tolerated() {
        let mut wire = encode_frame(&Frame::data(0, Bytes::new())).unwrap().to_vec();
        wire[2] = 0x11;
        let mut decoder = FrameDecoder::new();
        decoder.push(&wire);
        assert!(decoder.next_frame().unwrap().is_some());
    }

    #[test]
    fn reserved_flag_bits_are_fatal() {
        let mut wire = encode_frame(&Frame::data(0, Bytes::new())).unwrap().to_vec();
        wire[4] |= 0x80;
        let mut decoder = FrameDecoder::new();
        decoder.push(&wire);
        assert!(decoder.next_frame().is_err());
    }

    #[test]
    fn reserved_byte_is_fatal() {
        let mut wire = encode_frame(&Frame::data(0, Bytes::new())).unwrap().to_vec();
        wire[5] = 1;
        let mut decoder = FrameDecoder::new();
        decoder.push(&wire);
        assert!(decoder.next_frame().is_err());
    }

    #[test]
    fn oversize_length_is_fatal() {
        let mut wire = encode_frame(&Frame::data(0, Bytes::new())).unwrap().to_vec();
        BigEndian::write_u32(&mut wire[6..10], (MAX_PAYLOAD + 1) as u32);
        let mut decoder = FrameDecoder::new();
        decoder.push(&wire);
        assert!(decoder.next_frame().is_err());
    }

    #[test]
    fn fragmentation_splits_and_finishes() {
        let mut seq = 0u32;
        let payload = Bytes::from(vec![0xaa; MAX_PAYLOAD * 2 + 10]);
        let frames = fragment(FrameKind::Data, payload, &mut seq).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(!frames[0].fin);
        assert!(!frames[1].fin);
        assert!(frames[2].fin);
        assert_eq!(frames[2].payload.len(), 10);
        assert_eq!(
            frames.iter().map(|f| f.sequence).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(seq, 3);
    }

    #[test]
    fn sequence_wrap_is_fatal() {
        let mut seq = u32::MAX;
        assert!(allocate_sequence(&mut seq).is_err());
    }

    #[test]
    fn coalesced_frames_decode_in_order() {
        let a = encode_frame(&Frame::data(0, Bytes::from_static(b"one"))).unwrap();
        let b = encode_frame(&Frame::data(1, Bytes::from_static(b"two"))).unwrap();
        let mut decoder = FrameDecoder::new();
        let mut joined = a.to_vec();
        joined.extend_from_slice(&b);
        decoder.push(&joined);
        assert_eq!(decoder.next_frame().unwrap().unwrap().payload, "one");
        assert_eq!(decoder.next_frame().unwrap().unwrap().payload, "two");
        assert!(decoder.next_frame().unwrap().is_none());
    }
}
