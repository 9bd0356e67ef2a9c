//! SSH wire encoding: big-endian integers, length-prefixed strings, name
//! lists (RFC 4251 §5) and multi-precision integers.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::SshError;

/// A cursor-like type to read SSH-encoded values.
#[derive(Debug, Clone, Copy)]
pub struct Reader<'a> {
    s: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    pub fn new(s: &'a [u8]) -> Self {
        Reader { s, position: 0 }
    }

    pub fn starting_at(s: &'a [u8], position: usize) -> Self {
        Reader { s, position }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.s.len() - self.position
    }

    pub fn read_byte(&mut self) -> Result<u8, SshError> {
        if self.position + 1 <= self.s.len() {
            let u = self.s[self.position];
            self.position += 1;
            Ok(u)
        } else {
            Err(SshError::Decode("u8 past end of buffer"))
        }
    }

    pub fn read_u32(&mut self) -> Result<u32, SshError> {
        if self.position + 4 <= self.s.len() {
            let u = BigEndian::read_u32(&self.s[self.position..]);
            self.position += 4;
            Ok(u)
        } else {
            Err(SshError::Decode("u32 past end of buffer"))
        }
    }

    pub fn read_u64(&mut self) -> Result<u64, SshError> {
        if self.position + 8 <= self.s.len() {
            let u = BigEndian::read_u64(&self.s[self.position..]);
            self.position += 8;
            Ok(u)
        } else {
            Err(SshError::Decode("u64 past end of buffer"))
        }
    }

    pub fn read_bool(&mut self) -> Result<bool, SshError> {
        Ok(self.read_byte()? != 0)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], SshError> {
        if self.position + len <= self.s.len() {
            let result = &self.s[self.position..(self.position + len)];
            self.position += len;
            Ok(result)
        } else {
            Err(SshError::Decode("byte run past end of buffer"))
        }
    }

    /// Read one length-prefixed string as raw bytes.
    pub fn read_string(&mut self) -> Result<&'a [u8], SshError> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
            .map_err(|_| SshError::Decode("string body past end of buffer"))
    }

    /// Read one length-prefixed string and validate it as UTF-8.
    pub fn read_utf8(&mut self) -> Result<&'a str, SshError> {
        std::str::from_utf8(self.read_string()?).map_err(|_| SshError::Decode("invalid UTF-8"))
    }

    /// Read a comma-separated name list, deduplicated in order.
    pub fn read_name_list(&mut self) -> Result<Vec<String>, SshError> {
        let raw = self.read_utf8()?;
        if raw.is_empty() {
            return Ok(vec![]);
        }
        if !raw.is_ascii() {
            return Err(SshError::Decode("non-ASCII name list"));
        }
        let mut names: Vec<String> = Vec::new();
        for name in raw.split(',') {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_owned());
            }
        }
        Ok(names)
    }

    /// Read an mpint (RFC 4251 §5) as its unsigned big-endian magnitude
    /// with leading zeros stripped. Negative values never appear in this
    /// protocol subset and are rejected.
    pub fn read_mpint(&mut self) -> Result<&'a [u8], SshError> {
        let body = self.read_string()?;
        if let Some(&first) = body.first() {
            if first & 0x80 != 0 {
                return Err(SshError::Decode("negative mpint"));
            }
        }
        let mut i = 0;
        while i < body.len() && body[i] == 0 {
            i += 1;
        }
        Ok(&body[i..])
    }

    pub fn read_remaining(&mut self) -> &'a [u8] {
        let rest = &self.s[self.position..];
        self.position = self.s.len();
        rest
    }

    pub fn skip(&mut self, len: usize) -> Result<(), SshError> {
        self.read_bytes(len).map(|_| ())
    }

    pub fn peek(&self, len: usize) -> Result<&'a [u8], SshError> {
        if self.position + len <= self.s.len() {
            Ok(&self.s[self.position..self.position + len])
        } else {
            Err(SshError::Decode("peek past end of buffer"))
        }
    }
}

#[doc(hidden)]
pub trait Bytes {
    fn bytes(&self) -> &[u8];
}

impl<A: AsRef<str>> Bytes for A {
    fn bytes(&self) -> &[u8] {
        self.as_ref().as_bytes()
    }
}

/// Encode in the SSH format.
pub trait Encoding {
    /// Push a big-endian `u32`.
    fn push_u32_be(&mut self, v: u32);
    /// Push a big-endian `u64`.
    fn push_u64_be(&mut self, v: u64);
    /// Push a boolean as a single byte.
    fn push_bool(&mut self, v: bool);
    /// Push an SSH-encoded string.
    fn extend_ssh_string(&mut self, s: &[u8]);
    /// Push an SSH-encoded multiple-precision integer from an unsigned
    /// big-endian magnitude.
    fn extend_ssh_mpint(&mut self, s: &[u8]);
    /// Push an SSH-encoded comma-separated list.
    fn extend_list<A: Bytes, I: Iterator<Item = A>>(&mut self, list: I);
    /// Push an SSH-encoded empty list.
    fn write_empty_list(&mut self);
}

impl Encoding for Vec<u8> {
    fn push_u32_be(&mut self, v: u32) {
        self.write_u32::<BigEndian>(v).unwrap();
    }

    fn push_u64_be(&mut self, v: u64) {
        self.write_u64::<BigEndian>(v).unwrap();
    }

    fn push_bool(&mut self, v: bool) {
        self.push(v as u8);
    }

    fn extend_ssh_string(&mut self, s: &[u8]) {
        self.push_u32_be(s.len() as u32);
        self.extend_from_slice(s);
    }

    fn extend_ssh_mpint(&mut self, s: &[u8]) {
        // Skip initial zeros.
        let mut i = 0;
        while i < s.len() && s[i] == 0 {
            i += 1;
        }
        if i == s.len() {
            // Zero encodes as the empty string.
            self.push_u32_be(0);
            return;
        }
        // If the high bit is set, prepend a zero byte to keep the value
        // positive.
        if s[i] & 0x80 != 0 {
            self.push_u32_be((s.len() - i + 1) as u32);
            self.push(0);
        } else {
            self.push_u32_be((s.len() - i) as u32);
        }
        self.extend_from_slice(&s[i..]);
    }

    fn extend_list<A: Bytes, I: Iterator<Item = A>>(&mut self, list: I) {
        let len0 = self.len();
        self.extend_from_slice(&[0, 0, 0, 0]);
        let mut first = true;
        for i in list {
            if !first {
                self.push(b',');
            } else {
                first = false;
            }
            self.extend_from_slice(i.bytes());
        }
        let len = (self.len() - len0 - 4) as u32;
        BigEndian::write_u32(&mut self[len0..], len);
    }

    fn write_empty_list(&mut self) {
        self.extend_from_slice(&[0, 0, 0, 0]);
    }
}

/// Encoded length of the given mpint magnitude, including the length
/// prefix.
pub fn mpint_len(s: &[u8]) -> usize {
    let mut i = 0;
    while i < s.len() && s[i] == 0 {
        i += 1;
    }
    if i == s.len() {
        return 4;
    }
    (if s[i] & 0x80 != 0 { 5 } else { 4 }) + s.len() - i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u32_and_u64_round_trip() {
        let mut buf = Vec::new();
        buf.push_u32_be(0xdeadbeef);
        buf.push_u64_be(0x0102030405060708);
        let mut r = Reader::new(&buf);
        assert_eq!(r.read_u32().unwrap(), 0xdeadbeef);
        assert_eq!(r.read_u64().unwrap(), 0x0102030405060708);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn bool_round_trip() {
        let mut buf = Vec::new();
        buf.push_bool(true);
        buf.push_bool(false);
        let mut r = Reader::new(&buf);
        assert!(r.read_bool().unwrap());
        assert!(!r.read_bool().unwrap());
    }

    #[test]
    fn string_round_trip() {
        let mut buf = Vec::new();
        buf.extend_ssh_string(b"ssh-ed25519");
        buf.extend_ssh_string(b"");
        let mut r = Reader::new(&buf);
        assert_eq!(r.read_string().unwrap(), b"ssh-ed25519");
        assert_eq!(r.read_string().unwrap(), b"");
    }

    #[test]
    fn utf8_validation() {
        let mut buf = Vec::new();
        buf.extend_ssh_string(&[0xff, 0xfe]);
        let mut r = Reader::new(&buf);
        assert!(matches!(r.read_utf8(), Err(SshError::Decode(_))));
    }

    #[test]
    fn name_list_round_trip_and_dedup() {
        let mut buf = Vec::new();
        buf.extend_list(["a", "b", "a", "c"].iter());
        let mut r = Reader::new(&buf);
        assert_eq!(r.read_name_list().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_name_list() {
        let mut buf = Vec::new();
        buf.write_empty_list();
        let mut r = Reader::new(&buf);
        assert!(r.read_name_list().unwrap().is_empty());
    }

    #[test]
    fn mpint_high_bit_gets_sign_byte() {
        let mut buf = Vec::new();
        buf.extend_ssh_mpint(&[0x80, 0x01]);
        assert_eq!(buf, vec![0, 0, 0, 3, 0, 0x80, 0x01]);
        let mut r = Reader::new(&buf);
        assert_eq!(r.read_mpint().unwrap(), &[0x80, 0x01]);
    }

    #[test]
    fn mpint_strips_leading_zeros() {
        let mut buf = Vec::new();
        buf.extend_ssh_mpint(&[0, 0, 0x7f, 0x42]);
        assert_eq!(buf, vec![0, 0, 0, 2, 0x7f, 0x42]);
    }

    #[test]
    fn mpint_zero_is_empty() {
        let mut buf = Vec::new();
        buf.extend_ssh_mpint(&[0, 0, 0]);
        assert_eq!(buf, vec![0, 0, 0, 0]);
        let mut r = Reader::new(&buf);
        assert_eq!(r.read_mpint().unwrap(), &[] as &[u8]);
    }

    #[test]
    fn negative_mpint_rejected() {
        let mut buf = Vec::new();
        buf.extend_ssh_string(&[0x80, 0x01]);
        let mut r = Reader::new(&buf);
        assert!(matches!(r.read_mpint(), Err(SshError::Decode(_))));
    }

    #[test]
    fn truncated_reads_fail() {
        let buf = [0, 0, 0, 9, b'x'];
        let mut r = Reader::new(&buf);
        assert!(matches!(r.read_string(), Err(SshError::Decode(_))));
    }

    #[test]
    fn peek_and_skip() {
        let buf = [1u8, 2, 3, 4];
        let mut r = Reader::new(&buf);
        assert_eq!(r.peek(2).unwrap(), &[1, 2]);
        r.skip(3).unwrap();
        assert_eq!(r.read_remaining(), &[4]);
        assert_eq!(r.position(), 4);
    }
}
