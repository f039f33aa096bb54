//! RESP2 value representation and stream codec.
//!
//! Redis serialization protocol (RESP) specification:
//!  https://redis.io/docs/reference/protocol-spec/

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Nested arrays deeper than this are rejected rather than parsed, so a
/// malicious or buggy peer cannot exhaust the stack via recursion.
pub const MAX_ARRAY_DEPTH: usize = 128;

/// A single RESP2 value, either built by this crate for an outbound command
/// or decoded from the server.
///
/// `BulkString` and `Array` distinguish "null" (`$-1\r\n` / `*-1\r\n`) from
/// "empty" (`$0\r\n\r\n` / `*0\r\n`) via `Option`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RespValue {
    SimpleString(Bytes),
    Error(Bytes),
    Integer(i64),
    BulkString(Option<Bytes>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Builds the `Array` of `BulkString`s a command is transmitted as:
    /// `[command-name, arg1, arg2, ...]`.
    pub fn command<I, A>(name: &str, args: I) -> RespValue
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        let mut parts = Vec::new();
        parts.push(RespValue::BulkString(Some(Bytes::copy_from_slice(
            name.as_bytes(),
        ))));
        parts.extend(
            args.into_iter()
                .map(|a| RespValue::BulkString(Some(a.into()))),
        );
        RespValue::Array(Some(parts))
    }

    /// Encodes `self` as a RESP command frame. Only the shapes a client ever
    /// sends (`Array` of `BulkString`) are supported; anything else is a
    /// programmer error in this crate, not a runtime condition.
    pub fn encode_command(&self, dst: &mut BytesMut) {
        match self {
            RespValue::Array(Some(parts)) => {
                dst.put_u8(b'*');
                dst.put_slice(parts.len().to_string().as_bytes());
                dst.put_slice(b"\r\n");
                for part in parts {
                    match part {
                        RespValue::BulkString(Some(bytes)) => {
                            dst.put_u8(b'$');
                            dst.put_slice(bytes.len().to_string().as_bytes());
                            dst.put_slice(b"\r\n");
                            dst.put_slice(bytes);
                            dst.put_slice(b"\r\n");
                        }
                        RespValue::BulkString(None) => dst.put_slice(b"$-1\r\n"),
                        other => panic!("command frames only carry bulk strings, got {:?}", other),
                    }
                }
            }
            other => panic!("not a command frame: {:?}", other),
        }
    }

    /// Convenience accessor used by the pub/sub dispatcher and the example
    /// command wrappers to inspect an array's elements without matching
    /// through `Option` twice.
    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(Some(items)) => Some(items),
            _ => None,
        }
    }

    /// Interprets a `SimpleString` or `BulkString` as UTF-8 bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::SimpleString(b) => Some(b),
            RespValue::BulkString(Some(b)) => Some(b),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "{}", String::from_utf8_lossy(s)),
            RespValue::Error(msg) => write!(f, "error: {}", String::from_utf8_lossy(msg)),
            RespValue::Integer(n) => write!(f, "{}", n),
            RespValue::BulkString(Some(b)) => write!(f, "{}", String::from_utf8_lossy(b)),
            RespValue::BulkString(None) => write!(f, "(nil)"),
            RespValue::Array(Some(parts)) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", part)?;
                }
                Ok(())
            }
            RespValue::Array(None) => write!(f, "(nil)"),
        }
    }
}

/// Stream-oriented RESP2 decoder, driven by `tokio_util::codec::Framed`.
///
/// One `decode` call attempts to parse one top-level value. If the buffer
/// doesn't yet hold a complete frame, `Ok(None)` is returned without
/// consuming anything — `Framed` will call back in once more bytes arrive.
#[derive(Default)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RespValue>, ProtocolError> {
        let mut cursor = Cursor::new(src);
        match parse_value(&mut cursor, 0) {
            Ok(value) => {
                let consumed = cursor.pos;
                cursor.src.advance(consumed);
                Ok(Some(value))
            }
            Err(ProtocolError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        item.encode_command(dst);
        Ok(())
    }
}

/// A read-only cursor over a `BytesMut` that tracks how many bytes have been
/// looked at without mutating the underlying buffer — the buffer is only
/// advanced once a full frame has parsed successfully, so a failed partial
/// parse can be retried from the start once more data arrives.
struct Cursor<'a> {
    src: &'a mut BytesMut,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a mut BytesMut) -> Self {
        Cursor { src, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.src.len() - self.pos
    }

    fn peek_u8(&self) -> Result<u8, ProtocolError> {
        self.src
            .get(self.pos)
            .copied()
            .ok_or(ProtocolError::Incomplete)
    }

    fn get_u8(&mut self) -> Result<u8, ProtocolError> {
        let b = self.peek_u8()?;
        self.pos += 1;
        Ok(b)
    }

    /// Scans for the next `\r\n`, rejecting a lone `\r` or `\n`.
    fn get_line(&mut self) -> Result<Bytes, ProtocolError> {
        let start = self.pos;
        let buf = &self.src[..];
        let mut i = start;
        while i < buf.len() {
            if buf[i] == b'\r' {
                if i + 1 == buf.len() {
                    return Err(ProtocolError::Incomplete);
                }
                if buf[i + 1] != b'\n' {
                    return Err(ProtocolError::Malformed("lone CR in line".into()));
                }
                let line = Bytes::copy_from_slice(&self.src[start..i]);
                self.pos = i + 2;
                return Ok(line);
            }
            if buf[i] == b'\n' {
                return Err(ProtocolError::Malformed("lone LF in line".into()));
            }
            i += 1;
        }
        Err(ProtocolError::Incomplete)
    }

    fn get_decimal(&mut self) -> Result<i64, ProtocolError> {
        let line = self.get_line()?;
        atoi::atoi::<i64>(&line)
            .ok_or_else(|| ProtocolError::Malformed("invalid integer frame".into()))
    }

    fn take(&mut self, n: usize) -> Result<Bytes, ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::Incomplete);
        }
        let start = self.pos;
        let out = Bytes::copy_from_slice(&self.src[start..start + n]);
        self.pos += n;
        Ok(out)
    }

    fn expect_crlf(&mut self) -> Result<(), ProtocolError> {
        if self.remaining() < 2 {
            return Err(ProtocolError::Incomplete);
        }
        if &self.src[self.pos..self.pos + 2] != b"\r\n" {
            return Err(ProtocolError::Malformed("expected CRLF".into()));
        }
        self.pos += 2;
        Ok(())
    }
}

fn parse_value(cur: &mut Cursor<'_>, depth: usize) -> Result<RespValue, ProtocolError> {
    if depth > MAX_ARRAY_DEPTH {
        return Err(ProtocolError::MaxDepthExceeded(MAX_ARRAY_DEPTH));
    }

    match cur.get_u8()? {
        b'+' => Ok(RespValue::SimpleString(cur.get_line()?)),
        b'-' => Ok(RespValue::Error(cur.get_line()?)),
        b':' => Ok(RespValue::Integer(cur.get_decimal()?)),
        b'$' => {
            if cur.peek_u8()? == b'-' {
                let line = cur.get_line()?;
                if &line[..] != b"-1" {
                    return Err(ProtocolError::Malformed(
                        "invalid bulk string length".into(),
                    ));
                }
                Ok(RespValue::BulkString(None))
            } else {
                let len = cur.get_decimal()?;
                let len: usize = len
                    .try_into()
                    .map_err(|_| ProtocolError::Malformed("negative bulk string length".into()))?;
                let data = cur.take(len)?;
                cur.expect_crlf()?;
                Ok(RespValue::BulkString(Some(data)))
            }
        }
        b'*' => {
            if cur.peek_u8()? == b'-' {
                let line = cur.get_line()?;
                if &line[..] != b"-1" {
                    return Err(ProtocolError::Malformed("invalid array length".into()));
                }
                Ok(RespValue::Array(None))
            } else {
                let len = cur.get_decimal()?;
                let len: usize = len
                    .try_into()
                    .map_err(|_| ProtocolError::Malformed("negative array length".into()))?;
                let mut items = Vec::with_capacity(len.min(4096));
                for _ in 0..len {
                    items.push(parse_value(cur, depth + 1)?);
                }
                Ok(RespValue::Array(Some(items)))
            }
        }
        b => Err(ProtocolError::Malformed(format!(
            "invalid frame type byte `{}`",
            b as char
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn decode_all(input: &[u8]) -> Vec<RespValue> {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(v) = codec.decode(&mut buf).unwrap() {
            out.push(v);
        }
        out
    }

    #[test]
    fn decodes_simple_string() {
        let v = decode_all(b"+OK\r\n");
        assert_eq!(v, vec![RespValue::SimpleString(Bytes::from_static(b"OK"))]);
    }

    #[test]
    fn decodes_error() {
        let v = decode_all(b"-ERR bad thing\r\n");
        assert_eq!(
            v,
            vec![RespValue::Error(Bytes::from_static(b"ERR bad thing"))]
        );
    }

    #[test]
    fn decodes_integer() {
        let v = decode_all(b":-42\r\n");
        assert_eq!(v, vec![RespValue::Integer(-42)]);
    }

    #[test]
    fn null_bulk_and_null_array_are_distinct() {
        let v = decode_all(b"$-1\r\n*-1\r\n");
        assert_eq!(v, vec![RespValue::BulkString(None), RespValue::Array(None)]);
    }

    #[test]
    fn decodes_nested_array() {
        let v = decode_all(b"*2\r\n$3\r\nfoo\r\n*1\r\n:7\r\n");
        assert_eq!(
            v,
            vec![RespValue::Array(Some(vec![
                RespValue::BulkString(Some(Bytes::from_static(b"foo"))),
                RespValue::Array(Some(vec![RespValue::Integer(7)])),
            ]))]
        );
    }

    #[test]
    fn partial_frame_asks_for_more_without_consuming() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"$5\r\nhel"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"$5\r\nhel");
        buf.extend_from_slice(b"lo\r\n");
        let v = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(v, RespValue::BulkString(Some(Bytes::from_static(b"hello"))));
    }

    #[test]
    fn rejects_lone_lf() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"+OK\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn rejects_excessive_nesting() {
        let mut payload = Vec::new();
        for _ in 0..(MAX_ARRAY_DEPTH + 2) {
            payload.extend_from_slice(b"*1\r\n");
        }
        payload.extend_from_slice(b":1\r\n");
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&payload[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::MaxDepthExceeded(_))
        ));
    }

    #[test]
    fn encode_then_decode_round_trips_a_command() {
        let cmd = RespValue::command("SET", vec![Bytes::from_static(b"key"), Bytes::from_static(b"value")]);
        let mut buf = BytesMut::new();
        cmd.encode_command(&mut buf);
        assert_eq!(&buf[..], b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n");

        let mut codec = RespCodec;
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            decoded,
            RespValue::Array(Some(vec![
                RespValue::BulkString(Some(Bytes::from_static(b"SET"))),
                RespValue::BulkString(Some(Bytes::from_static(b"key"))),
                RespValue::BulkString(Some(Bytes::from_static(b"value"))),
            ]))
        );
    }
}
