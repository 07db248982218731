// src/core/engine/resp.rs

//! Minimal RESP2 value model and framing codec for the engine client.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Error, Debug)]
pub enum RespError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Bytes>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Builds a command frame (array of bulk strings) from argument slices.
    pub fn command(args: &[&str]) -> RespValue {
        RespValue::Array(Some(
            args.iter()
                .map(|arg| RespValue::Bulk(Some(Bytes::copy_from_slice(arg.as_bytes()))))
                .collect(),
        ))
    }

    /// Reply payload as UTF-8 text, for simple strings and bulk strings.
    pub fn as_text(&self) -> Option<String> {
        match self {
            RespValue::Simple(s) => Some(s.clone()),
            RespValue::Bulk(Some(data)) => Some(String::from_utf8_lossy(data).into_owned()),
            _ => None,
        }
    }
}

pub struct RespCodec;

impl Encoder<RespValue> for RespCodec {
    type Error = RespError;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            RespValue::Simple(s) => {
                dst.put_u8(b'+');
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            }
            RespValue::Error(s) => {
                dst.put_u8(b'-');
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            }
            RespValue::Integer(n) => {
                dst.put_u8(b':');
                dst.put_slice(n.to_string().as_bytes());
                dst.put_slice(b"\r\n");
            }
            RespValue::Bulk(None) => dst.put_slice(b"$-1\r\n"),
            RespValue::Bulk(Some(data)) => {
                dst.put_u8(b'$');
                dst.put_slice(data.len().to_string().as_bytes());
                dst.put_slice(b"\r\n");
                dst.put_slice(&data);
                dst.put_slice(b"\r\n");
            }
            RespValue::Array(None) => dst.put_slice(b"*-1\r\n"),
            RespValue::Array(Some(items)) => {
                dst.put_u8(b'*');
                dst.put_slice(items.len().to_string().as_bytes());
                dst.put_slice(b"\r\n");
                for item in items {
                    self.encode(item, dst)?;
                }
            }
        }
        Ok(())
    }
}

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = RespError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match parse(src)? {
            Some((value, consumed)) => {
                src.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

fn find_line(buf: &[u8], start: usize) -> Option<(usize, usize)> {
    let mut pos = start;
    while pos + 1 < buf.len() {
        if buf[pos] == b'\r' && buf[pos + 1] == b'\n' {
            return Some((start, pos));
        }
        pos += 1;
    }
    None
}

fn parse_at(buf: &[u8], start: usize) -> Result<Option<(RespValue, usize)>, RespError> {
    if start >= buf.len() {
        return Ok(None);
    }
    let kind = buf[start];
    let Some((line_start, line_end)) = find_line(buf, start + 1) else {
        return Ok(None);
    };
    let line = std::str::from_utf8(&buf[line_start..line_end])
        .map_err(|_| RespError::Protocol("non-utf8 header line".to_string()))?;
    let after_line = line_end + 2;
    match kind {
        b'+' => Ok(Some((RespValue::Simple(line.to_string()), after_line))),
        b'-' => Ok(Some((RespValue::Error(line.to_string()), after_line))),
        b':' => {
            let value: i64 = line
                .parse()
                .map_err(|_| RespError::Protocol(format!("bad integer: {line}")))?;
            Ok(Some((RespValue::Integer(value), after_line)))
        }
        b'$' => {
            let len: i64 = line
                .parse()
                .map_err(|_| RespError::Protocol(format!("bad bulk length: {line}")))?;
            if len < 0 {
                return Ok(Some((RespValue::Bulk(None), after_line)));
            }
            let len = len as usize;
            if buf.len() < after_line + len + 2 {
                return Ok(None);
            }
            let data = Bytes::copy_from_slice(&buf[after_line..after_line + len]);
            Ok(Some((RespValue::Bulk(Some(data)), after_line + len + 2)))
        }
        b'*' => {
            let len: i64 = line
                .parse()
                .map_err(|_| RespError::Protocol(format!("bad array length: {line}")))?;
            if len < 0 {
                return Ok(Some((RespValue::Array(None), after_line)));
            }
            let mut items = Vec::with_capacity(len as usize);
            let mut pos = after_line;
            for _ in 0..len {
                match parse_at(buf, pos)? {
                    Some((item, next)) => {
                        items.push(item);
                        pos = next;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(Some(items)), pos)))
        }
        other => Err(RespError::Protocol(format!(
            "unknown type byte: {}",
            other as char
        ))),
    }
}

fn parse(buf: &[u8]) -> Result<Option<(RespValue, usize)>, RespError> {
    parse_at(buf, 0)
}
