//! STOMP 1.2 frame codec (panic-free, incremental).
//!
//! A frame is a command line, `key:value` header lines, a blank line, and a
//! body terminated by NUL. When `content-length` is present the body is read
//! by length and may itself contain NUL bytes. Bare EOLs between frames are
//! heart-beats and are skipped.
//!
//! Parsing rules:
//! - Never index the buffer; use `get`/iterators and explicit length checks.
//! - Return `Ok(None)` until a whole frame is buffered.
//! - Never `unwrap()` / `expect()` / `panic!()`.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, RelayError};

/// Upper bound for one buffered frame (headers + body).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    // client -> broker
    Connect,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,
    // broker -> client
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Disconnect => "DISCONNECT",
            Command::Connected => "CONNECTED",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    fn parse(line: &[u8]) -> Result<Self> {
        match line {
            b"CONNECT" | b"STOMP" => Ok(Command::Connect),
            b"SEND" => Ok(Command::Send),
            b"SUBSCRIBE" => Ok(Command::Subscribe),
            b"UNSUBSCRIBE" => Ok(Command::Unsubscribe),
            b"DISCONNECT" => Ok(Command::Disconnect),
            b"CONNECTED" => Ok(Command::Connected),
            b"MESSAGE" => Ok(Command::Message),
            b"RECEIPT" => Ok(Command::Receipt),
            b"ERROR" => Ok(Command::Error),
            other => Err(RelayError::Protocol(format!(
                "unknown stomp command: {}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    /// CONNECT/CONNECTED headers are exempt from value escaping.
    fn escapes_headers(self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One STOMP frame. Header order is preserved; the first occurrence of a
/// repeated header wins on lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Append the wire form of `frame` to `out`.
///
/// A `content-length` header is added for non-empty bodies unless the caller
/// already set one.
pub fn encode(frame: &Frame, out: &mut BytesMut) {
    let escape = frame.command.escapes_headers();

    out.put_slice(frame.command.as_str().as_bytes());
    out.put_u8(b'\n');
    for (k, v) in &frame.headers {
        put_header_part(out, k, escape);
        out.put_u8(b':');
        put_header_part(out, v, escape);
        out.put_u8(b'\n');
    }
    if !frame.body.is_empty() && frame.get("content-length").is_none() {
        out.put_slice(format!("content-length:{}\n", frame.body.len()).as_bytes());
    }
    out.put_u8(b'\n');
    out.put_slice(&frame.body);
    out.put_u8(0);
}

fn put_header_part(out: &mut BytesMut, s: &str, escape: bool) {
    if !escape {
        out.put_slice(s.as_bytes());
        return;
    }
    for ch in s.chars() {
        match ch {
            '\\' => out.put_slice(b"\\\\"),
            '\n' => out.put_slice(b"\\n"),
            '\r' => out.put_slice(b"\\r"),
            ':' => out.put_slice(b"\\c"),
            c => {
                let mut tmp = [0u8; 4];
                out.put_slice(c.encode_utf8(&mut tmp).as_bytes());
            }
        }
    }
}

/// Try to decode one frame from the front of `buf`.
///
/// Consumes the frame (and any heart-beat EOLs before it) on success. Returns
/// `Ok(None)` when more bytes are needed.
pub fn decode(buf: &mut BytesMut, max_frame_bytes: usize) -> Result<Option<Frame>> {
    skip_heartbeats(buf);
    if buf.is_empty() {
        return Ok(None);
    }

    let Some(head) = find_head(buf) else {
        if buf.len() > max_frame_bytes {
            return Err(RelayError::Protocol("stomp frame header too large".into()));
        }
        return Ok(None);
    };

    let command = Command::parse(trim_cr(buf.get(..head.command_end).unwrap_or_default()))?;
    let headers = parse_headers(
        buf.get(head.command_end + 1..head.headers_end).unwrap_or_default(),
        command.escapes_headers(),
    )?;

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| RelayError::Protocol(format!("invalid content-length: {v}")))
        })
        .transpose()?;

    let body_start = head.body_start;
    let body_len = match content_length {
        Some(len) => {
            if len > max_frame_bytes {
                return Err(RelayError::Protocol("stomp frame body too large".into()));
            }
            if buf.len() < body_start + len + 1 {
                return Ok(None);
            }
            if buf.get(body_start + len) != Some(&0) {
                return Err(RelayError::Protocol(
                    "stomp body not terminated after content-length".into(),
                ));
            }
            len
        }
        None => {
            let rest = buf.get(body_start..).unwrap_or_default();
            match rest.iter().position(|b| *b == 0) {
                Some(len) => len,
                None => {
                    if buf.len() > max_frame_bytes {
                        return Err(RelayError::Protocol("stomp frame too large".into()));
                    }
                    return Ok(None);
                }
            }
        }
    };

    buf.advance(body_start);
    let body = buf.split_to(body_len).freeze();
    buf.advance(1); // NUL

    Ok(Some(Frame {
        command,
        headers,
        body,
    }))
}

fn skip_heartbeats(buf: &mut BytesMut) {
    loop {
        if buf.first() == Some(&b'\n') {
            buf.advance(1);
        } else if buf.starts_with(b"\r\n") {
            buf.advance(2);
        } else {
            return;
        }
    }
}

struct Head {
    command_end: usize,
    headers_end: usize,
    body_start: usize,
}

/// Locate the command line and the blank line ending the header block.
fn find_head(buf: &[u8]) -> Option<Head> {
    let command_end = buf.iter().position(|b| *b == b'\n')?;
    let mut line_start = command_end + 1;
    loop {
        let rel = buf.get(line_start..)?.iter().position(|b| *b == b'\n')?;
        let line_end = line_start + rel;
        let line = trim_cr(buf.get(line_start..line_end)?);
        if line.is_empty() {
            return Some(Head {
                command_end,
                headers_end: line_start.saturating_sub(1).max(command_end + 1),
                body_start: line_end + 1,
            });
        }
        line_start = line_end + 1;
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_headers(block: &[u8], unescape: bool) -> Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    for raw in block.split(|b| *b == b'\n') {
        let line = trim_cr(raw);
        if line.is_empty() {
            continue;
        }
        let line = std::str::from_utf8(line)
            .map_err(|e| RelayError::Protocol(format!("stomp header not utf-8: {e}")))?;
        let (k, v) = line
            .split_once(':')
            .ok_or_else(|| RelayError::Protocol(format!("malformed stomp header: {line}")))?;
        if unescape {
            headers.push((unescape_value(k)?, unescape_value(v)?));
        } else {
            headers.push((k.to_string(), v.to_string()));
        }
    }
    Ok(headers)
}

fn unescape_value(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(RelayError::Protocol(format!(
                    "invalid stomp header escape: \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}
