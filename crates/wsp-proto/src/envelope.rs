//! Textual tunnel envelope
//!
//! Every tunnel message is wrapped in a small HTTP-like envelope:
//!
//! ```text
//! WSP/1.1 <code> <reason>\r\n      (responses)
//! WSP/1.1 <name>\r\n               (requests)
//! <key>: <value>\r\n
//! \r\n
//! <raw payload bytes, optional>
//! ```
//!
//! The payload is everything after the first blank line and is never
//! re-parsed, so it may carry arbitrary bytes including `\r\n\r\n`.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

use crate::PROTOCOL_TAG;

const LINE_END: &str = "\r\n";
const HEAD_END: &[u8] = b"\r\n\r\n";

/// Envelope decoding errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Invalid start line: {0:?}")]
    InvalidStartLine(String),

    #[error("Invalid header line: {0:?}")]
    InvalidHeader(String),

    #[error("Envelope head is not valid UTF-8")]
    NotUtf8,
}

/// First line of an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    /// `WSP/1.1 <name>`
    Request(String),
    /// `WSP/1.1 <code> <reason>`
    Status { code: u16, reason: String },
}

impl StartLine {
    fn parse(line: &str) -> Result<Self, EnvelopeError> {
        let rest = line
            .strip_prefix(PROTOCOL_TAG)
            .filter(|rest| rest.starts_with(char::is_whitespace))
            .map(str::trim_start)
            .filter(|rest| !rest.is_empty())
            .ok_or_else(|| EnvelopeError::InvalidStartLine(line.to_string()))?;

        let (first, reason) = match rest.split_once(' ') {
            Some((first, reason)) => (first, reason),
            None => (rest, ""),
        };

        if first.len() == 3 && first.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(code) = first.parse() {
                return Ok(StartLine::Status {
                    code,
                    reason: reason.to_string(),
                });
            }
        }

        Ok(StartLine::Request(rest.trim_end().to_string()))
    }
}

impl fmt::Display for StartLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartLine::Request(name) => write!(f, "{} {}", PROTOCOL_TAG, name),
            StartLine::Status { code, reason } => {
                write!(f, "{} {} {}", PROTOCOL_TAG, code, reason)
            }
        }
    }
}

/// Envelope header block
///
/// Keeps insertion order for encoding. Inserting an existing key replaces
/// its value in place, so the last occurrence wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// A decoded tunnel envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub start: StartLine,
    pub headers: Headers,
    pub payload: Bytes,
}

impl Envelope {
    /// Create a request envelope (`WSP/1.1 <name>`)
    pub fn request(name: impl Into<String>) -> Self {
        Self {
            start: StartLine::Request(name.into()),
            headers: Headers::new(),
            payload: Bytes::new(),
        }
    }

    /// Create a response envelope (`WSP/1.1 <code> <reason>`)
    pub fn response(code: u16, reason: impl Into<String>) -> Self {
        Self {
            start: StartLine::Status {
                code,
                reason: reason.into(),
            },
            headers: Headers::new(),
            payload: Bytes::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Request name, if this is a request
    pub fn name(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request(name) => Some(name),
            StartLine::Status { .. } => None,
        }
    }

    /// Status code, if this is a response
    pub fn code(&self) -> Option<u16> {
        match &self.start {
            StartLine::Status { code, .. } => Some(*code),
            StartLine::Request(_) => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match &self.start {
            StartLine::Status { reason, .. } => Some(reason),
            StartLine::Request(_) => None,
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Bytes {
        let mut head = format!("{}{}", self.start, LINE_END);
        for (key, value) in self.headers.iter() {
            head.push_str(key);
            head.push_str(": ");
            head.push_str(value);
            head.push_str(LINE_END);
        }
        head.push_str(LINE_END);

        let mut buf = BytesMut::with_capacity(head.len() + self.payload.len());
        buf.put_slice(head.as_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode from wire bytes
    pub fn decode(raw: &[u8]) -> Result<Self, EnvelopeError> {
        let (head, payload) = match find(raw, HEAD_END) {
            Some(idx) => (&raw[..idx], &raw[idx + HEAD_END.len()..]),
            None => (raw, &[][..]),
        };

        let head = std::str::from_utf8(head).map_err(|_| EnvelopeError::NotUtf8)?;
        let mut lines = head.split(LINE_END);

        let start = StartLine::parse(lines.next().unwrap_or_default())?;

        let mut headers = Headers::new();
        for line in lines.filter(|line| !line.is_empty()) {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| EnvelopeError::InvalidHeader(line.to_string()))?;
            headers.insert(key.trim(), value.trim());
        }

        Ok(Self {
            start,
            headers,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// Encode a response envelope
pub fn encode(code: u16, reason: &str, headers: &Headers, payload: &[u8]) -> Bytes {
    Envelope {
        start: StartLine::Status {
            code,
            reason: reason.to_string(),
        },
        headers: headers.clone(),
        payload: Bytes::copy_from_slice(payload),
    }
    .encode()
}

/// Decode an envelope
pub fn decode(raw: &[u8]) -> Result<Envelope, EnvelopeError> {
    Envelope::decode(raw)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
