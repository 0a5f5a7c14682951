//! Protocol message types

use bytes::Bytes;
use thiserror::Error;

use crate::envelope::Envelope;

/// Request names
pub const MSG_INIT: &str = "INIT";
pub const MSG_WRAP: &str = "WRAP";
pub const MSG_JOIN: &str = "JOIN";

/// Header names
pub const HEADER_SEQ: &str = "seq";
pub const HEADER_HOST: &str = "host";
pub const HEADER_PORT: &str = "port";
pub const HEADER_CHANNEL: &str = "channel";
pub const HEADER_ERROR: &str = "error";

/// Channel identifier shared by the control and data paths
pub type ChannelId = u32;

/// Response status codes used on the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    NotFound,
    Conflict,
    Gone,
    NotImplemented,
    BadGateway,
    GatewayTimeout,
}

impl Status {
    pub fn code(&self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::NotFound => 404,
            Status::Conflict => 409,
            Status::Gone => 410,
            Status::NotImplemented => 501,
            Status::BadGateway => 502,
            Status::GatewayTimeout => 504,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::NotFound => "Not Found",
            Status::Conflict => "Conflict",
            Status::Gone => "Gone",
            Status::NotImplemented => "Not Implemented",
            Status::BadGateway => "Bad Gateway",
            Status::GatewayTimeout => "Gateway Timeout",
        }
    }

    /// Build a response envelope with this status
    pub fn envelope(&self) -> Envelope {
        Envelope::response(self.code(), self.reason())
    }
}

/// Errors turning an envelope into a typed request
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("Unrecognized message: {0}")]
    Unrecognized(String),

    #[error("Expected a request, got a status line")]
    NotARequest,

    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    #[error("Invalid {header} header: {value:?}")]
    InvalidHeader { header: &'static str, value: String },
}

/// Requests accepted on a control connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// Open a TCP connection to `host:port`
    Init {
        host: String,
        port: u16,
        seq: String,
    },
    /// Write `payload` verbatim to the channel's upstream
    Wrap { seq: String, payload: Bytes },
}

impl ControlRequest {
    pub fn seq(&self) -> &str {
        match self {
            ControlRequest::Init { seq, .. } | ControlRequest::Wrap { seq, .. } => seq,
        }
    }

    pub fn parse(envelope: &Envelope) -> Result<Self, RequestError> {
        match request_name(envelope)? {
            MSG_INIT => {
                let host = required(envelope, HEADER_HOST)?.to_string();
                let port = parse_header(envelope, HEADER_PORT)?;
                let seq = required(envelope, HEADER_SEQ)?.to_string();
                Ok(ControlRequest::Init { host, port, seq })
            }
            MSG_WRAP => Ok(ControlRequest::Wrap {
                seq: required(envelope, HEADER_SEQ)?.to_string(),
                payload: envelope.payload.clone(),
            }),
            other => Err(RequestError::Unrecognized(other.to_string())),
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        match self {
            ControlRequest::Init { host, port, seq } => Envelope::request(MSG_INIT)
                .with_header(HEADER_HOST, host.as_str())
                .with_header(HEADER_PORT, port.to_string())
                .with_header(HEADER_SEQ, seq.as_str()),
            ControlRequest::Wrap { seq, payload } => Envelope::request(MSG_WRAP)
                .with_header(HEADER_SEQ, seq.as_str())
                .with_payload(payload.clone()),
        }
    }
}

/// Requests accepted on a data connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataRequest {
    /// Bind this connection to `channel`
    Join { channel: ChannelId, seq: String },
}

impl DataRequest {
    pub fn seq(&self) -> &str {
        match self {
            DataRequest::Join { seq, .. } => seq,
        }
    }

    pub fn parse(envelope: &Envelope) -> Result<Self, RequestError> {
        match request_name(envelope)? {
            MSG_JOIN => Ok(DataRequest::Join {
                channel: parse_header(envelope, HEADER_CHANNEL)?,
                seq: required(envelope, HEADER_SEQ)?.to_string(),
            }),
            other => Err(RequestError::Unrecognized(other.to_string())),
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        match self {
            DataRequest::Join { channel, seq } => Envelope::request(MSG_JOIN)
                .with_header(HEADER_CHANNEL, channel.to_string())
                .with_header(HEADER_SEQ, seq.as_str()),
        }
    }
}

fn request_name(envelope: &Envelope) -> Result<&str, RequestError> {
    envelope.name().ok_or(RequestError::NotARequest)
}

fn required<'a>(envelope: &'a Envelope, header: &'static str) -> Result<&'a str, RequestError> {
    envelope
        .header(header)
        .ok_or(RequestError::MissingHeader(header))
}

fn parse_header<T: std::str::FromStr>(
    envelope: &Envelope,
    header: &'static str,
) -> Result<T, RequestError> {
    let value = required(envelope, header)?;
    value.parse().map_err(|_| RequestError::InvalidHeader {
        header,
        value: value.to_string(),
    })
}
