//! Gateway error types

use std::time::Duration;
use thiserror::Error;
use wsp_proto::{
    ChannelId, Envelope, EnvelopeError, RequestError, Status, HEADER_ERROR, HEADER_SEQ,
};
use wsp_transport::{TransportError, TunnelRole};

use crate::registry::RegistryError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Unrecognized {role} message: {name}")]
    UnrecognizedMessage { role: TunnelRole, name: String },

    #[error("Unknown channel: {0}")]
    UnknownChannel(ChannelId),

    #[error("Upstream {address} unreachable: {reason}")]
    UpstreamUnreachable { address: String, reason: String },

    #[error("Upstream {address} did not answer within {timeout:?}")]
    UpstreamTimeout { address: String, timeout: Duration },

    #[error("Upstream of channel {0} is closed")]
    UpstreamClosed(ChannelId),

    #[error("Upstream read failed on channel {channel}: {source}")]
    UpstreamRead {
        channel: ChannelId,
        #[source]
        source: std::io::Error,
    },

    #[error("Upstream closed mid-unit on channel {channel} ({pending} bytes discarded)")]
    PrematureClose { channel: ChannelId, pending: usize },

    #[error("Partial unit on channel {channel} stalled for {timeout:?} ({pending} bytes discarded)")]
    FrameTimeout {
        channel: ChannelId,
        pending: usize,
        timeout: Duration,
    },

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(#[from] EnvelopeError),

    #[error("Bad request: {0}")]
    BadRequest(#[from] RequestError),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<RegistryError> for GatewayError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownChannel(channel) => GatewayError::UnknownChannel(channel),
        }
    }
}

impl GatewayError {
    /// Status reported to the peer when this error answers a request
    pub fn status(&self) -> Status {
        match self {
            GatewayError::UnrecognizedMessage { .. } => Status::NotImplemented,
            GatewayError::UnknownChannel(_) => Status::NotFound,
            GatewayError::UpstreamTimeout { .. } => Status::GatewayTimeout,
            GatewayError::UpstreamUnreachable { .. }
            | GatewayError::UpstreamClosed(_)
            | GatewayError::Transport(_) => Status::BadGateway,
            GatewayError::UpstreamRead { .. }
            | GatewayError::PrematureClose { .. }
            | GatewayError::FrameTimeout { .. } => Status::Gone,
            GatewayError::MalformedEnvelope(_)
            | GatewayError::BadRequest(_)
            | GatewayError::Config(_) => Status::BadRequest,
            GatewayError::InvalidState(_) => Status::Conflict,
        }
    }

    /// Failure envelope echoing `seq` when the request carried one
    pub fn to_envelope(&self, seq: Option<&str>) -> Envelope {
        let mut envelope = self.status().envelope();
        if let Some(seq) = seq {
            envelope = envelope.with_header(HEADER_SEQ, seq);
        }
        envelope.with_header(HEADER_ERROR, self.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
