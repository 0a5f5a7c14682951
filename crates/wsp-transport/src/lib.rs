//! Transport abstraction layer
//!
//! The gateway only needs a message-oriented, full-duplex connection whose
//! role (`control` or `data`) is declared by the peer when it connects.
//! Concrete transports accept peers, negotiate the role and hand the gateway a
//! [`TunnelConnection`]: an inbound message queue plus a cloneable
//! [`TunnelSender`] drained by the transport's writer task.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use wsp_proto::{Envelope, EnvelopeError};

/// Depth of the per-connection inbound and outbound queues
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to bind to {address}:{port}: {reason}")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Handshake error: {0}")]
    HandshakeError(String),

    #[error("Unrecognized tunnel role: {0:?}")]
    UnrecognizedRole(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Malformed envelope: {0}")]
    Envelope(#[from] EnvelopeError),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Role a tunnel connection declares at connect time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelRole {
    Control,
    Data,
}

impl TunnelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelRole::Control => "control",
            TunnelRole::Data => "data",
        }
    }
}

impl FromStr for TunnelRole {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "control" => Ok(TunnelRole::Control),
            "data" => Ok(TunnelRole::Data),
            other => Err(TransportError::UnrecognizedRole(other.to_string())),
        }
    }
}

impl fmt::Display for TunnelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single tunnel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelFrame {
    Text(String),
    Binary(Bytes),
    /// Outbound only: ask the transport to close the connection
    Close,
}

impl TunnelFrame {
    /// Wrap an encoded envelope, as text when it is valid UTF-8
    pub fn envelope(envelope: &Envelope) -> Self {
        let wire = envelope.encode();
        match std::str::from_utf8(&wire) {
            Ok(text) => TunnelFrame::Text(text.to_string()),
            Err(_) => TunnelFrame::Binary(wire),
        }
    }

    /// Raw message bytes (empty for `Close`)
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            TunnelFrame::Text(text) => text.as_bytes(),
            TunnelFrame::Binary(data) => data,
            TunnelFrame::Close => &[],
        }
    }

    /// Decode the message as an envelope
    pub fn to_envelope(&self) -> TransportResult<Envelope> {
        Ok(Envelope::decode(self.as_bytes())?)
    }
}

/// Cloneable handle for sending on a tunnel connection
#[derive(Debug, Clone)]
pub struct TunnelSender {
    connection_id: Arc<str>,
    tx: mpsc::Sender<TunnelFrame>,
}

impl TunnelSender {
    pub fn new(connection_id: impl Into<Arc<str>>, tx: mpsc::Sender<TunnelFrame>) -> Self {
        Self {
            connection_id: connection_id.into(),
            tx,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub async fn send(&self, frame: TunnelFrame) -> TransportResult<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    pub async fn send_binary(&self, data: Bytes) -> TransportResult<()> {
        self.send(TunnelFrame::Binary(data)).await
    }

    pub async fn send_envelope(&self, envelope: &Envelope) -> TransportResult<()> {
        self.send(TunnelFrame::envelope(envelope)).await
    }

    /// Ask the transport to close the connection after queued messages
    pub async fn close(&self) {
        let _ = self.tx.send(TunnelFrame::Close).await;
    }
}

/// An accepted tunnel connection
#[derive(Debug)]
pub struct TunnelConnection {
    role: TunnelRole,
    remote_addr: SocketAddr,
    sender: TunnelSender,
    incoming: mpsc::Receiver<TunnelFrame>,
}

impl TunnelConnection {
    pub fn new(
        role: TunnelRole,
        remote_addr: SocketAddr,
        sender: TunnelSender,
        incoming: mpsc::Receiver<TunnelFrame>,
    ) -> Self {
        Self {
            role,
            remote_addr,
            sender,
            incoming,
        }
    }

    /// Create a connection backed by in-process queues
    ///
    /// The returned [`MemoryPeer`] plays the remote client. Dropping it closes
    /// the connection.
    pub fn in_memory(role: TunnelRole, remote_addr: SocketAddr) -> (Self, MemoryPeer) {
        let (to_gateway, incoming) = mpsc::channel(DEFAULT_QUEUE_DEPTH);
        let (outgoing, from_gateway) = mpsc::channel(DEFAULT_QUEUE_DEPTH);

        let connection_id = format!("mem-{}", uuid::Uuid::new_v4());
        let conn = Self::new(
            role,
            remote_addr,
            TunnelSender::new(connection_id, outgoing),
            incoming,
        );
        let peer = MemoryPeer {
            tx: to_gateway,
            rx: from_gateway,
        };
        (conn, peer)
    }

    pub fn connection_id(&self) -> &str {
        self.sender.connection_id()
    }

    pub fn role(&self) -> TunnelRole {
        self.role
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn sender(&self) -> TunnelSender {
        self.sender.clone()
    }

    /// Next inbound message; `None` once the peer has gone away
    pub async fn recv(&mut self) -> Option<TunnelFrame> {
        self.incoming.recv().await
    }
}

/// Client side of an in-memory [`TunnelConnection`]
#[derive(Debug)]
pub struct MemoryPeer {
    tx: mpsc::Sender<TunnelFrame>,
    rx: mpsc::Receiver<TunnelFrame>,
}

impl MemoryPeer {
    pub async fn send(&self, frame: TunnelFrame) -> TransportResult<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    pub async fn send_envelope(&self, envelope: &Envelope) -> TransportResult<()> {
        self.send(TunnelFrame::envelope(envelope)).await
    }

    pub async fn recv(&mut self) -> Option<TunnelFrame> {
        self.rx.recv().await
    }

    /// Next message decoded as an envelope; `Ok(None)` once closed
    pub async fn recv_envelope(&mut self) -> TransportResult<Option<Envelope>> {
        match self.rx.recv().await {
            None | Some(TunnelFrame::Close) => Ok(None),
            Some(frame) => frame.to_envelope().map(Some),
        }
    }
}

/// Accepts tunnel connections
#[async_trait]
pub trait TunnelListener: Send + Sync {
    /// Wait for the next connection with a recognised role
    async fn accept(&self) -> TransportResult<TunnelConnection>;

    fn local_addr(&self) -> TransportResult<SocketAddr>;
}
