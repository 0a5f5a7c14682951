//! Control connection handler
//!
//! A control connection opens at most one upstream channel at a time:
//!
//! ```text
//! Idle --INIT--> UpstreamPending --connected--> Bound --upstream closed--> Idle
//!                      |
//!                      +--connect failed--> Idle
//! ```
//!
//! The upstream connect runs in its own task and reports back through an
//! event queue, so the handler keeps answering its connection meanwhile.

use bytes::Bytes;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wsp_proto::{
    ChannelId, ControlRequest, Envelope, RequestError, Status, HEADER_CHANNEL, HEADER_ERROR,
    HEADER_SEQ,
};
use wsp_transport::{TunnelConnection, TunnelFrame, TunnelRole, TunnelSender};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::registry::SessionRegistry;
use crate::upstream::{self, UpstreamHandle, UpstreamReader};

/// Control connection state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlState {
    Idle,
    UpstreamPending { seq: String, target: String },
    Bound(ChannelId),
}

enum ControlEvent {
    Connected {
        seq: String,
        target: String,
        result: GatewayResult<TcpStream>,
    },
    UpstreamClosed {
        channel: ChannelId,
        result: GatewayResult<()>,
    },
}

/// Serves control connections
pub struct ControlHandler {
    registry: Arc<SessionRegistry>,
    config: Arc<GatewayConfig>,
}

impl ControlHandler {
    pub fn new(registry: Arc<SessionRegistry>, config: Arc<GatewayConfig>) -> Self {
        Self { registry, config }
    }

    /// Run the connection until its peer goes away
    pub async fn handle_connection(&self, mut conn: TunnelConnection) {
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let mut session = ControlSession {
            registry: self.registry.clone(),
            config: self.config.clone(),
            sender: conn.sender(),
            events: events_tx,
            state: ControlState::Idle,
            connect_task: None,
        };

        info!(
            connection = %conn.connection_id(),
            "Control connection from {}",
            conn.remote_addr()
        );

        loop {
            tokio::select! {
                frame = conn.recv() => match frame {
                    Some(frame) => session.on_frame(frame).await,
                    None => break,
                },
                Some(event) = events_rx.recv() => session.on_event(event).await,
            }
        }

        session.shutdown();
        info!(connection = %conn.connection_id(), "Control connection closed");
    }
}

struct ControlSession {
    registry: Arc<SessionRegistry>,
    config: Arc<GatewayConfig>,
    sender: TunnelSender,
    events: mpsc::Sender<ControlEvent>,
    state: ControlState,
    connect_task: Option<JoinHandle<()>>,
}

impl ControlSession {
    async fn on_frame(&mut self, frame: TunnelFrame) {
        let envelope = match frame.to_envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(connection = %self.sender.connection_id(), "Dropping control message: {}", e);
                return;
            }
        };
        let seq = envelope.header(HEADER_SEQ).map(str::to_string);

        let request = match ControlRequest::parse(&envelope) {
            Ok(request) => request,
            Err(RequestError::NotARequest) => {
                debug!(
                    connection = %self.sender.connection_id(),
                    "Ignoring {:?} response on control connection",
                    envelope.code()
                );
                return;
            }
            Err(RequestError::Unrecognized(name)) => {
                let err = GatewayError::UnrecognizedMessage {
                    role: TunnelRole::Control,
                    name,
                };
                warn!(connection = %self.sender.connection_id(), "{}", err);
                self.reply_error(&err, seq.as_deref()).await;
                return;
            }
            Err(e) => {
                let err = GatewayError::BadRequest(e);
                warn!(connection = %self.sender.connection_id(), "{}", err);
                self.reply_error(&err, seq.as_deref()).await;
                return;
            }
        };

        let result = match request {
            ControlRequest::Init { host, port, seq } => self.open_upstream(host, port, seq),
            ControlRequest::Wrap { seq, payload } => self.forward(&seq, payload).await,
        };
        if let Err(e) = result {
            warn!(connection = %self.sender.connection_id(), "Control request failed: {}", e);
            self.reply_error(&e, seq.as_deref()).await;
        }
    }

    fn open_upstream(&mut self, host: String, port: u16, seq: String) -> GatewayResult<()> {
        match &self.state {
            ControlState::Idle => {}
            ControlState::UpstreamPending { target, .. } => {
                return Err(GatewayError::InvalidState(format!(
                    "upstream connection to {} already pending",
                    target
                )))
            }
            ControlState::Bound(channel) => {
                return Err(GatewayError::InvalidState(format!(
                    "channel {} already open",
                    channel
                )))
            }
        }

        let target = format!("{}:{}", host, port);
        info!(connection = %self.sender.connection_id(), "Connecting upstream to {}", target);

        self.state = ControlState::UpstreamPending {
            seq: seq.clone(),
            target: target.clone(),
        };

        let events = self.events.clone();
        let timeout = self.config.connect_timeout;
        self.connect_task = Some(tokio::spawn(async move {
            let result = upstream::connect(&host, port, timeout).await;
            let _ = events
                .send(ControlEvent::Connected {
                    seq,
                    target,
                    result,
                })
                .await;
        }));
        Ok(())
    }

    async fn forward(&self, seq: &str, payload: Bytes) -> GatewayResult<()> {
        let ControlState::Bound(channel) = self.state else {
            return Err(GatewayError::InvalidState(
                "no upstream channel is open".to_string(),
            ));
        };

        self.registry.record_sequence(channel, seq)?;
        if payload.is_empty() {
            return Ok(());
        }

        debug!(channel, seq, "Forwarding {} bytes upstream", payload.len());
        self.registry.upstream(channel)?.write(channel, payload).await
    }

    async fn on_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Connected {
                seq,
                target,
                result,
            } => {
                self.connect_task = None;
                if !matches!(self.state, ControlState::UpstreamPending { .. }) {
                    return;
                }

                let bound = match result {
                    Ok(stream) => self.bind_upstream(stream, target, &seq).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = bound {
                    warn!(connection = %self.sender.connection_id(), "Upstream connect failed: {}", e);
                    if let ControlState::Bound(channel) = self.state {
                        self.registry.close(channel);
                    }
                    self.state = ControlState::Idle;
                    self.reply_error(&e, Some(&seq)).await;
                }
            }
            ControlEvent::UpstreamClosed { channel, result } => {
                if self.state != ControlState::Bound(channel) {
                    return;
                }

                let last_seq = self.registry.last_sequence(channel).ok().flatten();
                self.registry.close(channel);
                self.state = ControlState::Idle;

                let mut envelope = Status::Gone
                    .envelope()
                    .with_header(HEADER_CHANNEL, channel.to_string());
                if let Some(seq) = last_seq {
                    envelope = envelope.with_header(HEADER_SEQ, seq);
                }
                match result {
                    Ok(()) => info!(channel, "Upstream closed the connection"),
                    Err(e) => {
                        warn!(channel, "Upstream failed: {}", e);
                        envelope = envelope.with_header(HEADER_ERROR, e.to_string());
                    }
                }
                self.send_reply(&envelope).await;
            }
        }
    }

    /// Register a connected upstream and start its reader and writer tasks
    async fn bind_upstream(
        &mut self,
        stream: TcpStream,
        target: String,
        seq: &str,
    ) -> GatewayResult<ChannelId> {
        let peer_addr = stream
            .peer_addr()
            .map_err(|e| GatewayError::UpstreamUnreachable {
                address: target.clone(),
                reason: e.to_string(),
            })?;
        let (read_half, write_half) = stream.into_split();
        let (upstream, rx) = UpstreamHandle::channel(peer_addr, self.config.upstream_queue_depth);

        let channel = self
            .registry
            .open(target.clone(), upstream, self.sender.clone());
        self.state = ControlState::Bound(channel);

        // Reply before the reader can relay anything from the upstream
        let reply = Status::Ok
            .envelope()
            .with_header(HEADER_SEQ, seq)
            .with_header(HEADER_CHANNEL, channel.to_string());
        self.send_reply(&reply).await;

        let stats = self.registry.stats(channel)?;
        let writer = tokio::spawn(upstream::write_loop(channel, write_half, rx, stats));
        self.registry.attach_task(channel, writer);

        let reader = UpstreamReader::new(
            channel,
            self.registry.clone(),
            self.sender.clone(),
            &self.config,
        )?;
        let events = self.events.clone();
        let reader = tokio::spawn(async move {
            let result = reader.run(read_half).await;
            let _ = events
                .send(ControlEvent::UpstreamClosed { channel, result })
                .await;
        });
        self.registry.attach_task(channel, reader);

        info!(channel, "Upstream {} connected ({})", target, peer_addr);
        Ok(channel)
    }

    async fn reply_error(&self, err: &GatewayError, seq: Option<&str>) {
        self.send_reply(&err.to_envelope(seq)).await;
    }

    async fn send_reply(&self, envelope: &Envelope) {
        if let Err(e) = self.sender.send_envelope(envelope).await {
            debug!(connection = %self.sender.connection_id(), "Failed to send reply: {}", e);
        }
    }

    /// Release everything this connection owns
    fn shutdown(&mut self) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        if let ControlState::Bound(channel) = self.state {
            self.registry.close(channel);
        }
        self.state = ControlState::Idle;
    }
}
