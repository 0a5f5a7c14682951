//! Data connection handler
//!
//! A data connection joins one channel at a time and then only receives:
//! every binary frame reassembled from that channel's upstream is delivered
//! to it by the upstream reader. Closing the connection unbinds it without
//! touching the upstream.

use std::sync::Arc;
use tracing::{debug, info, warn};
use wsp_proto::{ChannelId, DataRequest, RequestError, Status, HEADER_SEQ};
use wsp_transport::{TunnelConnection, TunnelFrame, TunnelRole, TunnelSender};

use crate::error::{GatewayError, GatewayResult};
use crate::registry::SessionRegistry;

/// Data connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataState {
    Idle,
    Joined(ChannelId),
}

/// Serves data connections
pub struct DataHandler {
    registry: Arc<SessionRegistry>,
}

impl DataHandler {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub async fn handle_connection(&self, mut conn: TunnelConnection) {
        let sender = conn.sender();
        let mut state = DataState::Idle;

        info!(
            connection = %sender.connection_id(),
            "Data connection from {}",
            conn.remote_addr()
        );

        while let Some(frame) = conn.recv().await {
            state = self.on_frame(state, &sender, frame).await;
        }

        if let DataState::Joined(channel) = state {
            if self.registry.unbind(channel, sender.connection_id()) {
                debug!(channel, "Data connection unbound");
            }
        }
        info!(connection = %sender.connection_id(), "Data connection closed");
    }

    async fn on_frame(
        &self,
        state: DataState,
        sender: &TunnelSender,
        frame: TunnelFrame,
    ) -> DataState {
        let envelope = match frame.to_envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(connection = %sender.connection_id(), "Dropping data message: {}", e);
                return state;
            }
        };
        let seq = envelope.header(HEADER_SEQ).map(str::to_string);

        let result = match DataRequest::parse(&envelope) {
            Ok(DataRequest::Join { channel, seq }) => self.join(state, sender, channel, &seq).await,
            Err(RequestError::NotARequest) => {
                debug!(connection = %sender.connection_id(), "Ignoring response on data connection");
                return state;
            }
            Err(RequestError::Unrecognized(name)) => Err(GatewayError::UnrecognizedMessage {
                role: TunnelRole::Data,
                name,
            }),
            Err(e) => Err(GatewayError::BadRequest(e)),
        };

        match result {
            Ok(state) => state,
            Err(e) => {
                warn!(connection = %sender.connection_id(), "Data request failed: {}", e);
                if let Err(e) = sender.send_envelope(&e.to_envelope(seq.as_deref())).await {
                    debug!(connection = %sender.connection_id(), "Failed to send reply: {}", e);
                }
                state
            }
        }
    }

    async fn join(
        &self,
        state: DataState,
        sender: &TunnelSender,
        channel: ChannelId,
        seq: &str,
    ) -> GatewayResult<DataState> {
        let previous = self.registry.bind(channel, sender.clone())?;

        if let DataState::Joined(old) = state {
            if old != channel {
                self.registry.unbind(old, sender.connection_id());
            }
        }
        if let Some(previous) = previous {
            if previous.connection_id() != sender.connection_id() {
                debug!(
                    channel,
                    "Data connection {} replaces {}",
                    sender.connection_id(),
                    previous.connection_id()
                );
            }
        }

        info!(channel, connection = %sender.connection_id(), "Data connection joined");

        // The binding is already committed; the close path must see it
        let reply = Status::Ok.envelope().with_header(HEADER_SEQ, seq);
        if let Err(e) = sender.send_envelope(&reply).await {
            debug!(connection = %sender.connection_id(), "Failed to send reply: {}", e);
        }
        Ok(DataState::Joined(channel))
    }
}
