//! WebSocket connection tasks
//!
//! Each accepted socket is split into a reader task feeding the
//! connection's inbound queue and a writer task draining its
//! [`TunnelSender`]. The gateway never touches the socket directly.

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, trace, warn};
use wsp_transport::{TunnelConnection, TunnelFrame, TunnelRole, TunnelSender, DEFAULT_QUEUE_DEPTH};

/// Byte counters shared by the reader and writer tasks
#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
}

/// WebSocket-backed tunnel connection
pub struct WebSocketConnection;

impl WebSocketConnection {
    /// Start the reader and writer tasks for an upgraded socket
    pub fn spawn<S>(
        ws_stream: WebSocketStream<S>,
        role: TunnelRole,
        remote_addr: SocketAddr,
    ) -> TunnelConnection
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection_id = format!("ws-{}", uuid::Uuid::new_v4());

        let (ws_sink, ws_source) = ws_stream.split();
        let (frame_tx, frame_rx) = mpsc::channel::<TunnelFrame>(DEFAULT_QUEUE_DEPTH);
        let (incoming_tx, incoming_rx) = mpsc::channel::<TunnelFrame>(DEFAULT_QUEUE_DEPTH);
        let counters = Arc::new(Counters::default());

        let conn_id = connection_id.clone();
        let writer_counters = counters.clone();
        tokio::spawn(async move {
            Self::writer_task(ws_sink, frame_rx, writer_counters, conn_id).await;
        });

        let conn_id = connection_id.clone();
        tokio::spawn(async move {
            Self::reader_task(ws_source, incoming_tx, counters, conn_id).await;
        });

        TunnelConnection::new(
            role,
            remote_addr,
            TunnelSender::new(connection_id, frame_tx),
            incoming_rx,
        )
    }

    /// Writer task - sends queued frames to the WebSocket
    async fn writer_task<S>(
        mut sink: SplitSink<WebSocketStream<S>, Message>,
        mut rx: mpsc::Receiver<TunnelFrame>,
        counters: Arc<Counters>,
        conn_id: String,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while let Some(frame) = rx.recv().await {
            let message = match frame {
                TunnelFrame::Text(text) => Message::Text(text),
                TunnelFrame::Binary(data) => Message::Binary(data.to_vec()),
                TunnelFrame::Close => {
                    debug!("[{}] Closing WebSocket on request", conn_id);
                    break;
                }
            };

            let len = message.len() as u64;
            if let Err(e) = sink.send(message).await {
                error!("[{}] WebSocket send error: {}", conn_id, e);
                break;
            }
            counters.sent.fetch_add(len, Ordering::Relaxed);
        }

        let _ = sink.close().await;
        debug!(
            "[{}] WebSocket writer task ended ({} bytes sent)",
            conn_id,
            counters.sent.load(Ordering::Relaxed)
        );
    }

    /// Reader task - forwards text and binary messages to the inbound queue
    async fn reader_task<S>(
        mut source: SplitStream<WebSocketStream<S>>,
        incoming: mpsc::Sender<TunnelFrame>,
        counters: Arc<Counters>,
        conn_id: String,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while let Some(result) = source.next().await {
            let frame = match result {
                Ok(Message::Text(text)) => {
                    counters
                        .received
                        .fetch_add(text.len() as u64, Ordering::Relaxed);
                    TunnelFrame::Text(text)
                }
                Ok(Message::Binary(data)) => {
                    counters
                        .received
                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                    TunnelFrame::Binary(Bytes::from(data))
                }
                Ok(Message::Ping(_)) => {
                    // Pong is automatically handled by tungstenite
                    trace!("[{}] Received ping", conn_id);
                    continue;
                }
                Ok(Message::Pong(_)) => {
                    trace!("[{}] Received pong", conn_id);
                    continue;
                }
                Ok(Message::Close(_)) => {
                    debug!("[{}] WebSocket close received", conn_id);
                    break;
                }
                Ok(Message::Frame(_)) => continue,
                Err(e) => {
                    warn!("[{}] WebSocket read error: {}", conn_id, e);
                    break;
                }
            };

            if incoming.send(frame).await.is_err() {
                debug!("[{}] Handler gone, stopping reader", conn_id);
                break;
            }
        }

        debug!(
            "[{}] WebSocket reader task ended ({} bytes received)",
            conn_id,
            counters.received.load(Ordering::Relaxed)
        );
    }
}
