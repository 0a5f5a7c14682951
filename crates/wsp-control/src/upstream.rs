//! Upstream TCP connections
//!
//! An established upstream socket is split in two. The write half is owned by
//! a writer task draining an [`UpstreamHandle`] queue; the read half is owned
//! by an [`UpstreamReader`], which reassembles the byte stream and routes each
//! completed unit: control text back to the control connection, binary frames
//! to the bound data connection.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use wsp_proto::{ChannelId, Reassembler, Status, Unit, HEADER_SEQ};
use wsp_transport::TunnelSender;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::registry::{SessionRegistry, SessionStats};

/// Cloneable handle queueing writes for an upstream connection
#[derive(Debug, Clone)]
pub struct UpstreamHandle {
    tx: mpsc::Sender<Bytes>,
    peer_addr: SocketAddr,
}

impl UpstreamHandle {
    /// Create a handle and the receiver its writer task drains
    pub fn channel(peer_addr: SocketAddr, depth: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self { tx, peer_addr }, rx)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Queue `data` to be written verbatim
    pub async fn write(&self, channel: ChannelId, data: Bytes) -> GatewayResult<()> {
        self.tx
            .send(data)
            .await
            .map_err(|_| GatewayError::UpstreamClosed(channel))
    }
}

/// Open a TCP connection to `host:port` within `timeout`
pub async fn connect(host: &str, port: u16, timeout: Duration) -> GatewayResult<TcpStream> {
    let address = format!("{}:{}", host, port);
    let host = host.trim_start_matches('[').trim_end_matches(']');

    let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(GatewayError::UpstreamUnreachable {
                address,
                reason: e.to_string(),
            })
        }
        Err(_) => return Err(GatewayError::UpstreamTimeout { address, timeout }),
    };

    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY on {}: {}", address, e);
    }
    Ok(stream)
}

/// Drain queued writes into the upstream socket until the queue closes
pub async fn write_loop<W>(
    channel: ChannelId,
    mut writer: W,
    mut rx: mpsc::Receiver<Bytes>,
    stats: Arc<SessionStats>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(data) = rx.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            warn!(channel, "Upstream write failed: {}", e);
            break;
        }
        stats.add_bytes_up(data.len());
        trace!(channel, "Wrote {} bytes upstream", data.len());
    }

    let _ = writer.shutdown().await;
    debug!(channel, "Upstream writer ended");
}

/// Reads one upstream connection and routes its units
pub struct UpstreamReader {
    channel: ChannelId,
    registry: Arc<SessionRegistry>,
    control: TunnelSender,
    stats: Arc<SessionStats>,
    frame_timeout: Duration,
    read_buffer_size: usize,
}

impl UpstreamReader {
    pub fn new(
        channel: ChannelId,
        registry: Arc<SessionRegistry>,
        control: TunnelSender,
        config: &GatewayConfig,
    ) -> GatewayResult<Self> {
        let stats = registry.stats(channel)?;
        Ok(Self {
            channel,
            registry,
            control,
            stats,
            frame_timeout: config.frame_timeout,
            read_buffer_size: config.read_buffer_size,
        })
    }

    /// Read until the upstream closes
    ///
    /// Returns `Ok(())` on a clean close at a unit boundary. A close or
    /// stall in the middle of a unit discards the partial bytes and
    /// reports how many were lost.
    pub async fn run<R>(self, mut reader: R) -> GatewayResult<()>
    where
        R: AsyncRead + Unpin,
    {
        let channel = self.channel;
        let mut reassembler = Reassembler::new();
        let mut buf = vec![0u8; self.read_buffer_size];

        loop {
            let read = if reassembler.has_pending() {
                match tokio::time::timeout(self.frame_timeout, reader.read(&mut buf)).await {
                    Ok(read) => read,
                    Err(_) => {
                        return Err(GatewayError::FrameTimeout {
                            channel,
                            pending: reassembler.discard(),
                            timeout: self.frame_timeout,
                        })
                    }
                }
            } else {
                reader.read(&mut buf).await
            };

            let n = match read {
                Ok(0) if reassembler.has_pending() => {
                    return Err(GatewayError::PrematureClose {
                        channel,
                        pending: reassembler.discard(),
                    })
                }
                Ok(0) => {
                    debug!(channel, "Upstream closed");
                    return Ok(());
                }
                Ok(n) => n,
                Err(source) => {
                    reassembler.discard();
                    return Err(GatewayError::UpstreamRead { channel, source });
                }
            };

            self.stats.add_bytes_down(n);
            trace!(channel, "Read {} bytes from upstream", n);

            for unit in reassembler.feed(&buf[..n]) {
                self.route(unit).await?;
            }
        }
    }

    async fn route(&self, unit: Unit) -> GatewayResult<()> {
        match unit {
            Unit::Control(text) => {
                let mut envelope = Status::Ok.envelope();
                if let Some(seq) = self.registry.last_sequence(self.channel)? {
                    envelope = envelope.with_header(HEADER_SEQ, seq);
                }
                let envelope = envelope.with_payload(text);
                trace!(
                    channel = self.channel,
                    "Relaying {} bytes of control text",
                    envelope.payload.len()
                );
                self.control.send_envelope(&envelope).await?;
            }
            Unit::Frame(frame) => match self.registry.data_sender(self.channel)? {
                Some(data) => {
                    let len = frame.len();
                    if data.send_binary(frame).await.is_ok() {
                        self.stats.frame_forwarded();
                        trace!(channel = self.channel, "Forwarded {} byte frame", len);
                    } else {
                        self.stats.frame_dropped();
                        debug!(channel = self.channel, "Data connection gone, frame dropped");
                    }
                }
                None => {
                    self.stats.frame_dropped();
                    trace!(channel = self.channel, "No data connection bound, frame dropped");
                }
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use wsp_transport::{MemoryPeer, TunnelConnection, TunnelFrame, TunnelRole};

    struct Fixture {
        registry: Arc<SessionRegistry>,
        channel: ChannelId,
        control: MemoryPeer,
        control_conn: TunnelConnection,
    }

    fn fixture() -> Fixture {
        let addr: SocketAddr = "127.0.0.1:554".parse().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let (upstream, _rx) = UpstreamHandle::channel(addr, 4);
        let (conn, control) = TunnelConnection::in_memory(TunnelRole::Control, addr);
        let channel = registry.open("camera:554".to_string(), upstream, conn.sender());
        Fixture {
            registry,
            channel,
            control,
            control_conn: conn,
        }
    }

    fn reader(fx: &Fixture, config: &GatewayConfig) -> UpstreamReader {
        let control = fx.control_conn.sender();
        UpstreamReader::new(fx.channel, fx.registry.clone(), control, config).unwrap()
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamUnreachable { .. }));
        assert_eq!(err.status().code(), 502);
    }

    #[tokio::test]
    async fn test_connect_bracketed_ipv4_host() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let stream = connect("[127.0.0.1]", port, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_control_text_echoes_last_seq() {
        let mut fx = fixture();
        fx.registry.record_sequence(fx.channel, "5").unwrap();
        let (mut upstream, gateway_side) = duplex(1024);
        let task = tokio::spawn(reader(&fx, &GatewayConfig::default()).run(gateway_side));

        let reply = b"RTSP/1.0 200 OK\r\nCSeq: 5\r\n\r\n";
        upstream.write_all(reply).await.unwrap();

        let env = fx.control.recv_envelope().await.unwrap().unwrap();
        assert_eq!(env.code(), Some(200));
        assert_eq!(env.header(HEADER_SEQ), Some("5"));
        assert_eq!(&env.payload[..], &reply[..]);

        drop(upstream);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_control_text_without_seq() {
        let mut fx = fixture();
        let (mut upstream, gateway_side) = duplex(1024);
        tokio::spawn(reader(&fx, &GatewayConfig::default()).run(gateway_side));

        upstream.write_all(b"RTSP/1.0 200 OK\r\n\r\n").await.unwrap();

        let env = fx.control.recv_envelope().await.unwrap().unwrap();
        assert_eq!(env.header(HEADER_SEQ), None);
    }

    #[tokio::test]
    async fn test_frames_forwarded_to_bound_data_connection() {
        let fx = fixture();
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let (data_conn, mut data_peer) = TunnelConnection::in_memory(TunnelRole::Data, addr);
        fx.registry.bind(fx.channel, data_conn.sender()).unwrap();

        let (mut upstream, gateway_side) = duplex(1024);
        tokio::spawn(reader(&fx, &GatewayConfig::default()).run(gateway_side));

        let frame = [0x24, 0x00, 0x00, 0x06, 1, 2, 3, 4, 5, 6];
        upstream.write_all(&frame[..3]).await.unwrap();
        upstream.flush().await.unwrap();
        tokio::task::yield_now().await;
        upstream.write_all(&frame[3..]).await.unwrap();

        match data_peer.recv().await {
            Some(TunnelFrame::Binary(data)) => assert_eq!(&data[..], &frame[..]),
            other => panic!("Expected binary frame, got {:?}", other),
        }
        let stats = fx.registry.lookup(fx.channel).unwrap().stats;
        assert_eq!(stats.frames_forwarded, 1);
        assert_eq!(stats.bytes_down, 10);
    }

    #[tokio::test]
    async fn test_frames_dropped_without_binding() {
        let fx = fixture();
        let (mut upstream, gateway_side) = duplex(1024);
        let task = tokio::spawn(reader(&fx, &GatewayConfig::default()).run(gateway_side));

        upstream
            .write_all(&[0x24, 0x00, 0x00, 0x01, 0xff, 0x24, 0x01, 0x00, 0x00])
            .await
            .unwrap();
        drop(upstream);

        assert!(task.await.unwrap().is_ok());
        assert_eq!(fx.registry.lookup(fx.channel).unwrap().stats.frames_dropped, 2);
    }

    #[tokio::test]
    async fn test_premature_close_reports_discarded_bytes() {
        let fx = fixture();
        let (mut upstream, gateway_side) = duplex(1024);
        let task = tokio::spawn(reader(&fx, &GatewayConfig::default()).run(gateway_side));

        upstream.write_all(&[0x24, 0x00, 0x00, 0x08, 1, 2]).await.unwrap();
        drop(upstream);

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            GatewayError::PrematureClose { pending: 6, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_partial_frame_times_out() {
        let fx = fixture();
        let config = GatewayConfig::default().with_frame_timeout(Duration::from_secs(1));
        let (mut upstream, gateway_side) = duplex(1024);
        let task = tokio::spawn(reader(&fx, &config).run(gateway_side));

        upstream.write_all(&[0x24, 0x00]).await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, GatewayError::FrameTimeout { pending: 2, .. }));
        drop(upstream);
    }

    #[tokio::test]
    async fn test_write_loop_counts_bytes() {
        let fx = fixture();
        let stats = fx.registry.stats(fx.channel).unwrap();
        let (handle, rx) = UpstreamHandle::channel("127.0.0.1:1".parse().unwrap(), 4);
        let (mut upstream, gateway_side) = duplex(1024);
        let writer = tokio::spawn(write_loop(fx.channel, gateway_side, rx, stats.clone()));

        handle
            .write(fx.channel, Bytes::from_static(b"OPTIONS"))
            .await
            .unwrap();
        drop(handle);
        writer.await.unwrap();

        let mut received = Vec::new();
        upstream.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"OPTIONS");
        assert_eq!(stats.snapshot().bytes_up, 7);
    }
}
