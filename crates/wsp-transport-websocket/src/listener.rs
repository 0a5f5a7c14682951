//! WebSocket listener implementation

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tracing::{debug, info, warn};
use wsp_transport::{
    TransportError, TransportResult, TunnelConnection, TunnelListener, TunnelRole,
};

use crate::config::WebSocketConfig;
use crate::connection::WebSocketConnection;

/// Handshaken connections waiting for `accept`
const READY_QUEUE_DEPTH: usize = 64;

/// WebSocket listener for accepting tunnel connections
///
/// Each TLS and WebSocket handshake runs in its own task, so a peer that
/// connects and stays silent never delays other peers.
pub struct WebSocketListener {
    tcp_listener: TcpListener,
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
    config: Arc<WebSocketConfig>,
    ready_tx: mpsc::Sender<TunnelConnection>,
    ready_rx: Mutex<mpsc::Receiver<TunnelConnection>>,
}

impl std::fmt::Debug for WebSocketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketListener")
            .field("local_addr", &self.tcp_listener.local_addr())
            .field("tls", &self.tls_acceptor.is_some())
            .finish()
    }
}

impl WebSocketListener {
    pub fn new(bind_addr: SocketAddr, config: Arc<WebSocketConfig>) -> TransportResult<Self> {
        config.validate()?;

        let tls_acceptor = config.build_tls_acceptor()?;

        // Create TCP listener synchronously using std
        let std_listener = std::net::TcpListener::bind(bind_addr).map_err(|e| {
            let port = bind_addr.port();
            let address = bind_addr.ip().to_string();
            TransportError::BindError {
                address,
                port,
                reason: e.to_string(),
            }
        })?;

        std_listener.set_nonblocking(true).map_err(|e| {
            TransportError::ConfigurationError(format!("Failed to set nonblocking: {}", e))
        })?;

        let tcp_listener = TcpListener::from_std(std_listener).map_err(TransportError::IoError)?;

        let local_addr = tcp_listener.local_addr().map_err(TransportError::IoError)?;
        info!(
            "WebSocket listener bound to {}://{}{}",
            if tls_acceptor.is_some() { "wss" } else { "ws" },
            local_addr,
            config.path.as_deref().unwrap_or("/")
        );

        let (ready_tx, ready_rx) = mpsc::channel(READY_QUEUE_DEPTH);

        Ok(Self {
            tcp_listener,
            tls_acceptor,
            config,
            ready_tx,
            ready_rx: Mutex::new(ready_rx),
        })
    }

    /// Run the handshake for one TCP connection in the background
    fn spawn_handshake(&self, tcp_stream: TcpStream, remote_addr: SocketAddr) {
        let tls_acceptor = self.tls_acceptor.clone();
        let config = self.config.clone();
        let ready_tx = self.ready_tx.clone();

        tokio::spawn(async move {
            let outcome = tokio::time::timeout(
                config.handshake_timeout,
                handshake(tls_acceptor, &config, tcp_stream, remote_addr),
            )
            .await;

            match outcome {
                Ok(Ok(connection)) => {
                    info!(
                        "WebSocket {} connection established from {} ({})",
                        connection.role(),
                        remote_addr,
                        connection.connection_id()
                    );
                    if ready_tx.send(connection).await.is_err() {
                        debug!("Listener closed before {} was accepted", remote_addr);
                    }
                }
                Ok(Err(TransportError::UnrecognizedRole(role))) => {
                    warn!(
                        "Rejected connection from {}: unrecognized role {:?}",
                        remote_addr, role
                    );
                }
                Ok(Err(e)) => {
                    warn!("Handshake failed from {}: {}", remote_addr, e);
                }
                Err(_) => {
                    warn!("Handshake timed out from {}", remote_addr);
                }
            }
        });
    }
}

async fn handshake(
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
    config: &WebSocketConfig,
    tcp_stream: TcpStream,
    remote_addr: SocketAddr,
) -> TransportResult<TunnelConnection> {
    match tls_acceptor {
        Some(acceptor) => {
            let tls_stream = acceptor
                .accept(tcp_stream)
                .await
                .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;
            debug!("TLS handshake complete from {}", remote_addr);
            upgrade(config, tls_stream, remote_addr).await
        }
        None => upgrade(config, tcp_stream, remote_addr).await,
    }
}

/// Upgrade a byte stream, negotiating the tunnel role
async fn upgrade<S>(
    config: &WebSocketConfig,
    stream: S,
    remote_addr: SocketAddr,
) -> TransportResult<TunnelConnection>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut negotiated: Option<TransportResult<TunnelRole>> = None;

    let callback = |req: &Request, mut response: Response| {
        if !config.accepts_path(req.uri().path()) {
            return Err(error_response(StatusCode::NOT_FOUND, "unknown path"));
        }

        let role = negotiate_role(req);
        let result = match &role {
            Ok(role) => {
                response.headers_mut().insert(
                    SEC_WEBSOCKET_PROTOCOL,
                    HeaderValue::from_static(role.as_str()),
                );
                Ok(response)
            }
            Err(_) => Err(error_response(
                StatusCode::BAD_REQUEST,
                "unsupported tunnel role",
            )),
        };
        negotiated = Some(role);
        result
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        callback,
        Some(config.protocol_config()),
    )
    .await;

    // A rejected role is reported before the generic handshake failure
    match (negotiated, ws_stream) {
        (Some(Err(e)), _) => Err(e),
        (Some(Ok(role)), Ok(ws_stream)) => {
            Ok(WebSocketConnection::spawn(ws_stream, role, remote_addr))
        }
        (_, Err(e)) => Err(TransportError::HandshakeError(e.to_string())),
        (None, Ok(_)) => Err(TransportError::HandshakeError(
            "tunnel role was not negotiated".to_string(),
        )),
    }
}

/// Pick the first offered subprotocol that names a tunnel role
fn negotiate_role(req: &Request) -> TransportResult<TunnelRole> {
    let offered = req
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .collect::<Vec<_>>();

    offered
        .iter()
        .find_map(|value| value.parse::<TunnelRole>().ok())
        .ok_or_else(|| TransportError::UnrecognizedRole(offered.join(",")))
}

fn error_response(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

#[async_trait]
impl TunnelListener for WebSocketListener {
    async fn accept(&self) -> TransportResult<TunnelConnection> {
        let mut ready = self.ready_rx.lock().await;
        loop {
            tokio::select! {
                Some(connection) = ready.recv() => return Ok(connection),
                accepted = self.tcp_listener.accept() => {
                    let (tcp_stream, remote_addr) = accepted.map_err(TransportError::IoError)?;
                    debug!("Incoming TCP connection from {}", remote_addr);
                    self.spawn_handshake(tcp_stream, remote_addr);
                }
            }
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.tcp_listener
            .local_addr()
            .map_err(TransportError::IoError)
    }
}
