//! Integration tests for the WebSocket listener
//!
//! A real tokio-tungstenite client connects over loopback and negotiates its
//! tunnel role through the `Sec-WebSocket-Protocol` header.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use wsp_proto::{Envelope, Status};
use wsp_transport::{TunnelConnection, TunnelFrame, TunnelListener, TunnelRole};
use wsp_transport_websocket::{WebSocketConfig, WebSocketListener};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn bind(config: WebSocketConfig) -> (Arc<WebSocketListener>, SocketAddr) {
    let listener =
        WebSocketListener::new("127.0.0.1:0".parse().unwrap(), Arc::new(config)).unwrap();
    let addr = listener.local_addr().unwrap();
    (Arc::new(listener), addr)
}

async fn connect(
    addr: SocketAddr,
    path: &str,
    protocol: &str,
) -> Result<Client, tokio_tungstenite::tungstenite::Error> {
    let mut request = format!("ws://{}{}", addr, path).into_client_request()?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_str(protocol).unwrap(),
    );
    let (ws, response) = tokio_tungstenite::connect_async(request).await?;
    assert_eq!(
        response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok()),
        Some(protocol)
    );
    Ok(ws)
}

fn spawn_accept(listener: &Arc<WebSocketListener>) -> tokio::task::JoinHandle<TunnelConnection> {
    let listener = listener.clone();
    tokio::spawn(async move { listener.accept().await.unwrap() })
}

#[tokio::test]
async fn test_control_role_text_exchange() {
    init_tracing();
    let (listener, addr) = bind(WebSocketConfig::plain());
    let accepted = spawn_accept(&listener);

    let mut client = connect(addr, "/", "control").await.unwrap();
    let mut conn = timeout(Duration::from_secs(5), accepted)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conn.role(), TunnelRole::Control);

    let request = Envelope::request("INIT")
        .with_header("host", "127.0.0.1")
        .with_header("port", "554")
        .with_header("seq", "1");
    let wire = String::from_utf8(request.encode().to_vec()).unwrap();
    client.send(Message::Text(wire)).await.unwrap();

    let frame = timeout(Duration::from_secs(5), conn.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(frame, TunnelFrame::Text(_)));
    assert_eq!(frame.to_envelope().unwrap(), request);

    let reply = Status::Ok.envelope().with_header("seq", "1");
    conn.sender().send_envelope(&reply).await.unwrap();

    match timeout(Duration::from_secs(5), client.next()).await.unwrap() {
        Some(Ok(Message::Text(text))) => {
            assert_eq!(Envelope::decode(text.as_bytes()).unwrap(), reply);
        }
        other => panic!("Expected text reply, got {:?}", other),
    }
}

#[tokio::test]
async fn test_data_role_binary_passthrough() {
    init_tracing();
    let (listener, addr) = bind(WebSocketConfig::plain());
    let accepted = spawn_accept(&listener);

    let mut client = connect(addr, "/", "data").await.unwrap();
    let conn = timeout(Duration::from_secs(5), accepted)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conn.role(), TunnelRole::Data);

    let frame = vec![b'$', 0, 0, 2, 0xde, 0xad];
    conn.sender()
        .send_binary(bytes::Bytes::from(frame.clone()))
        .await
        .unwrap();

    match timeout(Duration::from_secs(5), client.next()).await.unwrap() {
        Some(Ok(Message::Binary(data))) => assert_eq!(data, frame),
        other => panic!("Expected binary frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_role_rejected_and_listener_keeps_accepting() {
    init_tracing();
    let (listener, addr) = bind(WebSocketConfig::plain());
    let accepted = spawn_accept(&listener);

    let rejected = connect(addr, "/", "rtsp").await;
    assert!(rejected.is_err());

    let _client = connect(addr, "/", "data").await.unwrap();
    let conn = timeout(Duration::from_secs(5), accepted)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conn.role(), TunnelRole::Data);
}

#[tokio::test]
async fn test_path_restriction() {
    init_tracing();
    let (listener, addr) = bind(WebSocketConfig::plain().with_path("/wsp"));
    let accepted = spawn_accept(&listener);

    assert!(connect(addr, "/elsewhere", "control").await.is_err());

    let _client = connect(addr, "/wsp", "control").await.unwrap();
    let conn = timeout(Duration::from_secs(5), accepted)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conn.role(), TunnelRole::Control);
}

#[tokio::test]
async fn test_client_close_ends_connection() {
    init_tracing();
    let (listener, addr) = bind(WebSocketConfig::plain());
    let accepted = spawn_accept(&listener);

    let mut client = connect(addr, "/", "control").await.unwrap();
    let mut conn = timeout(Duration::from_secs(5), accepted)
        .await
        .unwrap()
        .unwrap();

    client.close(None).await.unwrap();

    let next = timeout(Duration::from_secs(5), conn.recv()).await.unwrap();
    assert!(next.is_none());
}

#[tokio::test]
async fn test_silent_peer_does_not_delay_other_clients() {
    init_tracing();
    let (listener, addr) = bind(
        WebSocketConfig::plain().with_handshake_timeout(Duration::from_secs(10)),
    );
    let accepted = spawn_accept(&listener);

    let _silent = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let _client = timeout(Duration::from_secs(2), connect(addr, "/", "control"))
        .await
        .expect("handshake stalled behind a silent peer")
        .unwrap();
    let conn = timeout(Duration::from_secs(2), accepted)
        .await
        .expect("accept stalled behind a silent peer")
        .unwrap();
    assert_eq!(conn.role(), TunnelRole::Control);
}

#[tokio::test]
async fn test_many_concurrent_handshakes() {
    init_tracing();
    let (listener, addr) = bind(WebSocketConfig::plain());

    let clients: Vec<_> = (0..8)
        .map(|_| tokio::spawn(connect(addr, "/", "data")))
        .collect();

    for _ in 0..8 {
        let conn = timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conn.role(), TunnelRole::Data);
    }
    for client in clients {
        assert!(client.await.unwrap().is_ok());
    }
}
