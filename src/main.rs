//! WSP Gateway - WebSocket to TCP tunnelling gateway
//!
//! Accepts WebSocket `control` and `data` connections, opens upstream TCP
//! channels on request and relays their traffic back to the tunnel peers.

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wsp_control::{Gateway, GatewayConfig};
use wsp_transport_websocket::{WebSocketConfig, WebSocketListener};

const DEFAULT_LISTEN: &str = "0.0.0.0:1104";

/// WSP gateway - tunnels TCP connections over WebSocket
#[derive(Parser, Debug)]
#[command(name = "wsp-gateway")]
#[command(about = "WSP gateway - tunnels TCP connections over WebSocket")]
#[command(version)]
#[command(long_about = r#"
WSP gateway accepts WebSocket connections from clients that cannot open raw
TCP sockets. A `control` connection opens an upstream TCP channel and writes
to it; a `data` connection joins a channel to receive its binary frames.

EXAMPLES:
  # Plain WebSocket on the default port
  wsp-gateway

  # TLS with a restricted path
  wsp-gateway --listen 0.0.0.0:443 \
    --tls-cert cert.pem --tls-key key.pem --path /wsp

  # Start using a config file
  wsp-gateway --config gateway.yaml --log-level debug

ENVIRONMENT VARIABLES:
  WSP_LISTEN          Listen address (host:port)
  WSP_CONFIG          Configuration file (YAML)
  WSP_TLS_CERT        TLS certificate (PEM)
  WSP_TLS_KEY         TLS private key (PEM)
  WSP_PATH            Accepted WebSocket path
"#)]
struct Args {
    /// Address to accept WebSocket connections on [default: 0.0.0.0:1104]
    #[arg(long, env = "WSP_LISTEN")]
    listen: Option<SocketAddr>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c', env = "WSP_CONFIG")]
    config: Option<PathBuf>,

    /// TLS certificate file (PEM); enables wss:// together with --tls-key
    #[arg(long, env = "WSP_TLS_CERT")]
    tls_cert: Option<String>,

    /// TLS private key file (PEM)
    #[arg(long, env = "WSP_TLS_KEY")]
    tls_key: Option<String>,

    /// Only accept upgrades on this path (e.g., /wsp)
    #[arg(long, env = "WSP_PATH")]
    path: Option<String>,

    /// Upstream connect timeout in seconds [default: 10]
    #[arg(long, env = "WSP_CONNECT_TIMEOUT")]
    connect_timeout: Option<u64>,

    /// Seconds an upstream may stall mid-frame before its channel is closed [default: 30]
    #[arg(long, env = "WSP_FRAME_TIMEOUT")]
    frame_timeout: Option<u64>,

    /// WebSocket handshake timeout in seconds [default: 10]
    #[arg(long, env = "WSP_HANDSHAKE_TIMEOUT")]
    handshake_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "WSP_LOG_LEVEL")]
    log_level: String,
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    listen: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    tls: Option<TlsConfigFile>,

    #[serde(default)]
    timeouts: TimeoutsConfigFile,

    /// Upstream read size in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    read_buffer_size: Option<usize>,

    /// Largest accepted WebSocket message in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    max_message_size: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TlsConfigFile {
    cert: String,
    key: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TimeoutsConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    connect_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    frame_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    handshake_secs: Option<u64>,
}

/// Fully resolved runtime settings
#[derive(Debug)]
struct Settings {
    listen: SocketAddr,
    gateway: GatewayConfig,
    websocket: WebSocketConfig,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from YAML file
fn load_config_file(path: &PathBuf) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge CLI args with config file, giving precedence to CLI args
fn build_settings(args: Args) -> Result<Settings> {
    let file = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    let listen = match args.listen.or(file.listen) {
        Some(listen) => listen,
        None => DEFAULT_LISTEN
            .parse()
            .context("Invalid default listen address")?,
    };

    let (file_cert, file_key) = match file.tls {
        Some(tls) => (Some(tls.cert), Some(tls.key)),
        None => (None, None),
    };

    let mut websocket = WebSocketConfig::plain();
    websocket.server_cert_path = args.tls_cert.or(file_cert);
    websocket.server_key_path = args.tls_key.or(file_key);
    websocket.path = args.path.or(file.path);
    if let Some(secs) = args.handshake_timeout.or(file.timeouts.handshake_secs) {
        websocket = websocket.with_handshake_timeout(Duration::from_secs(secs));
    }
    if let Some(size) = file.max_message_size {
        websocket = websocket.with_max_message_size(size);
    }
    websocket
        .validate()
        .context("Invalid WebSocket configuration")?;

    let mut gateway = GatewayConfig::default();
    if let Some(secs) = args.connect_timeout.or(file.timeouts.connect_secs) {
        gateway = gateway.with_connect_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = args.frame_timeout.or(file.timeouts.frame_secs) {
        gateway = gateway.with_frame_timeout(Duration::from_secs(secs));
    }
    if let Some(size) = file.read_buffer_size {
        gateway = gateway.with_read_buffer_size(size);
    }
    gateway
        .validate()
        .context("Invalid gateway configuration")?;

    Ok(Settings {
        listen,
        gateway,
        websocket,
    })
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down..."),
        Err(e) => {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;

    info!("WSP gateway starting...");

    let settings = build_settings(args).context("Failed to build gateway configuration")?;

    info!(
        "Connect timeout: {:?}, frame timeout: {:?}",
        settings.gateway.connect_timeout, settings.gateway.frame_timeout
    );

    let listener = WebSocketListener::new(settings.listen, Arc::new(settings.websocket))
        .context("Failed to start WebSocket listener")?;
    let gateway = Gateway::new(settings.gateway).context("Failed to create gateway")?;

    gateway
        .serve_with_shutdown(&listener, shutdown_signal())
        .await;

    info!("WSP gateway stopped");
    Ok(())
}
