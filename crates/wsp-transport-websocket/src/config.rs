//! WebSocket transport configuration

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as ProtocolConfig;
use wsp_transport::{TransportError, TransportResult};

/// WebSocket listener configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Server certificate path; TLS is enabled when both paths are set
    pub server_cert_path: Option<String>,

    /// Server private key path
    pub server_key_path: Option<String>,

    /// Accepted request path; any path when `None`
    pub path: Option<String>,

    /// Time allowed for the TLS + WebSocket handshake
    pub handshake_timeout: Duration,

    /// Maximum message size
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self::plain()
    }
}

impl WebSocketConfig {
    /// Plain `ws://` listener accepting any path
    pub fn plain() -> Self {
        Self {
            server_cert_path: None,
            server_key_path: None,
            path: None,
            handshake_timeout: Duration::from_secs(10),
            max_message_size: 16 * 1024 * 1024, // 16MB
        }
    }

    /// `wss://` listener using the given PEM files
    pub fn tls(cert_path: &str, key_path: &str) -> Self {
        Self {
            server_cert_path: Some(cert_path.to_string()),
            server_key_path: Some(key_path.to_string()),
            ..Self::plain()
        }
    }

    /// Restrict upgrades to a single path
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn is_tls(&self) -> bool {
        self.server_cert_path.is_some() && self.server_key_path.is_some()
    }

    pub fn validate(&self) -> TransportResult<()> {
        if let Some(path) = &self.path {
            if !path.starts_with('/') {
                return Err(TransportError::ConfigurationError(
                    "WebSocket path must start with '/'".to_string(),
                ));
            }
        }
        if self.server_cert_path.is_some() != self.server_key_path.is_some() {
            return Err(TransportError::ConfigurationError(
                "TLS requires both a certificate and a private key".to_string(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(TransportError::ConfigurationError(
                "Maximum message size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether an upgrade request for `path` is accepted
    pub(crate) fn accepts_path(&self, path: &str) -> bool {
        match &self.path {
            None => true,
            Some(expected) => path == expected || path == format!("{}/", expected),
        }
    }

    pub(crate) fn protocol_config(&self) -> ProtocolConfig {
        let mut config = ProtocolConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config
    }

    /// Build rustls TlsAcceptor when TLS is configured
    pub(crate) fn build_tls_acceptor(&self) -> TransportResult<Option<tokio_rustls::TlsAcceptor>> {
        let (Some(cert_path), Some(key_path)) = (&self.server_cert_path, &self.server_key_path)
        else {
            return Ok(None);
        };

        ensure_crypto_provider();

        let certs = load_certs(Path::new(cert_path))?;
        let key = load_private_key(Path::new(key_path))?;

        let server_crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;

        Ok(Some(tokio_rustls::TlsAcceptor::from(Arc::new(
            server_crypto,
        ))))
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

fn load_certs(path: &Path) -> TransportResult<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open cert file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))
}

fn load_private_key(path: &Path) -> TransportResult<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open key file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))
}
