//! Gateway accept loop

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wsp_transport::{TransportError, TunnelConnection, TunnelListener, TunnelRole};

use crate::config::GatewayConfig;
use crate::control::ControlHandler;
use crate::data::DataHandler;
use crate::error::GatewayResult;
use crate::registry::SessionRegistry;

/// How long shutdown waits on a full outbound queue per tunnel connection
const PEER_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Owns the session registry and dispatches accepted connections by role
pub struct Gateway {
    registry: Arc<SessionRegistry>,
    control: Arc<ControlHandler>,
    data: Arc<DataHandler>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> GatewayResult<Self> {
        config.validate()?;

        let config = Arc::new(config);
        let registry = Arc::new(SessionRegistry::new());
        Ok(Self {
            control: Arc::new(ControlHandler::new(registry.clone(), config)),
            data: Arc::new(DataHandler::new(registry.clone())),
            registry,
        })
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Serve one connection on its own task
    pub fn handle_connection(&self, conn: TunnelConnection) -> JoinHandle<()> {
        match conn.role() {
            TunnelRole::Control => {
                let handler = self.control.clone();
                tokio::spawn(async move { handler.handle_connection(conn).await })
            }
            TunnelRole::Data => {
                let handler = self.data.clone();
                tokio::spawn(async move { handler.handle_connection(conn).await })
            }
        }
    }

    /// Accept connections until the listener closes
    pub async fn serve<L: TunnelListener>(&self, listener: &L) {
        loop {
            match listener.accept().await {
                Ok(conn) => {
                    self.handle_connection(conn);
                }
                Err(TransportError::ConnectionClosed) => {
                    info!("Listener closed, no longer accepting connections");
                    return;
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Accept connections until `shutdown` resolves
    ///
    /// Every channel is then closed and the tunnel connections attached to
    /// one are asked to close.
    pub async fn serve_with_shutdown<L, F>(&self, listener: &L, shutdown: F)
    where
        L: TunnelListener,
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = self.serve(listener) => {}
            _ = shutdown => {
                info!("Shutdown requested");
            }
        }

        let peers = self.registry.peers();
        let closed = self.registry.close_all();
        if closed > 0 {
            warn!("Closed {} open channel(s) on shutdown", closed);
        }

        for peer in peers {
            if tokio::time::timeout(PEER_CLOSE_TIMEOUT, peer.close()).await.is_err() {
                debug!(connection = %peer.connection_id(), "Tunnel connection did not take close");
            }
        }
    }
}
