//! Gateway runtime configuration

use std::time::Duration;

use crate::error::{GatewayError, GatewayResult};

/// Timeouts and buffer sizes applied to every session
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Upper bound on establishing an upstream TCP connection
    pub connect_timeout: Duration,

    /// How long an upstream may hold a partial unit before the channel is torn down
    pub frame_timeout: Duration,

    /// Size of each upstream socket read
    pub read_buffer_size: usize,

    /// Depth of the queue feeding the upstream writer task
    pub upstream_queue_depth: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            frame_timeout: Duration::from_secs(30),
            read_buffer_size: 16 * 1024, // 16KB
            upstream_queue_depth: 64,
        }
    }
}

impl GatewayConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_upstream_queue_depth(mut self, depth: usize) -> Self {
        self.upstream_queue_depth = depth;
        self
    }

    pub fn validate(&self) -> GatewayResult<()> {
        if self.connect_timeout.is_zero() {
            return Err(GatewayError::Config(
                "Connect timeout must be positive".to_string(),
            ));
        }
        if self.frame_timeout.is_zero() {
            return Err(GatewayError::Config(
                "Frame timeout must be positive".to_string(),
            ));
        }
        if self.read_buffer_size == 0 {
            return Err(GatewayError::Config(
                "Read buffer size must be positive".to_string(),
            ));
        }
        if self.upstream_queue_depth == 0 {
            return Err(GatewayError::Config(
                "Upstream queue depth must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
