//! The connector: buffer pools, idle-time policy, and the low-resource
//! flag shared by every connection of a server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use selwire::BufferPool;

/// Tunables for a [`Connector`].
#[derive(Clone)]
pub struct ConnectorConfig {
    /// Capacity of request header buffers.
    pub request_header_size: usize,
    /// Capacity of request body buffers (used while the parser is mid-body).
    pub request_buffer_size: usize,
    /// Capacity of response header buffers.
    pub response_header_size: usize,
    /// Capacity of response body buffers.
    pub response_buffer_size: usize,
    /// Default idle timeout for connections.
    pub max_idle_time: Duration,
    /// Idle timeout applied while in low-resource mode.
    pub low_resource_max_idle_time: Duration,
    /// Active-connection count that switches low-resource mode on.
    pub low_resource_connections: usize,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            request_header_size: 8 * 1024,
            request_buffer_size: 16 * 1024,
            response_header_size: 8 * 1024,
            response_buffer_size: 32 * 1024,
            max_idle_time: Duration::from_secs(30),
            low_resource_max_idle_time: Duration::from_secs(3),
            low_resource_connections: 4096,
        }
    }
}

/// Shared per-server collaborator of HTTP connections: two buffer pools and
/// the idle-time policy.
pub struct Connector {
    request_buffers: BufferPool,
    response_buffers: BufferPool,
    config: ConnectorConfig,
    low_resources: AtomicBool,
}

impl Connector {
    pub fn new(config: ConnectorConfig) -> Self {
        Connector {
            request_buffers: BufferPool::new(
                config.request_header_size,
                config.request_buffer_size,
            ),
            response_buffers: BufferPool::new(
                config.response_header_size,
                config.response_buffer_size,
            ),
            config,
            low_resources: AtomicBool::new(false),
        }
    }

    pub fn request_buffers(&self) -> &BufferPool {
        &self.request_buffers
    }

    pub fn response_buffers(&self) -> &BufferPool {
        &self.response_buffers
    }

    pub fn max_idle_time(&self) -> Duration {
        self.config.max_idle_time
    }

    pub fn low_resource_max_idle_time(&self) -> Duration {
        self.config.low_resource_max_idle_time
    }

    pub fn low_resource_connections(&self) -> usize {
        self.config.low_resource_connections
    }

    /// Low-resource mode shortens effective idle timeouts; toggled by the
    /// acceptor from the selector's registration count.
    pub fn is_low_resources(&self) -> bool {
        self.low_resources.load(Ordering::Acquire)
    }

    pub fn set_low_resources(&self, low: bool) {
        self.low_resources.store(low, Ordering::Release);
    }
}
