//! Settings for the registry and overlay node applications.

use overlay_core::{wire::DEFAULT_MAX_FRAME_LENGTH, PeerAddress, RING_SIZE};
use std::time::Duration;

pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
pub const DEFAULT_REGISTRY_PORT: u16 = 5000;
pub const DEFAULT_TABLE_SIZE: usize = 3;
pub const DEFAULT_QUIESCENCE_DELAY: Duration = Duration::from_secs(5);

/// Configuration for a [`Registry`](crate::applications::Registry).
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// The interface to listen on
    pub listen_host: String,
    /// The port to listen on. Zero picks an ephemeral port.
    pub port: u16,
    /// IDs are drawn from `0..ring_size`. At most [`RING_SIZE`].
    pub ring_size: u32,
    /// The routing table size used when `setup-overlay` is given none
    pub default_table_size: usize,
    /// How long to wait after the last node finishes sending before asking
    /// for traffic summaries
    pub quiescence_delay: Duration,
    pub max_frame_length: usize,
    /// Whether to print notices to stdout
    pub output: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            listen_host: DEFAULT_LISTEN_HOST.into(),
            port: DEFAULT_REGISTRY_PORT,
            ring_size: RING_SIZE,
            default_table_size: DEFAULT_TABLE_SIZE,
            quiescence_delay: DEFAULT_QUIESCENCE_DELAY,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            output: true,
        }
    }
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen_host(mut self, host: impl Into<String>) -> Self {
        self.listen_host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn ring_size(mut self, ring_size: u32) -> Self {
        self.ring_size = ring_size;
        self
    }

    pub fn default_table_size(mut self, size: usize) -> Self {
        self.default_table_size = size;
        self
    }

    pub fn quiescence_delay(mut self, delay: Duration) -> Self {
        self.quiescence_delay = delay;
        self
    }

    pub fn max_frame_length(mut self, len: usize) -> Self {
        self.max_frame_length = len;
        self
    }

    pub fn output(mut self, output: bool) -> Self {
        self.output = output;
        self
    }
}

/// Configuration for an [`OverlayNode`](crate::applications::OverlayNode).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub registry: PeerAddress,
    /// The interface to listen for peers on. The port is always ephemeral.
    pub listen_host: String,
    pub max_frame_length: usize,
    /// Whether to print notices to stdout
    pub output: bool,
}

impl NodeConfig {
    pub fn new(registry: PeerAddress) -> Self {
        Self {
            registry,
            listen_host: DEFAULT_LISTEN_HOST.into(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            output: true,
        }
    }

    pub fn listen_host(mut self, host: impl Into<String>) -> Self {
        self.listen_host = host.into();
        self
    }

    pub fn max_frame_length(mut self, len: usize) -> Self {
        self.max_frame_length = len;
        self
    }

    pub fn output(mut self, output: bool) -> Self {
        self.output = output;
        self
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new(PeerAddress::new("127.0.0.1", DEFAULT_REGISTRY_PORT))
    }
}
