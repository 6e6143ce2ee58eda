//! Socket configuration
//!
//! Plain configuration structs with sensible defaults. They derive serde
//! traits so applications can keep them in their own configuration files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fixed timeout for establishing a TCP connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default UDP read timeout
pub const DEFAULT_UDP_READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// TCP connection settings
///
/// # Examples
///
/// ```
/// use peerlink::io::TcpConfig;
/// use std::time::Duration;
///
/// let config = TcpConfig::with_read_timeout(Duration::from_millis(500)).nodelay(true);
/// assert_eq!(config.read_timeout, Some(Duration::from_millis(500)));
/// assert!(config.nodelay);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Per-read timeout (None = block until data arrives)
    pub read_timeout: Option<Duration>,
    /// Per-write timeout (None = block until the OS accepts the data)
    pub write_timeout: Option<Duration>,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
    /// SO_RCVBUF override
    pub recv_buffer_size: Option<usize>,
    /// SO_SNDBUF override
    pub send_buffer_size: Option<usize>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            read_timeout: None,
            write_timeout: None,
            nodelay: false,
            recv_buffer_size: None,
            send_buffer_size: None,
        }
    }
}

impl TcpConfig {
    /// Config with a read timeout; a zero duration means "block forever"
    pub fn with_read_timeout(timeout: Duration) -> Self {
        Self {
            read_timeout: non_zero(timeout),
            ..Default::default()
        }
    }

    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = non_zero(timeout);
        self
    }

    pub fn buffer_sizes(mut self, recv: usize, send: usize) -> Self {
        self.recv_buffer_size = Some(recv);
        self.send_buffer_size = Some(send);
        self
    }

    /// Read timeout as accepted by `set_read_timeout`
    pub(crate) fn effective_read_timeout(&self) -> Option<Duration> {
        self.read_timeout.and_then(non_zero)
    }

    pub(crate) fn effective_write_timeout(&self) -> Option<Duration> {
        self.write_timeout.and_then(non_zero)
    }
}

/// TCP server settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpServerConfig {
    /// Settings applied to every accepted connection
    pub client: TcpConfig,
}

impl TcpServerConfig {
    pub fn with_client_config(client: TcpConfig) -> Self {
        Self { client }
    }
}

/// UDP socket settings
///
/// # Examples
///
/// ```
/// use peerlink::io::UdpConfig;
/// use std::time::Duration;
///
/// let config = UdpConfig::default();
/// assert_eq!(config.read_timeout, Duration::from_secs(1));
/// assert_eq!(config.local_port, 0);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpConfig {
    /// Per-read timeout; UDP sockets always use one
    pub read_timeout: Duration,
    /// Local port for client sockets (0 = any free port)
    pub local_port: u16,
    /// IP_MULTICAST_TTL for multicast endpoints
    pub multicast_ttl: Option<u32>,
    /// IP_MULTICAST_LOOP for multicast endpoints
    pub multicast_loop: Option<bool>,
    /// SO_RCVBUF override
    pub recv_buffer_size: Option<usize>,
    /// SO_SNDBUF override
    pub send_buffer_size: Option<usize>,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_UDP_READ_TIMEOUT,
            local_port: 0,
            multicast_ttl: None,
            multicast_loop: None,
            recv_buffer_size: None,
            send_buffer_size: None,
        }
    }
}

impl UdpConfig {
    pub fn with_read_timeout(timeout: Duration) -> Self {
        Self {
            read_timeout: timeout,
            ..Default::default()
        }
    }

    pub fn local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    pub fn multicast(mut self, ttl: u32, loopback: bool) -> Self {
        self.multicast_ttl = Some(ttl);
        self.multicast_loop = Some(loopback);
        self
    }

    pub(crate) fn effective_read_timeout(&self) -> Duration {
        non_zero(self.read_timeout).unwrap_or(DEFAULT_UDP_READ_TIMEOUT)
    }
}

fn non_zero(d: Duration) -> Option<Duration> {
    if d.is_zero() {
        None
    } else {
        Some(d)
    }
}
