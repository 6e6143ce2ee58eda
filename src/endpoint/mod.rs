//! Network peer descriptors
//!
//! An [`Endpoint`] names a remote peer (or, for servers, the local bind
//! address): a free-form id, a resolved IP address, a port and an optional
//! local interface used for multicast binding.

pub mod iface;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

pub use iface::LocalInterface;

/// Identity and address of a network peer
///
/// The address is always resolved at construction time. Equality covers
/// every field; ordering sorts by `id` first so peer listings are
/// deterministic.
///
/// # Examples
///
/// ```
/// use peerlink::Endpoint;
///
/// let ep = Endpoint::localhost("sensor", 10110);
/// assert_eq!(ep.id(), "sensor");
/// assert_eq!(ep.port(), 10110);
/// assert!(ep.address().is_loopback());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    id: String,
    address: IpAddr,
    port: u16,
    local_interface: Option<LocalInterface>,
}

impl Endpoint {
    /// Endpoint on the IPv4 loopback address
    pub fn localhost(id: impl Into<String>, port: u16) -> Self {
        Endpoint {
            id: id.into(),
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            local_interface: None,
        }
    }

    /// Resolve a host name (or IP literal) into an endpoint
    ///
    /// When the name resolves to several addresses the first IPv4 address
    /// wins, falling back to the first address of any family.
    ///
    /// # Errors
    ///
    /// - [`TransportError::HostResolution`] - Name lookup failed or returned nothing
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use peerlink::Endpoint;
    ///
    /// let ep = Endpoint::resolve("plotter", "localhost", 2000)?;
    /// # Ok::<(), peerlink::TransportError>(())
    /// ```
    pub fn resolve(id: impl Into<String>, host: &str, port: u16) -> Result<Self> {
        Ok(Endpoint {
            id: id.into(),
            address: resolve_host(host, port)?,
            port,
            local_interface: None,
        })
    }

    /// Resolve a host and bind the endpoint to a local interface
    ///
    /// `interface` is either a dotted IPv4 literal configured on this host
    /// or an interface name. Only meaningful for multicast UDP sockets.
    ///
    /// # Errors
    ///
    /// - [`TransportError::HostResolution`] - Host lookup failed
    /// - [`TransportError::Interface`] - No matching local interface
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use peerlink::Endpoint;
    ///
    /// let group = Endpoint::with_interface("ais", "239.192.0.4", 60004, "eth0")?;
    /// assert!(group.is_multicast());
    /// # Ok::<(), peerlink::TransportError>(())
    /// ```
    pub fn with_interface(
        id: impl Into<String>,
        host: &str,
        port: u16,
        interface: &str,
    ) -> Result<Self> {
        let address = resolve_host(host, port)?;
        let local_interface = iface::resolve(interface)?;
        Ok(Endpoint {
            id: id.into(),
            address,
            port,
            local_interface: Some(local_interface),
        })
    }

    /// Endpoint for an already resolved socket address
    pub fn from_socket_addr(id: impl Into<String>, addr: SocketAddr) -> Self {
        Endpoint {
            id: id.into(),
            address: addr.ip(),
            port: addr.port(),
            local_interface: None,
        }
    }

    /// Endpoint for a peer discovered by a server, labelled `ip:port`
    pub fn from_peer(addr: SocketAddr) -> Self {
        Self::from_socket_addr(addr.to_string(), addr)
    }

    /// Human-readable label
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Resolved IP address
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// Port number
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address and port as a socket address
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Local interface binding, if any
    pub fn local_interface(&self) -> Option<&LocalInterface> {
        self.local_interface.as_ref()
    }

    /// Whether the address is a multicast group
    pub fn is_multicast(&self) -> bool {
        self.address.is_multicast()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.socket_addr())
    }
}

fn resolve_host(host: &str, port: u16) -> Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    let resolution_error = |source| TransportError::HostResolution {
        host: host.to_string(),
        source,
    };

    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(resolution_error)?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .map(|a| a.ip())
        .ok_or_else(|| {
            resolution_error(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no addresses returned",
            ))
        })
}
