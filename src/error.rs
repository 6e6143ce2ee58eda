//! Error types for transport operations
//!
//! This module defines every error the transport layer can report, whether
//! synchronously (constructors, `start`, `send`) or through a listener's
//! `on_exception` callback.

use thiserror::Error;

/// Transport error types
///
/// Construction-time and caller-thread failures are returned directly.
/// Failures of a running reception loop are never returned; they reach the
/// application as exception events.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Host name could not be resolved while building an [`Endpoint`](crate::Endpoint)
    ///
    /// # Example
    /// ```no_run
    /// # use peerlink::TransportError;
    /// # use std::io;
    /// let err = TransportError::HostResolution {
    ///     host: "no-such-host.invalid".to_string(),
    ///     source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
    /// };
    /// ```
    #[error("Cannot resolve host {host}: {source}")]
    HostResolution {
        /// Host name as given by the caller
        host: String,
        /// Underlying resolver error
        #[source]
        source: std::io::Error,
    },

    /// Local interface specification could not be resolved
    ///
    /// Raised when the interface is neither a configured IPv4 address nor
    /// the name of an interface carrying an IPv4 address.
    #[error("Invalid local interface: {0}")]
    Interface(String),

    /// I/O error while creating, binding, connecting or writing a socket
    ///
    /// Common scenarios:
    /// - Peer not listening at the endpoint address
    /// - Connect attempt exceeded the fixed 2 s connect timeout
    /// - Local port already in use
    /// - Peer closed the connection while sending
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `send` was called while no socket is open
    ///
    /// The component was never started, has been stopped, or its reception
    /// loop has terminated.
    #[error("Not connected")]
    NotConnected,

    /// Payload does not fit in one message
    ///
    /// TCP frames carry a 32-bit length prefix; UDP datagrams are limited
    /// to [`MAX_DATAGRAM_SIZE`](crate::io::udp_client::MAX_DATAGRAM_SIZE).
    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge {
        /// Payload size in bytes
        size: usize,
        /// Maximum allowed size in bytes
        max: usize,
    },

    /// Stream reached end-of-file
    ///
    /// The peer closed the connection. Reported through `on_exception`; the
    /// reception loop has terminated and the socket is closed.
    #[error("Connection lost")]
    ConnectionLost,

    /// Too many consecutive failed reads
    ///
    /// The watchdog distinguishes a dead peer from transient partial reads.
    /// Reported through `on_exception`; the reception loop has terminated.
    #[error("Broken link after {failures} consecutive failed reads")]
    BrokenLink {
        /// Number of consecutive failures observed
        failures: u32,
    },

    /// Server `send` was called with no known peers
    #[error("No peers connected")]
    NoPeersConnected,
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;
