//! Network I/O
//!
//! Client and server implementations for TCP and UDP, the contracts they
//! share, and their configuration.

pub mod config;
pub mod tcp_client;
pub mod tcp_server;
pub mod traits;
pub mod udp_client;
pub mod udp_server;

pub(crate) mod sockopt;
pub(crate) mod worker;

pub use config::{TcpConfig, TcpServerConfig, UdpConfig, CONNECT_TIMEOUT};
pub use tcp_client::TcpClient;
pub use tcp_server::TcpServer;
pub use traits::{Client, DeliveryReport, Server, Transport};
pub use udp_client::{UdpClient, MAX_DATAGRAM_SIZE, RECV_BUFFER_SIZE};
pub use udp_server::UdpServer;
