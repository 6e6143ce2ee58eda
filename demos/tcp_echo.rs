//! TCP echo over loopback
//!
//! Starts a server that echoes every message back to all connected peers,
//! connects two clients and prints what each of them receives.
//!
//! ```bash
//! RUST_LOG=debug cargo run --example tcp_echo
//!
//! # Reception loops only
//! RUST_LOG=peerlink::io=trace cargo run --example tcp_echo
//! ```

use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use peerlink::event::{Event, Listener};
use peerlink::io::{Client, Server, TcpClient, TcpServer, Transport};
use peerlink::{Endpoint, TransportError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Echoes each message to every peer of the server it is attached to
struct Echo {
    server: Weak<TcpServer>,
}

impl Listener for Echo {
    fn on_receive(&self, event: &Event) {
        let (Some(server), Some(payload)) = (self.server.upgrade(), event.payload()) else {
            return;
        };
        match server.send(payload) {
            Ok(report) => info!(from = %event.endpoint(), peers = report.attempted(), "Echoed"),
            Err(e) => warn!(error = %e, "Echo failed"),
        }
    }

    fn on_exception(&self, event: &Event, error: &TransportError) {
        info!(peer = %event.endpoint(), reason = %error, "Peer gone");
    }
}

/// Prints what a client receives
struct Printer(&'static str);

impl Listener for Printer {
    fn on_receive(&self, event: &Event) {
        if let Some(payload) = event.payload() {
            info!(client = self.0, message = %String::from_utf8_lossy(payload), "Received");
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let server = Arc::new(TcpServer::new(Endpoint::localhost("echo", 0)));
    server.add_listener(Arc::new(Echo {
        server: Arc::downgrade(&server),
    }));
    server.start()?;
    let addr = server.local_addr()?;

    let first = TcpClient::new(Endpoint::from_socket_addr("first", addr));
    first.add_listener(Arc::new(Printer("first")));
    first.start()?;

    let second = TcpClient::new(Endpoint::from_socket_addr("second", addr));
    second.add_listener(Arc::new(Printer("second")));
    second.start()?;

    // Let the server register both connections
    thread::sleep(Duration::from_millis(100));

    first.send(b"hello from first")?;
    second.send(b"hello from second")?;
    thread::sleep(Duration::from_millis(200));

    first.stop();
    second.stop();
    server.stop();
    Ok(())
}
