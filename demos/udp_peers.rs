//! UDP peer learning over loopback
//!
//! Three clients send to one server; the server learns each of them from
//! its sender address, then broadcasts a reply to all of them.
//!
//! ```bash
//! RUST_LOG=debug cargo run --example udp_peers
//! ```

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use peerlink::event::{Event, Listener};
use peerlink::io::{Client, Server, Transport, UdpClient, UdpConfig, UdpServer};
use peerlink::Endpoint;
use tracing::info;
use tracing_subscriber::EnvFilter;

struct Printer(String);

impl Listener for Printer {
    fn on_receive(&self, event: &Event) {
        if let Some(payload) = event.payload() {
            info!(
                at = %self.0,
                from = %event.endpoint(),
                message = %String::from_utf8_lossy(payload),
                "Datagram"
            );
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = UdpConfig::with_read_timeout(Duration::from_millis(200));

    let server = UdpServer::with_config(Endpoint::localhost("hub", 0), config.clone());
    server.add_listener(Arc::new(Printer("hub".into())));
    server.start()?;
    let addr = server.local_addr()?;

    let clients = (0..3)
        .map(|i| {
            let id = format!("station-{}", i);
            let client = UdpClient::with_config(Endpoint::from_socket_addr(id.clone(), addr), config.clone());
            client.add_listener(Arc::new(Printer(id)));
            client.start().map(|_| client)
        })
        .collect::<Result<Vec<_>, _>>()?;

    for (i, client) in clients.iter().enumerate() {
        client.send(format!("report {}", i).as_bytes())?;
    }
    thread::sleep(Duration::from_millis(100));

    info!(peers = ?server.clients(), "Learned peers");
    let report = server.send(b"ack")?;
    info!(delivered = report.delivered().count(), attempted = report.attempted(), "Broadcast");
    thread::sleep(Duration::from_millis(100));

    for client in &clients {
        client.stop();
    }
    server.stop();
    Ok(())
}
