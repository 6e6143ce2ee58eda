//! TCP server
//!
//! Accepts inbound connections on a dedicated thread, wraps each one in a
//! [`TcpClient`] with its own reception thread, and re-emits every event of
//! those connections to the server's own listeners.

use std::collections::BTreeMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::event::{Event, Listener, ListenerSet, Source, SourceKind};
use crate::io::config::TcpServerConfig;
use crate::io::tcp_client::TcpClient;
use crate::io::traits::{Client, DeliveryReport, Server, Transport};
use crate::io::worker::{lock, wake_target, RunFlag, Worker};

const WAKE_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

struct Shared {
    endpoint: Endpoint,
    config: TcpServerConfig,
    source: Source,
    listeners: ListenerSet,
    /// Sends go through a snapshot of this map, never under its lock
    peers: Mutex<BTreeMap<Endpoint, Arc<TcpClient>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    worker: Mutex<Option<Worker>>,
    /// Serializes `start` and `stop`
    lifecycle: Mutex<()>,
}

/// TCP server
///
/// The endpoint is the local bind address. Each accepted connection becomes
/// a peer keyed by an `ip:port` [`Endpoint`]; it leaves the registry when
/// its connection fails or the server stops.
///
/// # Examples
///
/// ```no_run
/// use peerlink::event::{self, EventKind};
/// use peerlink::io::{Server, TcpServer, Transport};
/// use peerlink::Endpoint;
///
/// let server = TcpServer::new(Endpoint::resolve("bridge", "0.0.0.0", 10110)?);
/// let (listener, mut events) = event::channel();
/// server.add_listener(listener);
/// server.start()?;
///
/// while let Some(event) = events.blocking_recv() {
///     if let EventKind::Data(bytes) = event.kind() {
///         // Echo to every connected peer
///         let report = server.send(bytes)?;
///         println!("delivered to {} of {}", report.delivered().count(), report.attempted());
///     }
/// }
/// # Ok::<(), peerlink::TransportError>(())
/// ```
pub struct TcpServer {
    shared: Arc<Shared>,
}

/// Re-emits a connection's events to the server's listeners
struct Fanout {
    server: Weak<Shared>,
}

impl Listener for Fanout {
    fn on_receive(&self, event: &Event) {
        if let Some(server) = self.server.upgrade() {
            server.listeners.notify(event);
        }
    }

    fn on_timeout(&self, event: &Event) {
        if let Some(server) = self.server.upgrade() {
            server.listeners.notify(event);
        }
    }

    fn on_exception(&self, event: &Event, error: &TransportError) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        server.listeners.notify(event);

        let removed = {
            let mut peers = lock(&server.peers);
            match peers.get(event.endpoint()) {
                Some(client) if client.source() == event.source() => peers.remove(event.endpoint()),
                _ => None,
            }
        };
        if removed.is_some() {
            info!(peer = %event.endpoint(), reason = %error, "Client disconnected");
        }
    }
}

impl TcpServer {
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_config(endpoint, TcpServerConfig::default())
    }

    pub fn with_config(endpoint: Endpoint, config: TcpServerConfig) -> Self {
        TcpServer {
            shared: Arc::new(Shared {
                endpoint,
                config,
                source: Source::next(SourceKind::TcpServer),
                listeners: ListenerSet::new(),
                peers: Mutex::new(BTreeMap::new()),
                local_addr: Mutex::new(None),
                worker: Mutex::new(None),
                lifecycle: Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &TcpServerConfig {
        &self.shared.config
    }

    pub fn source(&self) -> Source {
        self.shared.source
    }

    /// Address the listener is bound to (resolves port 0)
    ///
    /// # Errors
    ///
    /// - [`TransportError::NotConnected`] - Server not started
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let local = *lock(&self.shared.local_addr);
        local.ok_or(TransportError::NotConnected)
    }

    pub fn client_count(&self) -> usize {
        lock(&self.shared.peers).len()
    }

    /// Send one message to a single peer
    ///
    /// # Errors
    ///
    /// - [`TransportError::NotConnected`] - Unknown peer
    pub fn send_to(&self, peer: &Endpoint, payload: &[u8]) -> Result<()> {
        let client = lock(&self.shared.peers)
            .get(peer)
            .cloned()
            .ok_or(TransportError::NotConnected)?;
        client.send(payload)
    }

    /// Close one peer's connection; `false` if the peer is unknown
    pub fn disconnect(&self, peer: &Endpoint) -> bool {
        let removed = lock(&self.shared.peers).remove(peer);
        match removed {
            Some(client) => {
                client.stop();
                info!(peer = %peer, "Client disconnected by server");
                true
            }
            None => false,
        }
    }
}

fn accept_loop<A>(shared: &Arc<Shared>, mut accept: A, flag: &RunFlag)
where
    A: FnMut() -> io::Result<(TcpStream, SocketAddr)>,
{
    debug!(endpoint = %shared.endpoint, "Accept loop started");

    loop {
        let accepted = accept();
        if !flag.is_running() {
            break;
        }

        match accepted {
            Ok((stream, addr)) => register(shared, stream, addr),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(endpoint = %shared.endpoint, error = %e, "Accept failed");
                flag.clear();
                shared.listeners.notify(&Event::exception(
                    shared.source,
                    shared.endpoint.clone(),
                    TransportError::Io(e),
                ));
                break;
            }
        }
    }

    debug!(endpoint = %shared.endpoint, "Accept loop finished");
}

fn register(shared: &Arc<Shared>, stream: TcpStream, addr: SocketAddr) {
    let endpoint = Endpoint::from_peer(addr);
    info!(peer = %endpoint, "Client connected");

    let client = Arc::new(TcpClient::from_accepted(
        endpoint.clone(),
        stream,
        shared.config.client.clone(),
    ));
    client.add_listener(Arc::new(Fanout {
        server: Arc::downgrade(shared),
    }));

    // The registry lock is held across start so a connection that fails
    // immediately cannot be removed before it is inserted.
    let replaced = {
        let mut peers = lock(&shared.peers);
        if let Err(e) = client.start() {
            warn!(peer = %endpoint, error = %e, "Failed to start connection");
            return;
        }
        peers.insert(endpoint, client)
    };

    if let Some(stale) = replaced {
        stale.stop();
    }
}

impl Transport for TcpServer {
    fn start(&self) -> Result<()> {
        let _op = lock(&self.shared.lifecycle);

        let finished = {
            let mut slot = lock(&self.shared.worker);
            if slot.as_ref().is_some_and(Worker::is_running) {
                trace!(endpoint = %self.shared.endpoint, "Already running");
                return Ok(());
            }
            slot.take()
        };
        if let Some(finished) = finished {
            finished.stop();
        }

        let listener = TcpListener::bind(self.shared.endpoint.socket_addr())?;
        let local = listener.local_addr()?;

        let shared = Arc::clone(&self.shared);
        let worker = Worker::spawn(
            format!("tcp-server-{}", self.shared.endpoint.id()),
            move |flag| accept_loop(&shared, || listener.accept(), flag),
            move || {
                if let Err(e) = TcpStream::connect_timeout(&wake_target(local), WAKE_CONNECT_TIMEOUT) {
                    warn!(addr = %local, error = %e, "Could not wake accept loop");
                }
            },
        )?;

        *lock(&self.shared.worker) = Some(worker);
        *lock(&self.shared.local_addr) = Some(local);

        info!(endpoint = %self.shared.endpoint, addr = %local, "TCP server listening");
        Ok(())
    }

    fn stop(&self) {
        let _op = lock(&self.shared.lifecycle);

        let worker = lock(&self.shared.worker).take();
        let was_running = worker.is_some();
        if let Some(worker) = worker {
            worker.stop();
        }

        let peers = std::mem::take(&mut *lock(&self.shared.peers));
        for (endpoint, client) in peers {
            client.stop();
            debug!(peer = %endpoint, "Connection closed");
        }
        lock(&self.shared.local_addr).take();

        if was_running {
            info!(endpoint = %self.shared.endpoint, "TCP server stopped");
        }
    }

    fn is_running(&self) -> bool {
        lock(&self.shared.worker)
            .as_ref()
            .is_some_and(Worker::is_running)
    }

    fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    fn add_listener(&self, listener: Arc<dyn Listener>) -> bool {
        self.shared.listeners.add(listener)
    }

    fn remove_listener(&self, listener: &Arc<dyn Listener>) -> bool {
        self.shared.listeners.remove(listener)
    }
}

impl Server for TcpServer {
    fn clients(&self) -> Vec<Endpoint> {
        lock(&self.shared.peers).keys().cloned().collect()
    }

    fn send(&self, payload: &[u8]) -> Result<DeliveryReport> {
        let peers: Vec<(Endpoint, Arc<TcpClient>)> = lock(&self.shared.peers)
            .iter()
            .map(|(endpoint, client)| (endpoint.clone(), Arc::clone(client)))
            .collect();
        if peers.is_empty() {
            return Err(TransportError::NoPeersConnected);
        }

        // A peer that stops reading blocks only this call
        let mut report = DeliveryReport::default();
        for (endpoint, client) in peers {
            let result = client.send(payload);
            if let Err(e) = &result {
                warn!(peer = %endpoint, error = %e, "Broadcast to peer failed");
            }
            report.record(endpoint, result);
        }

        debug!(
            peers = report.attempted(),
            size = payload.len(),
            complete = report.is_complete(),
            "Broadcast sent"
        );
        Ok(report)
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("endpoint", &self.shared.endpoint)
            .field("running", &self.is_running())
            .field("clients", &self.client_count())
            .finish()
    }
}
