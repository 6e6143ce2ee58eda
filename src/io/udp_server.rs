//! UDP server
//!
//! Binds its endpoint and learns peers from the sender address of every
//! inbound datagram. Broadcast sends one datagram to each learned peer.

use std::collections::BTreeSet;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, trace, warn};

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::event::{Event, Listener, ListenerSet, Source, SourceKind};
use crate::io::config::UdpConfig;
use crate::io::traits::{DeliveryReport, Server, Transport};
use crate::io::udp_client::{check_size, open_socket, receive_datagrams, waker, Role};
use crate::io::worker::{lock, RunFlag, Worker};

/// Socket of one run, tagged so a finished loop only releases its own
struct Bound {
    generation: u64,
    socket: UdpSocket,
}

struct Shared {
    endpoint: Endpoint,
    config: UdpConfig,
    source: Source,
    listeners: ListenerSet,
    peers: Mutex<BTreeSet<Endpoint>>,
    socket: Mutex<Option<Bound>>,
    worker: Mutex<Option<Worker>>,
    generation: AtomicU64,
    /// Serializes `start` and `stop`
    lifecycle: Mutex<()>,
}

/// UDP server
///
/// Peers are never dropped on their own: UDP has no disconnect. They stay
/// known until [`UdpServer::forget_peer`] or `stop`.
///
/// # Examples
///
/// ```no_run
/// use peerlink::event::{self, EventKind};
/// use peerlink::io::{Server, Transport, UdpServer};
/// use peerlink::Endpoint;
///
/// let server = UdpServer::new(Endpoint::resolve("hub", "0.0.0.0", 10110)?);
/// let (listener, mut events) = event::channel();
/// server.add_listener(listener);
/// server.start()?;
///
/// while let Some(event) = events.blocking_recv() {
///     if let EventKind::Data(bytes) = event.kind() {
///         println!("{} sent {} bytes", event.endpoint(), bytes.len());
///         server.send(bytes)?;
///     }
/// }
/// # Ok::<(), peerlink::TransportError>(())
/// ```
pub struct UdpServer {
    shared: Arc<Shared>,
}

impl UdpServer {
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_config(endpoint, UdpConfig::default())
    }

    pub fn with_config(endpoint: Endpoint, config: UdpConfig) -> Self {
        UdpServer {
            shared: Arc::new(Shared {
                endpoint,
                config,
                source: Source::next(SourceKind::UdpServer),
                listeners: ListenerSet::new(),
                peers: Mutex::new(BTreeSet::new()),
                socket: Mutex::new(None),
                worker: Mutex::new(None),
                generation: AtomicU64::new(0),
                lifecycle: Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &UdpConfig {
        &self.shared.config
    }

    pub fn source(&self) -> Source {
        self.shared.source
    }

    /// Address the socket is bound to (resolves port 0)
    ///
    /// # Errors
    ///
    /// - [`TransportError::NotConnected`] - Server not started
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let guard = lock(&self.shared.socket);
        let bound = guard.as_ref().ok_or(TransportError::NotConnected)?;
        Ok(bound.socket.local_addr()?)
    }

    /// Send one datagram to a single address, known peer or not
    ///
    /// # Errors
    ///
    /// - [`TransportError::NotConnected`] - Server not started
    /// - [`TransportError::PayloadTooLarge`] - Payload exceeds one datagram
    pub fn send_to(&self, peer: &Endpoint, payload: &[u8]) -> Result<()> {
        check_size(payload)?;

        let guard = lock(&self.shared.socket);
        let bound = guard.as_ref().ok_or(TransportError::NotConnected)?;
        bound.socket.send_to(payload, peer.socket_addr())?;
        trace!(peer = %peer, size = payload.len(), "Datagram sent");
        Ok(())
    }

    /// Drop a learned peer; `false` if it was not known
    ///
    /// The peer is learned again by its next datagram.
    pub fn forget_peer(&self, peer: &Endpoint) -> bool {
        let removed = lock(&self.shared.peers).remove(peer);
        if removed {
            info!(peer = %peer, "Peer forgotten");
        }
        removed
    }
}

fn run(shared: &Shared, socket: &UdpSocket, generation: u64, flag: &RunFlag) {
    debug!(endpoint = %shared.endpoint, "Reception loop started");

    let ended = receive_datagrams(
        socket,
        flag,
        |payload, from| {
            let peer = Endpoint::from_peer(from);
            if lock(&shared.peers).insert(peer.clone()) {
                info!(peer = %peer, "Peer learned");
            }
            debug!(peer = %peer, size = payload.len(), "Datagram received");
            shared
                .listeners
                .notify(&Event::data(shared.source, peer, payload));
        },
        || {
            trace!(endpoint = %shared.endpoint, "Read timed out");
            shared
                .listeners
                .notify(&Event::timeout(shared.source, shared.endpoint.clone()));
        },
    );

    if let Some(error) = ended {
        warn!(endpoint = %shared.endpoint, error = %error, "Reception loop terminated");
        flag.clear();
        shared
            .listeners
            .notify(&Event::exception(shared.source, shared.endpoint.clone(), error));
    }

    release_socket(shared, generation);
    debug!(endpoint = %shared.endpoint, "Reception loop finished");
}

fn release_socket(shared: &Shared, generation: u64) {
    let mut guard = lock(&shared.socket);
    if guard.as_ref().is_some_and(|b| b.generation == generation) {
        guard.take();
    }
}

impl Transport for UdpServer {
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

        let socket = open_socket(&self.shared.endpoint, &self.shared.config, Role::Server)?;
        let reader = socket.try_clone()?;
        let wake = waker(&socket)?;
        let local = socket.local_addr()?;
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&self.shared.socket) = Some(Bound { generation, socket });

        let shared = Arc::clone(&self.shared);
        let spawned = Worker::spawn(
            format!("udp-server-{}", self.shared.endpoint.id()),
            move |flag| run(&shared, &reader, generation, flag),
            wake,
        );
        let worker = match spawned {
            Ok(worker) => worker,
            Err(e) => {
                release_socket(&self.shared, generation);
                return Err(e.into());
            }
        };
        *lock(&self.shared.worker) = Some(worker);

        info!(endpoint = %self.shared.endpoint, addr = %local, "UDP server listening");
        Ok(())
    }

    fn stop(&self) {
        let _op = lock(&self.shared.lifecycle);

        let worker = lock(&self.shared.worker).take();
        let was_running = worker.is_some();
        if let Some(worker) = worker {
            worker.stop();
        }

        lock(&self.shared.socket).take();
        let forgotten = std::mem::take(&mut *lock(&self.shared.peers));

        if was_running {
            info!(endpoint = %self.shared.endpoint, peers = forgotten.len(), "UDP server stopped");
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

impl Server for UdpServer {
    fn clients(&self) -> Vec<Endpoint> {
        lock(&self.shared.peers).iter().cloned().collect()
    }

    fn send(&self, payload: &[u8]) -> Result<DeliveryReport> {
        let peers = self.clients();
        if peers.is_empty() {
            return Err(TransportError::NoPeersConnected);
        }
        check_size(payload)?;

        let guard = lock(&self.shared.socket);
        let bound = guard.as_ref().ok_or(TransportError::NotConnected)?;

        let mut report = DeliveryReport::default();
        for peer in peers {
            let result = bound
                .socket
                .send_to(payload, peer.socket_addr())
                .map(drop)
                .map_err(TransportError::from);
            if let Err(e) = &result {
                warn!(peer = %peer, error = %e, "Broadcast to peer failed");
            }
            report.record(peer, result);
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

impl Drop for UdpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for UdpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpServer")
            .field("endpoint", &self.shared.endpoint)
            .field("running", &self.is_running())
            .field("peers", &lock(&self.shared.peers).len())
            .finish()
    }
}
