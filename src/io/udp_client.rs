//! UDP client
//!
//! Connectionless [`Client`]: every inbound datagram is one message, every
//! `send` is one datagram addressed to the peer endpoint. There is no
//! framing and no failure watchdog; the first non-timeout receive error
//! ends the reception loop.
//!
//! # Important Notes
//!
//! - **No delivery guarantee**: datagrams may be lost, duplicated or reordered
//! - **Size limit**: one datagram carries at most [`MAX_DATAGRAM_SIZE`] bytes
//! - **Read timeout is mandatory**: it bounds how long `stop` can take if
//!   the wake datagram is lost

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::event::{Event, Listener, ListenerSet, Source, SourceKind};
use crate::io::config::UdpConfig;
use crate::io::sockopt;
use crate::io::traits::{Client, Transport};
use crate::io::worker::{lock, wake_target, RunFlag, Worker};
use crate::protocol::framing::is_timeout;

/// Maximum UDP payload (65535 - 20 byte IP header - 8 byte UDP header)
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// Size of the buffer each reception thread receives into
pub const RECV_BUFFER_SIZE: usize = 65536;

/// Which side of the exchange a socket is opened for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Binds `UdpConfig::local_port` and sends to the endpoint
    Client,
    /// Binds the endpoint itself
    Server,
}

/// Create, bind and configure a socket for `endpoint`
///
/// A multicast endpoint is bound on the wildcard address at the group's
/// port and the group is joined, on the endpoint's local interface when
/// one is set.
pub(crate) fn open_socket(endpoint: &Endpoint, config: &UdpConfig, role: Role) -> Result<UdpSocket> {
    let wildcard = match endpoint.address() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };

    let bind = if endpoint.is_multicast() {
        SocketAddr::new(wildcard, endpoint.port())
    } else {
        match role {
            Role::Client => SocketAddr::new(wildcard, config.local_port),
            Role::Server => endpoint.socket_addr(),
        }
    };

    let socket = UdpSocket::bind(bind)?;
    socket.set_read_timeout(Some(config.effective_read_timeout()))?;
    if let Some(size) = config.recv_buffer_size {
        sockopt::set_recv_buffer_size(&socket, size)?;
    }
    if let Some(size) = config.send_buffer_size {
        sockopt::set_send_buffer_size(&socket, size)?;
    }
    if endpoint.is_multicast() {
        join_group(&socket, endpoint, config)?;
    }

    debug!(endpoint = %endpoint, addr = %socket.local_addr()?, "UDP socket bound");
    Ok(socket)
}

fn join_group(socket: &UdpSocket, endpoint: &Endpoint, config: &UdpConfig) -> io::Result<()> {
    match endpoint.address() {
        IpAddr::V4(group) => {
            let interface = endpoint
                .local_interface()
                .map_or(Ipv4Addr::UNSPECIFIED, |i| i.address);
            socket.join_multicast_v4(&group, &interface)?;
            if !interface.is_unspecified() {
                sockopt::set_multicast_if_v4(socket, interface)?;
            }
            if let Some(ttl) = config.multicast_ttl {
                socket.set_multicast_ttl_v4(ttl)?;
            }
            if let Some(on) = config.multicast_loop {
                socket.set_multicast_loop_v4(on)?;
            }
        }
        IpAddr::V6(group) => {
            let index = endpoint.local_interface().map_or(0, |i| i.index);
            socket.join_multicast_v6(&group, index)?;
            if let Some(on) = config.multicast_loop {
                socket.set_multicast_loop_v6(on)?;
            }
        }
    }

    info!(group = %endpoint.address(), port = endpoint.port(), "Joined multicast group");
    Ok(())
}

/// Wake action for a reception thread blocked on `socket`
///
/// Sends a zero-length datagram to the socket's own address from a
/// throwaway socket, so a finished loop leaves nothing bound to the port.
/// If the datagram is lost the loop still notices the cleared flag at its
/// next read timeout.
pub(crate) fn waker(socket: &UdpSocket) -> Result<impl FnOnce() + Send + 'static> {
    let target = wake_target(socket.local_addr()?);
    let any = match target {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    Ok(move || {
        let sent = UdpSocket::bind(any).and_then(|waker| waker.send_to(&[], target));
        if let Err(e) = sent {
            trace!(addr = %target, error = %e, "Wake datagram not sent");
        }
    })
}

/// Receive datagrams until the flag is cleared or a receive fails
///
/// Returns the error that ended the loop, `None` on a requested stop.
pub(crate) fn receive_datagrams<D, T>(
    socket: &UdpSocket,
    flag: &RunFlag,
    mut on_datagram: D,
    mut on_timeout: T,
) -> Option<TransportError>
where
    D: FnMut(Bytes, SocketAddr),
    T: FnMut(),
{
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    while flag.is_running() {
        let received = socket.recv_from(&mut buf);
        if !flag.is_running() {
            break;
        }

        match received {
            Ok((size, from)) => on_datagram(Bytes::copy_from_slice(&buf[..size]), from),
            Err(e) if is_timeout(&e) => on_timeout(),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Some(TransportError::Io(e)),
        }
    }

    None
}

/// Reject payloads a single datagram cannot carry
pub(crate) fn check_size(payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_DATAGRAM_SIZE {
        return Err(TransportError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_DATAGRAM_SIZE,
        });
    }
    Ok(())
}

/// Send half of the current socket
struct Sender {
    generation: u64,
    socket: UdpSocket,
}

struct Shared {
    endpoint: Endpoint,
    config: UdpConfig,
    source: Source,
    listeners: ListenerSet,
    sender: Mutex<Option<Sender>>,
    worker: Mutex<Option<Worker>>,
    generation: AtomicU64,
}

/// UDP client
///
/// Sends datagrams to its [`Endpoint`] and reports every datagram arriving
/// on its local socket, tagged with that endpoint.
///
/// # Examples
///
/// ```no_run
/// use peerlink::io::{Client, Transport, UdpClient, UdpConfig};
/// use peerlink::Endpoint;
/// use std::time::Duration;
///
/// let config = UdpConfig::with_read_timeout(Duration::from_millis(250)).local_port(10111);
/// let client = UdpClient::with_config(Endpoint::resolve("plotter", "192.168.1.30", 10110)?, config);
/// client.start()?;
/// client.send(b"$GPGLL,4916.45,N,12311.12,W,225444,A*1D")?;
/// # Ok::<(), peerlink::TransportError>(())
/// ```
pub struct UdpClient {
    shared: Arc<Shared>,
}

impl UdpClient {
    /// Client with default settings (ephemeral local port, 1 s read timeout)
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_config(endpoint, UdpConfig::default())
    }

    pub fn with_config(endpoint: Endpoint, config: UdpConfig) -> Self {
        UdpClient {
            shared: Arc::new(Shared {
                endpoint,
                config,
                source: Source::next(SourceKind::UdpClient),
                listeners: ListenerSet::new(),
                sender: Mutex::new(None),
                worker: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &UdpConfig {
        &self.shared.config
    }

    pub fn source(&self) -> Source {
        self.shared.source
    }

    /// Address the socket is bound to
    ///
    /// # Errors
    ///
    /// - [`TransportError::NotConnected`] - Client not started
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let guard = lock(&self.shared.sender);
        let sender = guard.as_ref().ok_or(TransportError::NotConnected)?;
        Ok(sender.socket.local_addr()?)
    }

    fn spawn_reception(&self, socket: UdpSocket) -> Result<Worker> {
        let reader = socket.try_clone()?;
        let wake = waker(&socket)?;
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        *lock(&self.shared.sender) = Some(Sender { generation, socket });

        let shared = Arc::clone(&self.shared);
        let spawned = Worker::spawn(
            format!("udp-client-{}", self.shared.endpoint.id()),
            move |flag| run(&shared, &reader, generation, flag),
            wake,
        );

        spawned.map_err(|e| {
            close_sender(&self.shared, generation);
            e.into()
        })
    }
}

fn run(shared: &Shared, socket: &UdpSocket, generation: u64, flag: &RunFlag) {
    debug!(endpoint = %shared.endpoint, "Reception loop started");

    let ended = receive_datagrams(
        socket,
        flag,
        |payload, from| {
            debug!(endpoint = %shared.endpoint, from = %from, size = payload.len(), "Datagram received");
            shared
                .listeners
                .notify(&Event::data(shared.source, shared.endpoint.clone(), payload));
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

    close_sender(shared, generation);
    debug!(endpoint = %shared.endpoint, "Reception loop finished");
}

fn close_sender(shared: &Shared, generation: u64) {
    let mut guard = lock(&shared.sender);
    if guard.as_ref().is_some_and(|s| s.generation == generation) {
        guard.take();
    }
}

impl Transport for UdpClient {
    fn start(&self) -> Result<()> {
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

        let mut slot = lock(&self.shared.worker);
        if slot.as_ref().is_some_and(Worker::is_running) {
            return Ok(());
        }

        let socket = open_socket(&self.shared.endpoint, &self.shared.config, Role::Client)?;
        *slot = Some(self.spawn_reception(socket)?);

        info!(endpoint = %self.shared.endpoint, "UDP client started");
        Ok(())
    }

    fn stop(&self) {
        let worker = lock(&self.shared.worker).take();
        if let Some(worker) = worker {
            worker.stop();
            info!(endpoint = %self.shared.endpoint, "UDP client stopped");
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

impl Client for UdpClient {
    fn send(&self, payload: &[u8]) -> Result<()> {
        check_size(payload)?;

        let guard = lock(&self.shared.sender);
        let sender = guard.as_ref().ok_or(TransportError::NotConnected)?;
        sender.socket.send_to(payload, self.shared.endpoint.socket_addr())?;

        debug!(endpoint = %self.shared.endpoint, size = payload.len(), "Datagram sent");
        Ok(())
    }
}

impl Drop for UdpClient {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for UdpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpClient")
            .field("endpoint", &self.shared.endpoint)
            .field("source", &self.shared.source)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{self, EventKind};
    use std::time::{Duration, Instant};

    fn fast() -> UdpConfig {
        UdpConfig::with_read_timeout(Duration::from_millis(50))
    }

    #[test]
    fn test_send_too_large() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let client = UdpClient::with_config(
            Endpoint::from_socket_addr("peer", peer.local_addr().unwrap()),
            fast(),
        );
        client.start().unwrap();

        let oversized = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        assert!(matches!(
            client.send(&oversized),
            Err(TransportError::PayloadTooLarge { size, max })
                if size == MAX_DATAGRAM_SIZE + 1 && max == MAX_DATAGRAM_SIZE
        ));
        client.stop();
    }

    #[test]
    fn test_send_before_start() {
        let client = UdpClient::new(Endpoint::localhost("idle", 9));
        assert!(matches!(client.send(b"x"), Err(TransportError::NotConnected)));
        assert!(matches!(client.local_addr(), Err(TransportError::NotConnected)));
    }

    #[test]
    fn test_exchange_with_plain_socket() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let endpoint = Endpoint::from_socket_addr("peer", peer.local_addr().unwrap());
        let client = UdpClient::with_config(endpoint.clone(), fast());
        let (listener, mut events) = event::channel();
        client.add_listener(listener);
        client.start().unwrap();

        client.send(b"ping").unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");

        peer.send_to(b"pong", from).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let payload = loop {
            assert!(Instant::now() < deadline, "no data event");
            match events.try_recv() {
                Some(event) => {
                    if let EventKind::Data(bytes) = event.kind() {
                        assert_eq!(event.endpoint(), &endpoint);
                        break bytes.clone();
                    }
                }
                None => std::thread::sleep(Duration::from_millis(5)),
            }
        };
        assert_eq!(&payload[..], b"pong");

        client.stop();
    }

    #[test]
    fn test_idle_socket_reports_timeouts() {
        let client = UdpClient::with_config(Endpoint::localhost("quiet", 9), fast());
        let (listener, mut events) = event::channel();
        client.add_listener(listener);
        client.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            assert!(Instant::now() < deadline, "no timeout event");
            match events.try_recv() {
                Some(event) if matches!(event.kind(), EventKind::Timeout) => break,
                _ => std::thread::sleep(Duration::from_millis(5)),
            }
        }

        client.stop();
    }

    #[test]
    fn test_stop_returns_before_read_timeout() {
        let config = UdpConfig::with_read_timeout(Duration::from_secs(30));
        let client = UdpClient::with_config(Endpoint::localhost("slow", 9), config);
        client.start().unwrap();
        assert!(client.is_running());

        let started = Instant::now();
        client.stop();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!client.is_running());
        assert!(client.local_addr().is_err());
    }

    #[test]
    fn test_restart_rebinds() {
        let client = UdpClient::with_config(Endpoint::localhost("again", 9), fast());
        client.start().unwrap();
        let first = client.local_addr().unwrap();
        client.start().unwrap();
        assert_eq!(client.local_addr().unwrap(), first, "second start opened a new socket");
        client.stop();
        client.stop();

        client.start().unwrap();
        assert!(client.is_running());
        assert!(client.local_addr().is_ok());
        client.stop();
    }
}
