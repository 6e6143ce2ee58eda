//! TCP client
//!
//! Stream-oriented, connection-oriented [`Client`]. Messages are delimited
//! with the length-prefix framing from [`crate::protocol::framing`]; one
//! dedicated thread reads frames and notifies listeners.

use std::io::Read;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, trace, warn};

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::event::{Event, Listener, ListenerSet, Source, SourceKind};
use crate::io::config::{TcpConfig, CONNECT_TIMEOUT};
use crate::io::sockopt;
use crate::io::traits::{Client, Transport};
use crate::io::worker::{lock, RunFlag, Worker};
use crate::protocol::framing::{self, FrameReader, ReadOutcome, Watchdog};

/// Write half of the current connection
struct Writer {
    generation: u64,
    stream: TcpStream,
}

struct Shared {
    endpoint: Endpoint,
    config: TcpConfig,
    source: Source,
    listeners: ListenerSet,
    writer: Mutex<Option<Writer>>,
    worker: Mutex<Option<Worker>>,
    /// Stream handed over by a server, consumed by the first `start`
    accepted: Mutex<Option<TcpStream>>,
    generation: AtomicU64,
}

/// TCP client
///
/// Connects to its [`Endpoint`] with a fixed 2 s connect timeout, then reads
/// length-prefixed messages on a dedicated thread. Sends are serialized
/// internally, so the client can be shared between threads.
///
/// # Examples
///
/// ```no_run
/// use peerlink::io::{Client, TcpClient, Transport};
/// use peerlink::Endpoint;
///
/// let client = TcpClient::new(Endpoint::resolve("autopilot", "192.168.1.20", 2000)?);
/// client.start()?;
/// client.send(b"$APB,A,A,0.10,R,N,V,V,011,M,DEST,011,M,011,M*3C")?;
/// client.stop();
/// # Ok::<(), peerlink::TransportError>(())
/// ```
pub struct TcpClient {
    shared: Arc<Shared>,
}

impl TcpClient {
    /// Client with default settings (blocking reads, no timeout)
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_config(endpoint, TcpConfig::default())
    }

    pub fn with_config(endpoint: Endpoint, config: TcpConfig) -> Self {
        Self::build(endpoint, config, None)
    }

    /// Wrap a stream accepted by a server
    pub(crate) fn from_accepted(endpoint: Endpoint, stream: TcpStream, config: TcpConfig) -> Self {
        Self::build(endpoint, config, Some(stream))
    }

    fn build(endpoint: Endpoint, config: TcpConfig, accepted: Option<TcpStream>) -> Self {
        TcpClient {
            shared: Arc::new(Shared {
                endpoint,
                config,
                source: Source::next(SourceKind::TcpClient),
                listeners: ListenerSet::new(),
                writer: Mutex::new(None),
                worker: Mutex::new(None),
                accepted: Mutex::new(accepted),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &TcpConfig {
        &self.shared.config
    }

    /// Identity carried by this client's events
    pub fn source(&self) -> Source {
        self.shared.source
    }

    /// Local address of the open connection
    ///
    /// # Errors
    ///
    /// - [`TransportError::NotConnected`] - No open connection
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let guard = lock(&self.shared.writer);
        let writer = guard.as_ref().ok_or(TransportError::NotConnected)?;
        Ok(writer.stream.local_addr()?)
    }

    /// Remote address of the open connection
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        let guard = lock(&self.shared.writer);
        let writer = guard.as_ref().ok_or(TransportError::NotConnected)?;
        Ok(writer.stream.peer_addr()?)
    }

    fn open_stream(&self) -> Result<TcpStream> {
        if let Some(stream) = lock(&self.shared.accepted).take() {
            return Ok(stream);
        }

        let addr = self.shared.endpoint.socket_addr();
        info!(endpoint = %self.shared.endpoint, "Connecting");
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => {
                debug!(endpoint = %self.shared.endpoint, "Connected");
                Ok(stream)
            }
            Err(e) => {
                warn!(endpoint = %self.shared.endpoint, error = %e, "Connect failed");
                Err(e.into())
            }
        }
    }

    fn configure(&self, stream: &TcpStream) -> Result<()> {
        let config = &self.shared.config;
        stream.set_read_timeout(config.effective_read_timeout())?;
        stream.set_write_timeout(config.effective_write_timeout())?;
        stream.set_nodelay(config.nodelay)?;
        if let Some(size) = config.recv_buffer_size {
            sockopt::set_recv_buffer_size(stream, size)?;
        }
        if let Some(size) = config.send_buffer_size {
            sockopt::set_send_buffer_size(stream, size)?;
        }
        Ok(())
    }

    fn spawn_reception(&self, stream: TcpStream) -> Result<Worker> {
        let reader = stream.try_clone()?;
        let waker = stream.try_clone()?;
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        *lock(&self.shared.writer) = Some(Writer { generation, stream });

        let shared = Arc::clone(&self.shared);
        let spawned = Worker::spawn(
            format!("tcp-client-{}", self.shared.endpoint.id()),
            move |flag| run(&shared, reader, generation, flag),
            move || {
                let _ = waker.shutdown(Shutdown::Both);
            },
        );

        spawned.map_err(|e| {
            close_writer(&self.shared, generation);
            e.into()
        })
    }
}

/// Reception thread body: read frames until stopped or failed, then close
fn run<R: Read>(shared: &Shared, reader: R, generation: u64, flag: &RunFlag) {
    debug!(endpoint = %shared.endpoint, "Reception loop started");

    if let Some(error) = receive_frames(shared, reader, flag) {
        warn!(endpoint = %shared.endpoint, error = %error, "Reception loop terminated");
        flag.clear();
        shared
            .listeners
            .notify(&Event::exception(shared.source, shared.endpoint.clone(), error));
    }

    close_writer(shared, generation);
    debug!(endpoint = %shared.endpoint, "Reception loop finished");
}

/// Read and dispatch frames; returns the error that ended the loop
///
/// Returns `None` when the loop ended because the flag was cleared.
fn receive_frames<R: Read>(shared: &Shared, reader: R, flag: &RunFlag) -> Option<TransportError> {
    let mut frames = FrameReader::new(reader);
    let mut watchdog = Watchdog::default();

    while flag.is_running() {
        let outcome = frames.read_frame();
        if !flag.is_running() {
            break;
        }

        match outcome {
            ReadOutcome::Frame(payload) => {
                watchdog.reset();
                debug!(endpoint = %shared.endpoint, size = payload.len(), "Message received");
                shared
                    .listeners
                    .notify(&Event::data(shared.source, shared.endpoint.clone(), payload));
            }
            ReadOutcome::TimedOut => {
                trace!(endpoint = %shared.endpoint, "Read timed out");
                shared
                    .listeners
                    .notify(&Event::timeout(shared.source, shared.endpoint.clone()));
            }
            ReadOutcome::Closed => return Some(TransportError::ConnectionLost),
            ReadOutcome::Failed(e) => {
                let broken = watchdog.record_failure();
                warn!(
                    endpoint = %shared.endpoint,
                    error = %e,
                    failures = watchdog.failures(),
                    "Failed read"
                );
                if broken {
                    return Some(TransportError::BrokenLink {
                        failures: watchdog.failures(),
                    });
                }
            }
        }
    }

    None
}

/// Drop the write half if it still belongs to `generation`
fn close_writer(shared: &Shared, generation: u64) {
    let mut guard = lock(&shared.writer);
    if guard.as_ref().is_some_and(|w| w.generation == generation) {
        if let Some(writer) = guard.take() {
            let _ = writer.stream.shutdown(Shutdown::Both);
        }
    }
}

impl Transport for TcpClient {
    fn start(&self) -> Result<()> {
        // Reap a terminated loop without holding the lock: its last
        // callbacks may still query this client.
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

        let stream = self.open_stream()?;
        self.configure(&stream)?;
        *slot = Some(self.spawn_reception(stream)?);

        info!(endpoint = %self.shared.endpoint, "TCP client started");
        Ok(())
    }

    fn stop(&self) {
        let worker = lock(&self.shared.worker).take();
        lock(&self.shared.accepted).take();

        if let Some(worker) = worker {
            worker.stop();
            info!(endpoint = %self.shared.endpoint, "TCP client stopped");
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

impl Client for TcpClient {
    fn send(&self, payload: &[u8]) -> Result<()> {
        let mut guard = lock(&self.shared.writer);
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;

        framing::write_frame(&mut writer.stream, payload)?;
        debug!(endpoint = %self.shared.endpoint, size = payload.len(), "Message sent");
        Ok(())
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClient")
            .field("endpoint", &self.shared.endpoint)
            .field("source", &self.shared.source)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::framing::tests::ScriptedReader;
    use crate::protocol::framing::{encode_frame, BROKEN_LINK_THRESHOLD};
    use std::io;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Tally {
        received: AtomicUsize,
        timeouts: AtomicUsize,
        broken: AtomicUsize,
        lost: AtomicUsize,
    }

    impl Listener for Tally {
        fn on_receive(&self, _event: &Event) {
            self.received.fetch_add(1, Ordering::SeqCst);
        }

        fn on_timeout(&self, _event: &Event) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_exception(&self, _event: &Event, error: &TransportError) {
            match error {
                TransportError::BrokenLink { .. } => self.broken.fetch_add(1, Ordering::SeqCst),
                TransportError::ConnectionLost => self.lost.fetch_add(1, Ordering::SeqCst),
                _ => 0,
            };
        }
    }

    fn failure() -> io::Result<Vec<u8>> {
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
    }

    fn frame(payload: &[u8]) -> io::Result<Vec<u8>> {
        Ok(encode_frame(payload).unwrap().to_vec())
    }

    fn client_with_tally() -> (TcpClient, Arc<Tally>) {
        let client = TcpClient::new(Endpoint::localhost("scripted", 1));
        let tally = Arc::new(Tally::default());
        client.add_listener(tally.clone());
        (client, tally)
    }

    /// Run the reception thread body over a scripted reader, like `start` would
    fn run_scripted(client: &TcpClient, steps: Vec<io::Result<Vec<u8>>>) {
        let shared = Arc::clone(&client.shared);
        let worker = Worker::spawn(
            "scripted".into(),
            move |flag| run(&shared, ScriptedReader::new(steps), 1, flag),
            || {},
        )
        .unwrap();
        *lock(&client.shared.worker) = Some(worker);

        for _ in 0..500 {
            if !client.is_running() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("scripted reception loop did not finish");
    }

    #[test]
    fn test_watchdog_trips_after_threshold_failures() {
        let (client, tally) = client_with_tally();
        let mut steps: Vec<_> = (0..BROKEN_LINK_THRESHOLD).map(|_| failure()).collect();
        steps.push(frame(b"never read"));

        run_scripted(&client, steps);

        assert_eq!(tally.broken.load(Ordering::SeqCst), 1);
        assert_eq!(tally.received.load(Ordering::SeqCst), 0);
        assert_eq!(tally.lost.load(Ordering::SeqCst), 0);
        assert!(!client.is_running());
    }

    #[test]
    fn test_watchdog_resets_after_good_frame() {
        let (client, tally) = client_with_tally();
        let mut steps: Vec<_> = (0..BROKEN_LINK_THRESHOLD - 1).map(|_| failure()).collect();
        steps.push(frame(b"good"));
        steps.extend((0..BROKEN_LINK_THRESHOLD - 1).map(|_| failure()));

        run_scripted(&client, steps);

        assert_eq!(tally.broken.load(Ordering::SeqCst), 0);
        assert_eq!(tally.received.load(Ordering::SeqCst), 1);
        // Script exhausted: end-of-stream at a frame boundary
        assert_eq!(tally.lost.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timeouts_do_not_count_as_failures() {
        let (client, tally) = client_with_tally();
        let timeout = || Err(io::Error::from(io::ErrorKind::WouldBlock));
        let mut steps: Vec<_> = (0..BROKEN_LINK_THRESHOLD - 1).map(|_| failure()).collect();
        steps.extend((0..5).map(|_| timeout()));
        steps.push(failure());
        steps.push(frame(b"after"));

        run_scripted(&client, steps);

        assert_eq!(tally.timeouts.load(Ordering::SeqCst), 5);
        assert_eq!(tally.broken.load(Ordering::SeqCst), 1);
        assert_eq!(tally.received.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_send_without_connection() {
        let client = TcpClient::new(Endpoint::localhost("idle", 1));
        assert!(matches!(client.send(b"x"), Err(TransportError::NotConnected)));
        assert!(matches!(client.local_addr(), Err(TransportError::NotConnected)));
        assert!(!client.is_running());
    }

    #[test]
    fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = TcpClient::new(Endpoint::localhost("refused", port));

        assert!(matches!(client.start(), Err(TransportError::Io(_))));
        assert!(!client.is_running());
    }

    #[test]
    fn test_stop_is_idempotent_when_idle() {
        let client = TcpClient::new(Endpoint::localhost("idle", 1));
        client.stop();
        client.stop();
        assert!(!client.is_running());
    }
}
