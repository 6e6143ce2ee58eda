//! Events and listeners
//!
//! Every client and server reports activity through [`Event`]s delivered to
//! the [`Listener`]s registered on it. Delivery happens synchronously on the
//! component's reception thread.
//!
//! Applications that prefer a single stream of events over three callbacks
//! can subscribe a [`ChannelListener`] and consume an [`EventReceiver`]:
//!
//! ```no_run
//! use peerlink::event::{self, EventKind};
//! use peerlink::io::{Client, TcpClient, Transport};
//! use peerlink::Endpoint;
//!
//! let client = TcpClient::new(Endpoint::localhost("nmea", 10110));
//! let (listener, mut events) = event::channel();
//! client.add_listener(listener);
//! client.start()?;
//!
//! while let Some(event) = events.blocking_recv() {
//!     match event.kind() {
//!         EventKind::Data(bytes) => println!("{} bytes from {}", bytes.len(), event.endpoint()),
//!         EventKind::Timeout => continue,
//!         EventKind::Exception(e) => {
//!             eprintln!("link down: {}", e);
//!             break;
//!         }
//!     }
//! }
//! # Ok::<(), peerlink::TransportError>(())
//! ```

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{error, trace};

use crate::endpoint::Endpoint;
use crate::error::TransportError;

/// Kind of component that emitted an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    TcpClient,
    TcpServer,
    UdpClient,
    UdpServer,
}

/// Opaque identity of the component that emitted an event
///
/// Each component instance gets a process-unique id at construction.
/// Server fan-out keeps the source of the accepted connection that produced
/// the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Source {
    kind: SourceKind,
    id: u64,
}

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

impl Source {
    pub(crate) fn next(kind: SourceKind) -> Self {
        Source {
            kind,
            id: NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Component kind
    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Process-unique component id
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.kind, self.id)
    }
}

/// What happened
#[derive(Debug, Clone)]
pub enum EventKind {
    /// One complete inbound message
    Data(Bytes),
    /// A bounded read elapsed without data; the loop keeps running
    Timeout,
    /// The reception loop stopped because of this error
    Exception(Arc<TransportError>),
}

/// Notification emitted by a client or server
#[derive(Debug, Clone)]
pub struct Event {
    source: Source,
    endpoint: Endpoint,
    kind: EventKind,
}

impl Event {
    pub(crate) fn data(source: Source, endpoint: Endpoint, payload: Bytes) -> Self {
        Event {
            source,
            endpoint,
            kind: EventKind::Data(payload),
        }
    }

    pub(crate) fn timeout(source: Source, endpoint: Endpoint) -> Self {
        Event {
            source,
            endpoint,
            kind: EventKind::Timeout,
        }
    }

    pub(crate) fn exception(source: Source, endpoint: Endpoint, error: TransportError) -> Self {
        Event {
            source,
            endpoint,
            kind: EventKind::Exception(Arc::new(error)),
        }
    }

    /// Emitting component
    pub fn source(&self) -> Source {
        self.source
    }

    /// Peer the event concerns
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    /// Message payload, for data events
    pub fn payload(&self) -> Option<&Bytes> {
        match &self.kind {
            EventKind::Data(payload) => Some(payload),
            _ => None,
        }
    }

    /// Failure, for exception events
    pub fn error(&self) -> Option<&TransportError> {
        match &self.kind {
            EventKind::Exception(e) => Some(e.as_ref()),
            _ => None,
        }
    }

    /// Invoke the callback matching this event's kind
    pub fn deliver_to(&self, listener: &dyn Listener) {
        match &self.kind {
            EventKind::Data(_) => listener.on_receive(self),
            EventKind::Timeout => listener.on_timeout(self),
            EventKind::Exception(e) => listener.on_exception(self, e),
        }
    }
}

/// Observer of transport activity
///
/// Callbacks run on the component's reception thread. A slow callback
/// delays the next read on that connection only. Panics are caught and
/// logged at the delivery boundary.
pub trait Listener: Send + Sync {
    /// Called once per complete inbound message
    fn on_receive(&self, _event: &Event) {}

    /// Called when a read timed out with no data
    fn on_timeout(&self, _event: &Event) {}

    /// Called right before the reception loop terminates
    fn on_exception(&self, _event: &Event, _error: &TransportError) {}
}

/// Copy-on-write set of listeners
///
/// Notification works on an immutable snapshot, so registration may race
/// with delivery without either observing a half-updated set.
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Arc<Vec<Arc<dyn Listener>>>>,
}

fn same_listener(a: &Arc<dyn Listener>, b: &Arc<dyn Listener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; returns `false` if it was already registered
    pub fn add(&self, listener: Arc<dyn Listener>) -> bool {
        let mut guard = self.listeners.write().unwrap_or_else(|p| p.into_inner());
        if guard.iter().any(|l| same_listener(l, &listener)) {
            return false;
        }
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(listener);
        *guard = Arc::new(next);
        true
    }

    /// Unregister a listener; returns `false` if it was not registered
    pub fn remove(&self, listener: &Arc<dyn Listener>) -> bool {
        let mut guard = self.listeners.write().unwrap_or_else(|p| p.into_inner());
        if !guard.iter().any(|l| same_listener(l, listener)) {
            return false;
        }
        let next: Vec<_> = guard
            .iter()
            .filter(|l| !same_listener(l, listener))
            .cloned()
            .collect();
        *guard = Arc::new(next);
        true
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Arc<Vec<Arc<dyn Listener>>> {
        self.listeners
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Deliver an event to every registered listener
    pub fn notify(&self, event: &Event) {
        let listeners = self.snapshot();
        trace!(
            source = %event.source(),
            endpoint = %event.endpoint(),
            listeners = listeners.len(),
            "Delivering event"
        );

        for listener in listeners.iter() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| event.deliver_to(listener.as_ref())));
            if outcome.is_err() {
                error!(
                    source = %event.source(),
                    endpoint = %event.endpoint(),
                    "Listener panicked during event delivery"
                );
            }
        }
    }
}

impl fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.len())
            .finish()
    }
}

/// Listener forwarding every event into a channel
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelListener {
    fn forward(&self, event: &Event) {
        // Receiver gone: the subscriber lost interest, nothing to do
        let _ = self.tx.send(event.clone());
    }
}

impl Listener for ChannelListener {
    fn on_receive(&self, event: &Event) {
        self.forward(event);
    }

    fn on_timeout(&self, event: &Event) {
        self.forward(event);
    }

    fn on_exception(&self, event: &Event, _error: &TransportError) {
        self.forward(event);
    }
}

/// Receiving half of [`channel`]
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventReceiver {
    /// Wait for the next event; `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Blocking variant of [`recv`](Self::recv)
    ///
    /// Must not be called from within an async runtime.
    pub fn blocking_recv(&mut self) -> Option<Event> {
        self.rx.blocking_recv()
    }

    /// Take the next event if one is queued
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

/// Create a channel-backed listener and its receiving half
///
/// Register the returned listener on any client or server; every event it
/// sees is queued, unbounded, for the receiver.
pub fn channel() -> (Arc<dyn Listener>, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelListener { tx }), EventReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter {
        received: AtomicUsize,
        timeouts: AtomicUsize,
        exceptions: AtomicUsize,
    }

    impl Listener for Counter {
        fn on_receive(&self, _event: &Event) {
            self.received.fetch_add(1, Ordering::SeqCst);
        }

        fn on_timeout(&self, _event: &Event) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_exception(&self, _event: &Event, _error: &TransportError) {
            self.exceptions.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicky;

    impl Listener for Panicky {
        fn on_receive(&self, _event: &Event) {
            panic!("listener bug");
        }
    }

    fn source() -> Source {
        Source::next(SourceKind::TcpClient)
    }

    #[test]
    fn test_add_is_idempotent() {
        let set = ListenerSet::new();
        let listener: Arc<dyn Listener> = Arc::new(Counter::default());

        assert!(set.add(listener.clone()));
        assert!(!set.add(listener.clone()));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let set = ListenerSet::new();
        let registered: Arc<dyn Listener> = Arc::new(Counter::default());
        let stranger: Arc<dyn Listener> = Arc::new(Counter::default());

        set.add(registered.clone());
        assert!(!set.remove(&stranger));
        assert!(set.remove(&registered));
        assert!(!set.remove(&registered));
        assert!(set.is_empty());
    }

    #[test]
    fn test_dispatch_by_kind() {
        let set = ListenerSet::new();
        let counter = Arc::new(Counter::default());
        set.add(counter.clone());

        let ep = Endpoint::localhost("peer", 1);
        let src = source();
        set.notify(&Event::data(src, ep.clone(), Bytes::from_static(b"hi")));
        set.notify(&Event::timeout(src, ep.clone()));
        set.notify(&Event::timeout(src, ep.clone()));
        set.notify(&Event::exception(src, ep, TransportError::ConnectionLost));

        assert_eq!(counter.received.load(Ordering::SeqCst), 1);
        assert_eq!(counter.timeouts.load(Ordering::SeqCst), 2);
        assert_eq!(counter.exceptions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let set = ListenerSet::new();
        let counter = Arc::new(Counter::default());
        set.add(Arc::new(Panicky));
        set.add(counter.clone());

        let event = Event::data(source(), Endpoint::localhost("p", 1), Bytes::new());
        set.notify(&event);

        assert_eq!(counter.received.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_removing_itself_during_delivery() {
        struct SelfRemoving {
            set: Arc<ListenerSet>,
            me: std::sync::Mutex<Option<Arc<dyn Listener>>>,
        }

        impl Listener for SelfRemoving {
            fn on_receive(&self, _event: &Event) {
                if let Some(me) = self.me.lock().unwrap().take() {
                    self.set.remove(&me);
                }
            }
        }

        let set = Arc::new(ListenerSet::new());
        let listener = Arc::new(SelfRemoving {
            set: set.clone(),
            me: std::sync::Mutex::new(None),
        });
        let as_dyn: Arc<dyn Listener> = listener.clone();
        *listener.me.lock().unwrap() = Some(as_dyn.clone());
        set.add(as_dyn);

        set.notify(&Event::data(source(), Endpoint::localhost("p", 1), Bytes::new()));
        assert!(set.is_empty());
    }

    #[test]
    fn test_channel_listener() {
        let (listener, mut rx) = channel();
        let set = ListenerSet::new();
        set.add(listener);

        let ep = Endpoint::localhost("p", 9);
        set.notify(&Event::data(source(), ep.clone(), Bytes::from_static(b"abc")));
        set.notify(&Event::exception(source(), ep, TransportError::ConnectionLost));

        let first = tokio_test::block_on(rx.recv()).unwrap();
        assert_eq!(first.payload().map(|b| b.as_ref()), Some(&b"abc"[..]));

        let second = rx.try_recv().unwrap();
        assert!(matches!(second.error(), Some(TransportError::ConnectionLost)));
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_source_ids_are_unique() {
        let a = Source::next(SourceKind::UdpServer);
        let b = Source::next(SourceKind::UdpServer);
        assert_ne!(a, b);
        assert_eq!(a.kind(), SourceKind::UdpServer);
    }
}
