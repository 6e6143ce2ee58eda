//! Symmetric TCP and UDP transport endpoints in Rust
//!
//! This library moves opaque byte messages between peers over TCP and UDP.
//! Every client and server owns one dedicated reception thread, reads with
//! blocking I/O and reports what it receives to subscribed listeners.
//!
//! # Features
//!
//! - **One contract, four transports** - TCP/UDP clients and servers share the
//!   same lifecycle and listener surface
//! - **Message framing on TCP** - 4-byte big-endian length prefix, so one
//!   `send` is one received message
//! - **Broken-link detection** - 10 consecutive failed reads end a TCP
//!   connection
//! - **Peer tracking** - servers keep a registry of connected (TCP) or
//!   learned (UDP) peers and broadcast to all of them
//! - **Multicast** - UDP endpoints can join a group on a chosen interface
//!
//! # Quick Start
//!
//! **Server:**
//! ```no_run
//! use peerlink::event::{self, EventKind};
//! use peerlink::io::{Server, TcpServer, Transport};
//! use peerlink::Endpoint;
//!
//! let server = TcpServer::new(Endpoint::resolve("bridge", "0.0.0.0", 10110)?);
//! let (listener, mut events) = event::channel();
//! server.add_listener(listener);
//! server.start()?;
//!
//! while let Some(event) = events.blocking_recv() {
//!     match event.kind() {
//!         EventKind::Data(bytes) => println!("{}: {} bytes", event.endpoint(), bytes.len()),
//!         EventKind::Timeout => {}
//!         EventKind::Exception(e) => eprintln!("{}: {}", event.endpoint(), e),
//!     }
//! }
//! # Ok::<(), peerlink::TransportError>(())
//! ```
//!
//! **Client:**
//! ```no_run
//! use peerlink::io::{Client, TcpClient, Transport};
//! use peerlink::Endpoint;
//!
//! let client = TcpClient::new(Endpoint::resolve("helm", "127.0.0.1", 10110)?);
//! client.start()?;
//! client.send(b"$HCHDG,101.1,,,7.1,W*3C")?;
//! # Ok::<(), peerlink::TransportError>(())
//! ```
//!
//! # Architecture
//!
//! - **`endpoint`** - Peer identity: id, address, port, optional local
//!   interface for multicast
//! - **`event`** - `Event`, the `Listener` trait and a channel adapter for
//!   async consumers
//! - **`protocol`** - TCP length-prefix framing and the failure watchdog
//! - **`io`** - The `Transport`/`Client`/`Server` traits and the four
//!   implementations
//! - **`error`** - `TransportError` and the `Result<T>` alias
//!
//! # Threading
//!
//! Listener callbacks run on the reception thread of the component that
//! produced the event. A slow callback delays that component's next read,
//! and nothing else. `send` runs on the caller's thread and is safe to call
//! from several threads at once.
//!
//! `stop` waits for the reception thread to exit. Called from inside a
//! callback it only signals; the thread exits when the callback returns.
//!
//! # Error Handling
//!
//! Operations return `Result<T, TransportError>`. Failures on the reception
//! thread are reported as exception events instead:
//!
//! ```no_run
//! use peerlink::io::{Client, TcpClient, Transport};
//! use peerlink::{Endpoint, TransportError};
//!
//! let client = TcpClient::new(Endpoint::localhost("sounder", 10110));
//! match client.start() {
//!     Ok(()) => println!("Connected"),
//!     Err(TransportError::Io(e)) => eprintln!("Network error: {}", e),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

pub mod endpoint;
pub mod error;
pub mod event;
pub mod io;
pub mod protocol;

// Re-export commonly used types
pub use endpoint::Endpoint;
pub use error::{Result, TransportError};
