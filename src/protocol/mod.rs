//! Wire protocol
//!
//! TCP messages are delimited with a 4-byte length prefix. UDP datagrams
//! carry raw payloads and need no protocol layer.

pub mod framing;

pub use framing::{encode_frame, FrameReader, ReadOutcome, Watchdog};
