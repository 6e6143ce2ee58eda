//! Length-prefix framing for stream transports
//!
//! Every TCP message is a 4-byte big-endian unsigned length (excluding the
//! prefix itself) followed by exactly that many payload bytes. There is no
//! magic number, version or checksum; integrity is left to TCP.
//!
//! ```text
//! +----------------+---------------------------+
//! | length: u32 BE | payload: [u8; length]     |
//! +----------------+---------------------------+
//! ```

use std::io::{self, Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::{Result, TransportError};

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest payload a single frame can carry
pub const MAX_FRAME_PAYLOAD: u64 = u32::MAX as u64;

/// Consecutive failed reads after which a link is considered broken
pub const BROKEN_LINK_THRESHOLD: u32 = 10;

/// Most payload memory committed ahead of the bytes actually received
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Encode a payload into a single frame buffer
///
/// # Errors
///
/// - [`TransportError::PayloadTooLarge`] - Payload longer than `u32::MAX` bytes
///
/// # Examples
///
/// ```
/// use peerlink::protocol::framing::encode_frame;
///
/// let frame = encode_frame(b"$GPGGA").unwrap();
/// assert_eq!(&frame[..4], &[0, 0, 0, 6]);
/// assert_eq!(&frame[4..], b"$GPGGA");
/// ```
pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    if payload.len() as u64 > MAX_FRAME_PAYLOAD {
        return Err(TransportError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_FRAME_PAYLOAD as usize,
        });
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Encode a payload and write it as one frame, then flush
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let frame = encode_frame(payload)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    trace!(size = payload.len(), "Frame written");
    Ok(())
}

/// Result of one attempt to read a frame
#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete message
    Frame(Bytes),
    /// The read deadline passed before any byte of a new frame arrived
    TimedOut,
    /// End-of-stream at a frame boundary
    Closed,
    /// The frame could not be completed
    Failed(io::Error),
}

pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Reads length-prefixed frames from a byte stream
///
/// A read timeout is only reported as [`ReadOutcome::TimedOut`] when it hits
/// between frames. Once a prefix has started, any interruption other than
/// `EINTR` fails the frame, since the stream position is no longer known.
///
/// The length prefix comes off the wire and is not trusted: after a failed
/// frame the next "prefix" may be payload bytes, and `$GPG` decodes to about
/// 608 MB. The payload buffer therefore grows in chunks of at most 64 KiB as
/// bytes arrive, never to the announced length up front.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        FrameReader { inner }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read one frame
    pub fn read_frame(&mut self) -> ReadOutcome {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        let mut filled = 0;

        while filled < LENGTH_PREFIX_SIZE {
            match self.inner.read(&mut prefix[filled..]) {
                Ok(0) if filled == 0 => return ReadOutcome::Closed,
                Ok(0) => {
                    return ReadOutcome::Failed(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("stream ended inside length prefix ({} of 4 bytes)", filled),
                    ))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if filled == 0 && is_timeout(&e) => return ReadOutcome::TimedOut,
                Err(e) => return ReadOutcome::Failed(e),
            }
        }

        let length = u32::from_be_bytes(prefix) as usize;
        trace!(length, "Length prefix decoded");

        let mut payload = BytesMut::with_capacity(length.min(READ_CHUNK_SIZE));

        while payload.len() < length {
            let filled = payload.len();
            payload.resize(filled + (length - filled).min(READ_CHUNK_SIZE), 0);

            match self.inner.read(&mut payload[filled..]) {
                Ok(0) => {
                    return ReadOutcome::Failed(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("stream ended after {} of {} payload bytes", filled, length),
                    ))
                }
                Ok(n) => payload.truncate(filled + n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => payload.truncate(filled),
                Err(e) => return ReadOutcome::Failed(e),
            }
        }

        ReadOutcome::Frame(payload.freeze())
    }
}

/// Consecutive-failure counter
///
/// Trips once `threshold` failures occur without a successful message in
/// between.
#[derive(Debug, Clone)]
pub struct Watchdog {
    consecutive: u32,
    threshold: u32,
}

impl Default for Watchdog {
    fn default() -> Self {
        Watchdog::new(BROKEN_LINK_THRESHOLD)
    }
}

impl Watchdog {
    pub fn new(threshold: u32) -> Self {
        Watchdog {
            consecutive: 0,
            threshold,
        }
    }

    /// Record a failed read; returns `true` when the threshold is reached
    pub fn record_failure(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive >= self.threshold
    }

    /// Record a successfully decoded message
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn failures(&self) -> u32 {
        self.consecutive
    }
}
