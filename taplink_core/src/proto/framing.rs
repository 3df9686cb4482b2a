//! Length-prefixed framing for raw device frames.
//!
//! A stream transport has no message boundaries, so every frame read from
//! the virtual interface is prefixed with its length before it is written to
//! the peer.
//!
//! # Frame Format
//!
//! ```text
//! +----------------+----------------+----------------+----------------+
//! |                   Length (4 bytes, big-endian)                    |
//! +----------------+----------------+----------------+----------------+
//! |                        Payload (Length bytes)                     |
//! +----------------+----------------+----------------+----------------+
//! ```
//!
//! There is no other metadata. Legal lengths are `1..=MAX_FRAME_SIZE`; since
//! that bound fits in 16 bits the two high header bytes are always zero, which
//! keeps the format readable by peers that treat the header as two reserved
//! bytes followed by a 16-bit length.
//!
//! # Example Usage
//!
//! ```rust
//! use taplink_core::proto::framing::{encode_frame, FrameDecoder};
//!
//! let encoded = encode_frame(&[0xAA, 0xBB, 0xCC]).unwrap();
//! assert_eq!(&encoded[..4], &[0, 0, 0, 3]);
//!
//! let mut decoder = FrameDecoder::new();
//! decoder.push(&encoded);
//! assert_eq!(decoder.next_frame().unwrap(), Some(vec![0xAA, 0xBB, 0xCC]));
//! ```

use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, instrument, trace};

use crate::error::{TunnelError, TunnelResult};
use crate::transfer;

/// Size of the length header in bytes.
pub const HEADER_SIZE: usize = 4;

/// Largest payload accepted in either direction.
pub const MAX_FRAME_SIZE: usize = 4096;

/// Interpret a header, rejecting lengths that would never be produced by a
/// device before any buffer is sized from them.
pub fn parse_header(header: &[u8; HEADER_SIZE]) -> TunnelResult<usize> {
    let declared = BigEndian::read_u32(header) as usize;
    if declared == 0 || declared > MAX_FRAME_SIZE {
        return Err(TunnelError::ProtocolViolation {
            declared,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(declared)
}

/// Write the header for a payload of `len` bytes into `out`.
fn put_header(out: &mut [u8], len: usize) {
    BigEndian::write_u32(&mut out[..HEADER_SIZE], len as u32);
}

fn check_payload(len: usize) -> TunnelResult<()> {
    if len == 0 || len > MAX_FRAME_SIZE {
        return Err(TunnelError::ProtocolViolation {
            declared: len,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

/// Encode a payload as header + payload.
pub fn encode_frame(payload: &[u8]) -> TunnelResult<Vec<u8>> {
    check_payload(payload.len())?;

    let mut buffer = vec![0u8; HEADER_SIZE + payload.len()];
    put_header(&mut buffer, payload.len());
    buffer[HEADER_SIZE..].copy_from_slice(payload);

    trace!(payload_len = payload.len(), "Frame encoded");
    Ok(buffer)
}

/// Read one frame from `reader` into `buf`.
///
/// Returns `Ok(None)` when the stream ends at (or inside) the header, which
/// is the orderly end of a peer's stream. A stream ending inside the payload
/// is [`TunnelError::Truncated`]. `buf` must hold at least
/// [`MAX_FRAME_SIZE`] bytes.
#[instrument(level = "trace", skip_all)]
pub async fn read_frame<R>(reader: &mut R, buf: &mut [u8]) -> TunnelResult<Option<usize>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_SIZE];
    match transfer::read_exact(reader, &mut header).await {
        Ok(()) => {}
        Err(TunnelError::ConnectionClosed { received, .. }) => {
            debug!(header_bytes = received, "Stream ended at frame boundary");
            return Ok(None);
        }
        Err(e) => return Err(e),
    }

    let len = parse_header(&header)?;
    let capacity = buf.len();
    let payload = buf.get_mut(..len).ok_or(TunnelError::ProtocolViolation {
        declared: len,
        max: capacity,
    })?;
    match transfer::read_exact(reader, payload).await {
        Ok(()) => Ok(Some(len)),
        Err(TunnelError::ConnectionClosed { received, expected }) => Err(TunnelError::Truncated {
            expected,
            actual: received,
        }),
        Err(e) => Err(e),
    }
}

/// Write one frame to `writer` as a single header + payload buffer.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> TunnelResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let encoded = encode_frame(payload)?;
    transfer::write_exact(writer, &encoded).await
}

/// Incremental decoder for readiness-driven reads.
///
/// Bytes are appended as they arrive; complete frames are handed out in
/// order and incomplete data stays buffered for the next call.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Length of the frame being assembled, once its header has been parsed
    pending: Option<usize>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder {
            buffer: Vec::with_capacity(HEADER_SIZE + MAX_FRAME_SIZE),
            pending: None,
        }
    }

    /// Append newly received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Take the next complete frame, if one is buffered.
    ///
    /// The header is validated as soon as its four bytes are present, so an
    /// oversized length is reported without waiting for (or buffering) the
    /// payload it announces.
    pub fn next_frame(&mut self) -> TunnelResult<Option<Vec<u8>>> {
        let len = match self.pending {
            Some(len) => len,
            None => {
                if self.buffer.len() < HEADER_SIZE {
                    return Ok(None);
                }
                let mut header = [0u8; HEADER_SIZE];
                header.copy_from_slice(&self.buffer[..HEADER_SIZE]);
                let len = parse_header(&header)?;
                self.pending = Some(len);
                len
            }
        };

        if self.buffer.len() < HEADER_SIZE + len {
            return Ok(None);
        }

        let frame = self.buffer[HEADER_SIZE..HEADER_SIZE + len].to_vec();
        self.buffer.drain(..HEADER_SIZE + len);
        self.pending = None;
        Ok(Some(frame))
    }

    /// Number of bytes received but not yet returned as frames.
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Whether a frame has been started but not completed.
    pub fn is_mid_frame(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// `(declared, received)` payload sizes of a frame whose header has been
    /// parsed but whose payload is incomplete.
    pub fn pending_payload(&self) -> Option<(usize, usize)> {
        self.pending
            .map(|len| (len, self.buffer.len().saturating_sub(HEADER_SIZE)))
    }
}
