//! Byte-level framing over a reliable ordered stream.
//!
//! Each frame is emitted as: ASCII-decimal length, one zero byte
//! separator, then exactly `length` bytes of payload. The receiver
//! maintains a carry buffer; it scans forward for the first zero byte,
//! parses the prefix as a decimal length, and if the remaining buffer
//! holds at least `length` bytes, extracts that payload and continues
//! scanning the remainder; otherwise it keeps the partial frame for
//! the next chunk.

pub mod tcp;

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::engine::error::*;

pub use self::tcp::{bind, connect, Listener, Socket};

enum ScanResult {
    Frame { payload: Vec<u8>, consumed: usize },
    /// Not enough bytes buffered yet to know, or to complete, a frame.
    Incomplete,
    /// The length prefix itself could not be parsed as a decimal
    /// integer; `consumed` bytes (prefix + separator) are dropped so
    /// scanning can resync on the next zero byte.
    InvalidPrefix { consumed: usize },
}

fn scan_one(buf: &[u8]) -> ScanResult {
    let sep = match buf.iter().position(|&b| b == 0) {
        Some(sep) => sep,
        None => return ScanResult::Incomplete,
    };
    let body_start = sep + 1;

    let len = std::str::from_utf8(&buf[..sep])
        .ok()
        .and_then(|s| s.parse::<usize>().ok());

    let len = match len {
        Some(len) => len,
        None => return ScanResult::InvalidPrefix { consumed: body_start },
    };

    let body_end = body_start + len;
    if buf.len() < body_end {
        return ScanResult::Incomplete;
    }

    ScanResult::Frame {
        payload: buf[body_start..body_end].to_vec(),
        consumed: body_end,
    }
}

/// Prepends the `ASCII(len) || 0x00` header to `payload`, producing a
/// complete frame ready to be written to the wire.
pub fn frame_bytes(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 12);
    out.extend_from_slice(payload.len().to_string().as_bytes());
    out.push(0);
    out.extend_from_slice(payload);
    out
}

/// Incremental frame scanner, independent of any I/O source. Feeding
/// it byte chunks of any size — one byte at a time, or the whole
/// stream at once — produces the same sequence of frames.
#[derive(Default)]
pub struct FrameScanner {
    carry: Vec<u8>,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly received bytes to the carry buffer.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.carry.extend_from_slice(chunk);
    }

    /// Extracts every complete frame currently available, leaving any
    /// trailing partial frame in the carry buffer for the next
    /// `feed()`. Empty-payload frames are tolerated and dropped.
    pub fn drain_frames(&mut self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        loop {
            match scan_one(&self.carry) {
                ScanResult::Frame { payload, consumed } => {
                    self.carry.drain(..consumed);
                    if !payload.is_empty() {
                        frames.push(payload);
                    }
                }
                ScanResult::InvalidPrefix { consumed } => {
                    tracing::debug!("dropping frame with unparseable length prefix");
                    self.carry.drain(..consumed);
                }
                ScanResult::Incomplete => break,
            }
        }
        frames
    }
}

/// Writes one frame (`ASCII(len) || 0x00 || body`) to `writer`.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    writer
        .write_all(&frame_bytes(payload))
        .await
        .wrapped(ErrorKind::Communication)
}

/// Buffers reads off of an `AsyncRead` and yields complete frames.
pub struct FramedReader<R> {
    inner: R,
    scanner: FrameScanner,
    queue: VecDeque<Vec<u8>>,
    buf: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    const BUFSIZ_RECV: usize = 16384;

    pub fn new(inner: R) -> Self {
        FramedReader {
            inner,
            scanner: FrameScanner::new(),
            queue: VecDeque::new(),
            buf: vec![0; Self::BUFSIZ_RECV].into_boxed_slice(),
        }
    }

    /// Returns the next complete frame, reading from the underlying
    /// stream as needed. Returns `Ok(None)` on a clean EOF.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(frame) = self.queue.pop_front() {
                return Ok(Some(frame));
            }
            let n = self
                .inner
                .read(&mut self.buf)
                .await
                .wrapped(ErrorKind::Communication)?;
            if n == 0 {
                return Ok(None);
            }
            self.scanner.feed(&self.buf[..n]);
            self.queue.extend(self.scanner.drain_frames());
        }
    }
}

impl<R: AsyncWrite + Unpin> FramedReader<R> {
    /// Writes one frame directly on the wrapped socket. For protocols
    /// that need to write a response in the middle of a read loop —
    /// the encrypted transport's handshake, notably — without giving
    /// up the frame-scanning state already accumulated for reads.
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        write_frame(&mut self.inner, payload).await
    }
}
