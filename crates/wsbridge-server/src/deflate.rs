//! Read-side `permessage-deflate` (RFC 7692) for backend sockets.
//!
//! tungstenite has no extension support and rejects frames with RSV1 set, so
//! [`InflateStream`] sits between the transport and the WebSocket client. It
//! passes the upgrade response through untouched, notes whether the backend
//! accepted the deflate offer, and from then on rewrites every compressed
//! data frame into its inflated, RSV1-clear equivalent before tungstenite
//! parses it. Writes are never compressed; the extension lets a client send
//! plain frames.

use flate2::{Decompress, FlushDecompress};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// Appended to the last fragment of every compressed message before inflating.
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Upper bound on an upgrade response head.
const MAX_HEAD: usize = 64 * 1024;

const READ_CHUNK: usize = 8 * 1024;
const INFLATE_CHUNK: usize = 4 * 1024;

const FIN: u8 = 0x80;
const RSV1: u8 = 0x40;
const OP_CONTINUATION: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for the end of the upgrade response.
    Handshake,
    Inflating,
    /// Extension not negotiated, or the stream gave up on frame parsing.
    Passthrough,
}

/// Raw-deflate decompressor with context takeover across messages.
struct Inflater {
    decompress: Decompress,
}

impl Inflater {
    fn new() -> Self {
        Self {
            decompress: Decompress::new(false),
        }
    }

    /// Inflate `input` onto `out`, stopping once `out` grows past `limit`.
    fn inflate(&mut self, mut input: &[u8], out: &mut Vec<u8>, limit: usize) -> io::Result<()> {
        loop {
            if out.len() > limit {
                return Ok(());
            }
            out.reserve(INFLATE_CHUNK);
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            self.decompress
                .decompress_vec(input, out, FlushDecompress::None)
                .map_err(inflate_error)?;
            let consumed = (self.decompress.total_in() - before_in) as usize;
            let produced = self.decompress.total_out() - before_out;
            input = &input[consumed..];
            if consumed == 0 && produced == 0 {
                return Ok(());
            }
        }
    }
}

fn inflate_error(e: flate2::DecompressError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("inflate: {e}"))
}

/// Transport adapter that inflates compressed frames on the read path.
pub struct InflateStream<S> {
    inner: S,
    phase: Phase,
    /// Bytes read from `inner` and not yet processed.
    raw: Vec<u8>,
    /// Processed bytes waiting to be handed to the reader.
    ready: Vec<u8>,
    pos: usize,
    eof: bool,
    inflater: Inflater,
    /// Inside a fragmented compressed message.
    in_message: bool,
    limit: usize,
}

impl<S> InflateStream<S> {
    /// Wrap a transport whose next bytes are the upgrade response.
    ///
    /// `limit` is the largest message the WebSocket layer accepts; inflated
    /// output is cut just past it so the oversized frame still fails there.
    pub fn new(inner: S, limit: usize) -> Self {
        Self {
            inner,
            phase: Phase::Handshake,
            raw: Vec::new(),
            ready: Vec::new(),
            pos: 0,
            eof: false,
            inflater: Inflater::new(),
            in_message: false,
            limit,
        }
    }

    /// Wrap a transport that is already past the upgrade.
    #[cfg(test)]
    fn after_handshake(inner: S, limit: usize, deflate: bool) -> Self {
        let mut stream = Self::new(inner, limit);
        stream.phase = if deflate {
            Phase::Inflating
        } else {
            Phase::Passthrough
        };
        stream
    }

    pub fn deflate_negotiated(&self) -> bool {
        self.phase == Phase::Inflating
    }

    /// Move whatever can be processed from `raw` to `ready`. Returns false
    /// when more input is needed.
    fn process(&mut self) -> io::Result<bool> {
        match self.phase {
            Phase::Handshake => {
                let Some(end) = find_head_end(&self.raw) else {
                    if self.raw.len() > MAX_HEAD {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "upgrade response head too large",
                        ));
                    }
                    return Ok(false);
                };
                let head: Vec<u8> = self.raw.drain(..end).collect();
                self.phase = if deflate_accepted(&head) {
                    Phase::Inflating
                } else {
                    Phase::Passthrough
                };
                debug!(deflate = self.phase == Phase::Inflating, "backend upgrade response");
                self.ready.extend_from_slice(&head);
                Ok(true)
            }
            Phase::Passthrough => {
                if self.raw.is_empty() {
                    return Ok(false);
                }
                self.ready.append(&mut self.raw);
                Ok(true)
            }
            Phase::Inflating => self.process_frame(),
        }
    }

    fn process_frame(&mut self) -> io::Result<bool> {
        let Some((header_len, payload_len)) = frame_header(&self.raw) else {
            return Ok(false);
        };
        if payload_len > self.limit as u64 {
            // Let the WebSocket layer see, and reject, the oversized frame.
            self.phase = Phase::Passthrough;
            return Ok(true);
        }
        let total = header_len + payload_len as usize;
        if self.raw.len() < total {
            return Ok(false);
        }

        let b0 = self.raw[0];
        let opcode = b0 & 0x0f;
        let masked = self.raw[1] & 0x80 != 0;
        let fin = b0 & FIN != 0;
        let compressed = !masked
            && match opcode {
                OP_TEXT | OP_BINARY => b0 & RSV1 != 0,
                OP_CONTINUATION => self.in_message,
                _ => false,
            };
        if compressed {
            self.in_message = !fin;
        } else if matches!(opcode, OP_TEXT | OP_BINARY) {
            self.in_message = false;
        }

        if !compressed {
            self.ready.extend(self.raw.drain(..total));
            return Ok(true);
        }

        let mut inflated = Vec::new();
        self.inflater
            .inflate(&self.raw[header_len..total], &mut inflated, self.limit)?;
        if fin {
            self.inflater
                .inflate(&DEFLATE_TRAILER, &mut inflated, self.limit)?;
        }
        self.raw.drain(..total);
        put_header(&mut self.ready, b0 & !RSV1, inflated.len());
        self.ready.extend_from_slice(&inflated);
        Ok(true)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for InflateStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pos < this.ready.len() {
                let n = buf.remaining().min(this.ready.len() - this.pos);
                buf.put_slice(&this.ready[this.pos..this.pos + n]);
                this.pos += n;
                if this.pos == this.ready.len() {
                    this.ready.clear();
                    this.pos = 0;
                }
                return Poll::Ready(Ok(()));
            }
            if this.process()? {
                continue;
            }
            if this.eof {
                if this.raw.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                // Truncated frame: hand it over and let the reader fail on it.
                this.ready.append(&mut this.raw);
                continue;
            }
            let mut chunk = [0u8; READ_CHUNK];
            let mut read = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read))?;
            if read.filled().is_empty() {
                this.eof = true;
            } else {
                this.raw.extend_from_slice(read.filled());
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for InflateStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Whether the upgrade response accepts `permessage-deflate`.
fn deflate_accepted(head: &[u8]) -> bool {
    String::from_utf8_lossy(head)
        .lines()
        .filter_map(|line| line.split_once(':'))
        .filter(|(name, _)| name.trim().eq_ignore_ascii_case("sec-websocket-extensions"))
        .flat_map(|(_, value)| value.split(','))
        .any(|ext| ext.split(';').next().unwrap_or_default().trim() == "permessage-deflate")
}

/// Header length and payload length of the frame at the start of `buf`, once
/// the whole header is buffered.
fn frame_header(buf: &[u8]) -> Option<(usize, u64)> {
    if buf.len() < 2 {
        return None;
    }
    let (extended, payload_len) = match buf[1] & 0x7f {
        126 => {
            let bytes = buf.get(2..4)?;
            (2, u64::from(u16::from_be_bytes([bytes[0], bytes[1]])))
        }
        127 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(buf.get(2..10)?);
            (8, u64::from_be_bytes(bytes))
        }
        n => (0, u64::from(n)),
    };
    let mask = if buf[1] & 0x80 != 0 { 4 } else { 0 };
    let header_len = 2 + extended + mask;
    (buf.len() >= header_len).then_some((header_len, payload_len))
}

/// Unmasked frame header with the shortest length encoding.
fn put_header(out: &mut Vec<u8>, b0: u8, len: usize) {
    out.push(b0);
    if len < 126 {
        out.push(len as u8);
    } else if let Ok(short) = u16::try_from(len) {
        out.push(126);
        out.extend_from_slice(&short.to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
}
