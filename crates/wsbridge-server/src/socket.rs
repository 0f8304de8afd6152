//! Per-socket state shared by the inbound and outbound bridges.
//!
//! Every physical socket runs in its own task ([`drive`]). Other tasks talk
//! to it only through its [`SocketHandle`]: frames and close requests are
//! queued on an unbounded channel and applied by the socket task in order.
//!
//! Lifecycle: `Open → Active → Closing → Closed`. The move into `Closing` is
//! a single compare-and-swap ([`SocketHandle::begin_close`]); whichever
//! trigger wins it runs teardown, every later trigger is a no-op.

use crate::admission::ConnectionGuard;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};
use wsbridge_core::pipeline::BoxFuture;
use wsbridge_core::{AuthContext, BridgeError, BridgeResult, Frame, RequestContext};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_TOO_BIG: u16 = 1009;
pub const CLOSE_SERVER_ERROR: u16 = 1011;
pub const CLOSE_TRY_AGAIN: u16 = 1013;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketState {
    Open = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl SocketState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Open,
            1 => Self::Active,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Work queued for a socket task.
#[derive(Debug)]
pub enum SocketCommand {
    Send(Frame),
    Close { code: u16, reason: String },
}

/// Shared handle to one live socket.
#[derive(Debug)]
pub struct SocketHandle {
    id: String,
    client_id: Option<String>,
    subprotocol: Option<String>,
    tx: mpsc::UnboundedSender<SocketCommand>,
    state: AtomicU8,
    guard: Mutex<Option<ConnectionGuard>>,
}

impl SocketHandle {
    pub fn new(
        id: String,
        client_id: Option<String>,
        subprotocol: Option<String>,
        tx: mpsc::UnboundedSender<SocketCommand>,
        guard: Option<ConnectionGuard>,
    ) -> Self {
        Self {
            id,
            client_id,
            subprotocol,
            tx,
            state: AtomicU8::new(SocketState::Open as u8),
            guard: Mutex::new(guard),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    pub fn state(&self) -> SocketState {
        SocketState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.state(), SocketState::Closing | SocketState::Closed)
    }

    pub(crate) fn activate(&self) {
        let _ = self.state.compare_exchange(
            SocketState::Open as u8,
            SocketState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Single-fire transition into `Closing`. Returns `true` for the one
    /// caller that wins and must run teardown.
    pub fn begin_close(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                match SocketState::from_u8(s) {
                    SocketState::Open | SocketState::Active => Some(SocketState::Closing as u8),
                    _ => None,
                }
            })
            .is_ok()
    }

    pub(crate) fn mark_closed(&self) {
        self.state
            .store(SocketState::Closed as u8, Ordering::Release);
    }

    /// Give back the admission slot, if this socket holds one.
    pub(crate) fn release_slot(&self) {
        let guard = self.guard.lock().map(|mut g| g.take()).unwrap_or(None);
        drop(guard);
    }

    /// Queue a frame for the socket task.
    pub fn deliver(&self, frame: Frame) -> BridgeResult<()> {
        if self.is_closing() {
            return Err(BridgeError::NotAvailable(self.id.clone()));
        }
        self.tx
            .send(SocketCommand::Send(frame))
            .map_err(|_| BridgeError::NotAvailable(self.id.clone()))
    }

    /// Ask the socket task to send a close frame and stop.
    pub(crate) fn request_close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(SocketCommand::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

/// Concurrent table of a bridge's live sockets, keyed by socket id.
#[derive(Debug, Default)]
pub struct SocketTable {
    sockets: DashMap<String, Arc<SocketHandle>>,
}

impl SocketTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: Arc<SocketHandle>) {
        self.sockets.insert(handle.id().to_string(), handle);
    }

    pub fn get(&self, socket_id: &str) -> Option<Arc<SocketHandle>> {
        self.sockets.get(socket_id).map(|h| h.clone())
    }

    pub fn contains(&self, socket_id: &str) -> bool {
        self.sockets.contains_key(socket_id)
    }

    /// Remove `handle` only if it is still the registered entry for its id.
    pub fn remove(&self, handle: &Arc<SocketHandle>) -> bool {
        self.sockets
            .remove_if(handle.id(), |_, h| Arc::ptr_eq(h, handle))
            .is_some()
    }

    /// Snapshot of all handles; no shard lock is held after return.
    pub fn snapshot(&self) -> Vec<Arc<SocketHandle>> {
        self.sockets.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }
}

/// Per-bridge counters, exposed for logging and tests.
#[derive(Debug, Default)]
pub struct BridgeStats {
    pub opened: AtomicU64,
    pub closed: AtomicU64,
    pub refused: AtomicU64,
    pub peer_closes: AtomicU64,
}

impl BridgeStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Result of [`SocketHandle`]-addressed fan-out.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Socket ids that could not be reached.
    pub failed: Vec<String>,
}

/// Deliver `frame` to every handle, best effort.
pub fn fan_out(handles: &[Arc<SocketHandle>], frame: &Frame) -> BroadcastReport {
    let mut report = BroadcastReport::default();
    for handle in handles {
        match handle.deliver(frame.clone()) {
            Ok(()) => report.delivered += 1,
            Err(_) => report.failed.push(handle.id().to_string()),
        }
    }
    report
}

/// Everything a socket task carries besides the transport itself.
#[derive(Debug)]
pub struct SocketSession {
    pub handle: Arc<SocketHandle>,
    pub request: RequestContext,
    pub auth: AuthContext,
    pub origin: Option<String>,
}

/// What the frame handler wants done after one frame.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameVerdict {
    Continue,
    Close { code: u16, reason: String },
}

/// Bridge-specific processing of one incoming data frame.
pub trait FrameHandler: Send + Sync {
    fn on_frame<'a>(
        &'a self,
        session: &'a mut SocketSession,
        frame: Frame,
    ) -> BoxFuture<'a, FrameVerdict>;
}

/// Why a socket task stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseCause {
    pub code: u16,
    pub reason: String,
}

impl CloseCause {
    fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    fn from_error(e: &WsError) -> Self {
        match e {
            WsError::Capacity(c) => Self::new(CLOSE_TOO_BIG, c.to_string()),
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                Self::new(CLOSE_NORMAL, "connection closed")
            }
            other => Self::new(CLOSE_SERVER_ERROR, other.to_string()),
        }
    }
}

/// Transport limits for one entity's sockets.
pub fn ws_config(max_message_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_message_size);
    config.max_frame_size = Some(max_message_size);
    config
}

pub fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(t) => Message::Text(t),
        Frame::Binary(b) => Message::Binary(b),
    }
}

/// Codes that must never appear in a close frame on the wire.
fn sendable_code(code: u16) -> u16 {
    match code {
        1004..=1006 | 1015 => CLOSE_NORMAL,
        c if c < 1000 => CLOSE_NORMAL,
        c => c,
    }
}

/// Close reasons are limited to 123 bytes.
fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= 123 {
        return reason;
    }
    let mut end = 123;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

pub(crate) fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(sendable_code(code)),
        reason: Cow::Owned(truncate_reason(reason).to_string()),
    }))
}

/// Run one socket until it closes, processing frames strictly in arrival order.
///
/// Incoming data frames are handed to `handler` one at a time; the next frame
/// is not read until the handler returns. Queued commands are written in the
/// order they were queued. `idle` closes the socket when no data frame moves
/// in either direction for that long.
pub async fn drive<S, H>(
    ws: &mut WebSocketStream<S>,
    rx: &mut mpsc::UnboundedReceiver<SocketCommand>,
    session: &mut SocketSession,
    handler: &H,
    idle: Option<Duration>,
) -> CloseCause
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: FrameHandler + ?Sized,
{
    let cause = run_frames(ws, rx, session, handler, idle).await;
    // Flushes a pending close reply; a no-op once both sides have closed.
    let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, ws.close(None)).await;
    cause
}

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

async fn run_frames<S, H>(
    ws: &mut WebSocketStream<S>,
    rx: &mut mpsc::UnboundedReceiver<SocketCommand>,
    session: &mut SocketSession,
    handler: &H,
    idle: Option<Duration>,
) -> CloseCause
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: FrameHandler + ?Sized,
{
    session.handle.activate();
    let mut deadline = idle.map(|d| Instant::now() + d);

    loop {
        let idle_wait = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(SocketCommand::Send(frame)) => {
                    trace!(socket_id = %session.handle.id(), bytes = frame.len(), "writing frame");
                    if let Err(e) = ws.send(to_message(frame)).await {
                        return CloseCause::from_error(&e);
                    }
                    deadline = idle.map(|d| Instant::now() + d);
                }
                Some(SocketCommand::Close { code, reason }) => {
                    let _ = ws.send(close_message(code, &reason)).await;
                    return CloseCause::new(code, reason);
                }
                None => return CloseCause::new(CLOSE_GOING_AWAY, "socket handle dropped"),
            },

            msg = ws.next() => {
                let frame = match msg {
                    Some(Ok(Message::Text(t))) => Frame::Text(t),
                    Some(Ok(Message::Binary(b))) => Frame::Binary(b),
                    Some(Ok(Message::Close(frame))) => {
                        let cause = frame
                            .map(|f| CloseCause::new(u16::from(f.code), f.reason.into_owned()))
                            .unwrap_or_else(|| CloseCause::new(CLOSE_NORMAL, "closed by peer"));
                        debug!(
                            socket_id = %session.handle.id(),
                            code = cause.code,
                            "close frame received"
                        );
                        return cause;
                    }
                    // Ping/pong are answered by the transport.
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(socket_id = %session.handle.id(), error = %e, "socket read failed");
                        let cause = CloseCause::from_error(&e);
                        if cause.code == CLOSE_TOO_BIG {
                            let _ = ws.send(close_message(cause.code, &cause.reason)).await;
                        }
                        return cause;
                    }
                    None => return CloseCause::new(CLOSE_NORMAL, "connection closed"),
                };

                deadline = idle.map(|d| Instant::now() + d);
                let verdict = handler.on_frame(session, frame).await;
                if let FrameVerdict::Close { code, reason } = verdict {
                    let _ = ws.send(close_message(code, &reason)).await;
                    return CloseCause::new(code, reason);
                }
            }

            _ = idle_wait => {
                debug!(socket_id = %session.handle.id(), "idle timeout");
                let _ = ws.send(close_message(CLOSE_NORMAL, "idle timeout")).await;
                return CloseCause::new(CLOSE_NORMAL, "idle timeout");
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn test_handle(id: &str) -> (Arc<SocketHandle>, mpsc::UnboundedReceiver<SocketCommand>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(SocketHandle::new(id.to_string(), None, None, tx, None)),
        rx,
    )
}
