//! Outbound bridge: owns the backend-facing socket of every bridged pair.
//!
//! A backend socket is dialed lazily, the first time its inbound socket has a
//! frame to forward, and is keyed by that inbound socket id for its lifetime.

use crate::bridge::{broadcast_to, process_frame, resolve_ids, Bridge, Direction};
use crate::deflate::InflateStream;
use crate::index::ClientIndex;
use crate::registry::ConnectionRegistry;
use crate::socket::{
    drive, ws_config, BridgeStats, BroadcastReport, FrameHandler, FrameVerdict, SocketHandle,
    SocketSession, SocketTable, CLOSE_GOING_AWAY, CLOSE_SERVER_ERROR,
};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use wsbridge_core::pipeline::BoxFuture;
use wsbridge_core::{template, BridgeError, BridgeResult, ConnectionEntity, Frame, PolicyPipeline};

/// Handshake headers owned by the WebSocket client itself.
const HOP_HEADERS: &[&str] = &[
    "host",
    "upgrade",
    "connection",
    "content-length",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "sec-websocket-accept",
];

const DEFLATE_OFFER: &str = "permessage-deflate; client_max_window_bits";

type BackendStream = WebSocketStream<InflateStream<MaybeTlsStream<TcpStream>>>;

pub struct OutboundBridge {
    entity: Arc<ConnectionEntity>,
    registry: Arc<ConnectionRegistry>,
    pipeline: Arc<dyn PolicyPipeline>,
    /// Backend sockets, keyed by the paired inbound socket id.
    sockets: SocketTable,
    index: ClientIndex,
    stats: BridgeStats,
}

impl OutboundBridge {
    pub fn new(
        entity: Arc<ConnectionEntity>,
        registry: Arc<ConnectionRegistry>,
        pipeline: Arc<dyn PolicyPipeline>,
    ) -> Arc<Self> {
        Arc::new(Self {
            entity,
            registry,
            pipeline,
            sockets: SocketTable::new(),
            index: ClientIndex::new(),
            stats: BridgeStats::default(),
        })
    }

    pub fn entity(&self) -> &ConnectionEntity {
        &self.entity
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    pub fn socket(&self, socket_id: &str) -> Option<Arc<SocketHandle>> {
        self.sockets.get(socket_id)
    }

    /// Forward one frame for an inbound socket, dialing the backend first if
    /// this socket has no backend connection yet.
    pub async fn forward(
        self: &Arc<Self>,
        session: &SocketSession,
        frame: Frame,
    ) -> BridgeResult<()> {
        let socket_id = session.handle.id();
        if let Some(handle) = self.sockets.get(socket_id) {
            return handle.deliver(frame);
        }
        let handle = self.connect(session).await?;
        handle.deliver(frame)
    }

    async fn connect(self: &Arc<Self>, inbound: &SocketSession) -> BridgeResult<Arc<SocketHandle>> {
        let socket_id = inbound.handle.id().to_string();
        let url = template::resolve(
            &self.entity.outbound.url_template,
            &inbound.request.variables,
        )?;
        let ws = self.dial(&url, inbound).await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Arc::new(SocketHandle::new(
            socket_id.clone(),
            inbound.handle.client_id().map(str::to_string),
            inbound.handle.subprotocol().map(str::to_string),
            tx,
            None,
        ));
        self.sockets.insert(handle.clone());
        if let Some(cid) = handle.client_id() {
            self.index.add(cid, handle.id());
        }
        BridgeStats::bump(&self.stats.opened);

        // The inbound side may have gone away while we were dialing.
        let inbound_alive = self
            .registry
            .inbound(&self.entity.id)
            .is_ok_and(|b| b.is_open(&socket_id));
        if !inbound_alive {
            self.teardown(&handle, CLOSE_GOING_AWAY, "inbound socket closed", false);
            return Err(BridgeError::NotAvailable(socket_id));
        }

        info!(bridge = %self.entity.id, socket_id = %socket_id, url = %url, "outbound socket open");

        let mut session = SocketSession {
            handle: handle.clone(),
            request: inbound.request.clone(),
            auth: inbound.auth.clone(),
            origin: inbound.origin.clone(),
        };
        let this = self.clone();
        let idle = self.entity.idle_timeout();
        self.registry.runtime().spawn(async move {
            let mut ws = ws;
            let cause = drive(&mut ws, &mut rx, &mut session, this.as_ref(), idle).await;
            this.teardown(&session.handle, cause.code, &cause.reason, true);
            session.handle.mark_closed();
        });
        Ok(handle)
    }

    async fn dial(&self, url: &str, inbound: &SocketSession) -> BridgeResult<BackendStream> {
        let mut request = url
            .into_client_request()
            .map_err(|e| BridgeError::Transport(format!("bad outbound url {url}: {e}")))?;
        let headers = request.headers_mut();
        for (name, value) in &inbound.request.headers {
            if HOP_HEADERS.contains(&name.as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
        headers.insert(
            HeaderName::from_static("sec-websocket-extensions"),
            HeaderValue::from_static(DEFLATE_OFFER),
        );

        let timeout = self
            .entity
            .outbound
            .dial_timeout_secs
            .map(std::time::Duration::from_secs)
            .unwrap_or_else(|| self.registry.dial_timeout());
        debug!(
            bridge = %self.entity.id,
            url = %url,
            timeout_ms = timeout.as_millis() as u64,
            "dialing backend"
        );
        match tokio::time::timeout(timeout, self.open(request)).await {
            Ok(Ok(ws)) => Ok(ws),
            Ok(Err(e)) => Err(BridgeError::Transport(format!("dial {url} failed: {e}"))),
            Err(_) => Err(BridgeError::DialTimeout(url.to_string())),
        }
    }

    /// TCP connect, TLS for `wss`, then the upgrade over an inflating stream.
    async fn open(&self, request: Request) -> Result<BackendStream, String> {
        let uri = request.uri();
        let secure = match uri.scheme_str() {
            Some("wss") => true,
            Some("ws") => false,
            other => return Err(format!("unsupported scheme {other:?}")),
        };
        let host = uri
            .host()
            .ok_or("url has no host")?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });

        let tcp = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| e.to_string())?;
        let _ = tcp.set_nodelay(true);
        let stream = if secure {
            let name = ServerName::try_from(host).map_err(|e| e.to_string())?;
            let connector = TlsConnector::from(self.registry.client_tls(&self.entity.id));
            let tls = connector
                .connect(name, tcp)
                .await
                .map_err(|e| format!("tls: {e}"))?;
            MaybeTlsStream::Rustls(tls)
        } else {
            MaybeTlsStream::Plain(tcp)
        };

        let stream = InflateStream::new(stream, self.entity.max_message_size);
        let config = ws_config(self.entity.max_message_size);
        let (ws, _response) =
            tokio_tungstenite::client_async_with_config(request, stream, Some(config))
                .await
                .map_err(|e| e.to_string())?;
        debug!(
            bridge = %self.entity.id,
            deflate = ws.get_ref().deflate_negotiated(),
            "backend upgrade complete"
        );
        Ok(ws)
    }

    /// Deliver a frame to an existing backend socket. Used by injection;
    /// never dials.
    pub fn deliver(&self, socket_id: &str, frame: Frame) -> BridgeResult<()> {
        self.sockets
            .get(socket_id)
            .ok_or_else(|| BridgeError::NotAvailable(socket_id.to_string()))?
            .deliver(frame)
    }

    fn detach(&self, handle: &Arc<SocketHandle>) {
        self.sockets.remove(handle);
        if let Some(cid) = handle.client_id() {
            self.index.remove(cid, handle.id());
        }
        BridgeStats::bump(&self.stats.closed);
    }

    /// Local close path for a backend socket. Only the first caller for a
    /// socket does anything; `notify_peer` closes the paired inbound socket.
    pub fn teardown(&self, handle: &Arc<SocketHandle>, code: u16, reason: &str, notify_peer: bool) {
        if !handle.begin_close() {
            return;
        }
        self.detach(handle);
        info!(
            bridge = %self.entity.id,
            socket_id = %handle.id(),
            code,
            reason = %reason,
            "outbound socket closed"
        );
        handle.request_close(code, reason);
        if !notify_peer {
            return;
        }
        if let Ok(inbound) = self.registry.inbound(&self.entity.id) {
            inbound.close_peer(handle.id(), code, reason);
        }
    }

    /// Close every backend socket with 1001.
    pub async fn stop(&self) {
        for handle in self.sockets.snapshot() {
            if handle.begin_close() {
                self.detach(&handle);
                handle.request_close(CLOSE_GOING_AWAY, "going away");
            }
        }
        info!(bridge = %self.entity.id, "outbound bridge stopped");
    }
}

impl FrameHandler for OutboundBridge {
    fn on_frame<'a>(
        &'a self,
        session: &'a mut SocketSession,
        frame: Frame,
    ) -> BoxFuture<'a, FrameVerdict> {
        Box::pin(async move {
            debug!(socket_id = %session.handle.id(), bytes = frame.len(), "backend frame");
            let service = self.entity.outbound.message_policy.as_deref();
            let frame = match process_frame(self.pipeline.as_ref(), service, session, frame).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return FrameVerdict::Continue,
                Err(reason) => {
                    warn!(
                        socket_id = %session.handle.id(),
                        reason = %reason,
                        "backend message rejected by policy"
                    );
                    return FrameVerdict::Close {
                        code: CLOSE_SERVER_ERROR,
                        reason,
                    };
                }
            };
            let delivered = self
                .registry
                .inbound(&self.entity.id)
                .and_then(|inbound| inbound.send(session.handle.id(), frame));
            match delivered {
                Ok(()) => FrameVerdict::Continue,
                Err(e) => {
                    debug!(socket_id = %session.handle.id(), error = %e, "inbound side gone");
                    FrameVerdict::Close {
                        code: CLOSE_SERVER_ERROR,
                        reason: e.to_string(),
                    }
                }
            }
        })
    }
}

impl Bridge for OutboundBridge {
    fn id(&self) -> &str {
        &self.entity.id
    }

    fn direction(&self) -> Direction {
        Direction::Outbound
    }

    fn resolve_socket_ids(&self, id: &str, subprotocol: Option<&str>) -> Vec<String> {
        resolve_ids(&self.entity.id, &self.index, id, subprotocol)
    }

    /// Always fails: backend sockets only come into existence through
    /// [`OutboundBridge::forward`], which needs the inbound session.
    fn send(&self, socket_id: &str, _frame: Frame) -> BridgeResult<()> {
        Err(BridgeError::Unsupported(format!(
            "outbound send to {socket_id} without a connection url; use forward"
        )))
    }

    fn broadcast(&self, frame: &Frame) -> BroadcastReport {
        broadcast_to(&self.sockets, frame)
    }

    fn close_peer(&self, socket_id: &str, code: u16, reason: &str) {
        let Some(handle) = self.sockets.get(socket_id) else {
            debug!(socket_id = %socket_id, "peer close for unknown outbound socket");
            return;
        };
        if !handle.begin_close() {
            return;
        }
        self.detach(&handle);
        BridgeStats::bump(&self.stats.peer_closes);
        info!(
            bridge = %self.entity.id,
            socket_id = %socket_id,
            code,
            "outbound socket closed by peer"
        );
        handle.request_close(code, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::CLOSE_NORMAL;
    use crate::testutil::{self, close_code, connect, eventually, next_text};
    use futures_util::{SinkExt, StreamExt};
    use std::borrow::Cow;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::Message;

    fn template_for(addr: SocketAddr) -> String {
        format!("ws://{addr}${{request.path}}")
    }

    #[tokio::test]
    async fn dials_lazily_and_routes_both_ways() {
        let registry = testutil::registry();
        let (backend, paths) = testutil::echo_backend().await;
        let entity = testutil::entity("relay", &template_for(backend));
        let (inbound, outbound, addr) =
            testutil::start_pair(&registry, entity, testutil::pass()).await;
        let outbound = outbound.unwrap();

        let mut ws = connect(addr, "/feed").await;
        assert!(eventually(|| inbound.socket_count() == 1).await);
        assert_eq!(outbound.socket_count(), 0);

        ws.send(Message::Text("a".into())).await.unwrap();
        assert_eq!(next_text(&mut ws).await, "backend:a");
        ws.send(Message::Text("b".into())).await.unwrap();
        assert_eq!(next_text(&mut ws).await, "backend:b");

        assert_eq!(outbound.socket_count(), 1);
        assert_eq!(BridgeStats::get(&outbound.stats().opened), 1);
        assert_eq!(*paths.lock().unwrap(), vec!["/feed".to_string()]);

        ws.close(None).await.unwrap();
        assert!(eventually(|| outbound.socket_count() == 0).await);
        assert_eq!(BridgeStats::get(&outbound.stats().peer_closes), 1);
    }

    #[tokio::test]
    async fn unresolved_template_closes_client() {
        let registry = testutil::registry();
        let entity = testutil::entity("tmpl", "ws://127.0.0.1:1/${request.header.x-tenant}");
        let (inbound, outbound, addr) =
            testutil::start_pair(&registry, entity, testutil::pass()).await;

        let mut ws = connect(addr, "/").await;
        ws.send(Message::Text("hello".into())).await.unwrap();
        assert_eq!(close_code(&mut ws).await, Some(CLOSE_SERVER_ERROR));
        assert!(eventually(|| inbound.socket_count() == 0).await);
        assert_eq!(outbound.unwrap().socket_count(), 0);
    }

    #[tokio::test]
    async fn refused_dial_closes_client() {
        let registry = testutil::registry();
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let entity = testutil::entity("dead", &template_for(dead));
        let (_inbound, _, addr) = testutil::start_pair(&registry, entity, testutil::pass()).await;

        let mut ws = connect(addr, "/").await;
        ws.send(Message::Text("hello".into())).await.unwrap();
        assert_eq!(close_code(&mut ws).await, Some(CLOSE_SERVER_ERROR));
    }

    #[tokio::test]
    async fn stalled_backend_times_out() {
        let registry = testutil::registry();
        // Accepts TCP but never answers the upgrade.
        let stall = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stall_addr = stall.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = stall.accept().await {
                held.push(stream);
            }
        });
        let mut entity = testutil::entity("slow", &template_for(stall_addr));
        entity.outbound.dial_timeout_secs = Some(1);
        let (inbound, _, addr) = testutil::start_pair(&registry, entity, testutil::pass()).await;

        let mut ws = connect(addr, "/").await;
        ws.send(Message::Text("hello".into())).await.unwrap();
        assert_eq!(close_code(&mut ws).await, Some(CLOSE_SERVER_ERROR));
        assert!(eventually(|| inbound.socket_count() == 0).await);
    }

    #[tokio::test]
    async fn backend_close_propagates_code() {
        let registry = testutil::registry();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = ws.next().await;
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::from(4000),
                    reason: Cow::Borrowed("done"),
                }))
                .await;
            while let Some(Ok(_)) = ws.next().await {}
        });
        let entity = testutil::entity("closer", &template_for(backend));
        let (inbound, outbound, addr) =
            testutil::start_pair(&registry, entity, testutil::pass()).await;

        let mut ws = connect(addr, "/").await;
        ws.send(Message::Text("bye".into())).await.unwrap();
        assert_eq!(close_code(&mut ws).await, Some(4000));
        assert!(eventually(|| inbound.socket_count() == 0).await);
        assert_eq!(BridgeStats::get(&inbound.stats().peer_closes), 1);
        assert_eq!(inbound.admission().active(), 0);
        assert_eq!(outbound.unwrap().socket_count(), 0);
    }

    #[tokio::test]
    async fn teardown_notifies_inbound_once() {
        let registry = testutil::registry();
        let (backend, _) = testutil::echo_backend().await;
        let entity = testutil::entity("pair", &template_for(backend));
        let (inbound, outbound, addr) =
            testutil::start_pair(&registry, entity, testutil::pass()).await;
        let outbound = outbound.unwrap();

        let mut ws = connect(addr, "/").await;
        ws.send(Message::Text("x".into())).await.unwrap();
        assert_eq!(next_text(&mut ws).await, "backend:x");

        let handle = outbound.sockets.snapshot().remove(0);
        outbound.teardown(&handle, CLOSE_NORMAL, "done", true);
        outbound.teardown(&handle, CLOSE_NORMAL, "done", true);
        outbound.close_peer(handle.id(), CLOSE_NORMAL, "done");

        assert_eq!(close_code(&mut ws).await, Some(CLOSE_NORMAL));
        assert_eq!(BridgeStats::get(&outbound.stats().closed), 1);
        assert_eq!(BridgeStats::get(&outbound.stats().peer_closes), 0);
        assert_eq!(BridgeStats::get(&inbound.stats().peer_closes), 1);
        assert!(eventually(|| inbound.admission().active() == 0).await);
    }

    /// Backend that accepts the deflate offer and answers with one
    /// compressed "Hello" (the RFC 7692 section 7.2.3.1 sample). Reports the
    /// extension header it was offered.
    async fn compressing_backend() -> (SocketAddr, oneshot::Receiver<Option<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (offer_tx, offer_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                stream.read_exact(&mut byte).await.unwrap();
                head.push(byte[0]);
            }
            let head = String::from_utf8(head).unwrap();
            let header = |name: &str| {
                head.lines().find_map(|line| {
                    let (n, v) = line.split_once(':')?;
                    n.eq_ignore_ascii_case(name).then(|| v.trim().to_string())
                })
            };
            let key = header("sec-websocket-key").unwrap();
            let _ = offer_tx.send(header("sec-websocket-extensions"));
            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {}\r\n\
                 Sec-WebSocket-Extensions: permessage-deflate\r\n\r\n",
                derive_accept_key(key.as_bytes())
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            let hello = [0xc1, 0x07, 0xf2, 0x48, 0xcd, 0xc9, 0xc9, 0x07, 0x00];
            stream.write_all(&hello).await.unwrap();
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        });
        (addr, offer_rx)
    }

    #[tokio::test]
    async fn compressed_backend_frames_are_inflated() {
        let registry = testutil::registry();
        let (backend, offer) = compressing_backend().await;
        let entity = testutil::entity("zip", &template_for(backend));
        let (inbound, outbound, addr) =
            testutil::start_pair(&registry, entity, testutil::pass()).await;

        let mut ws = connect(addr, "/").await;
        ws.send(Message::Text("hi".into())).await.unwrap();
        assert_eq!(next_text(&mut ws).await, "Hello");

        let offer = offer.await.unwrap().unwrap();
        assert!(offer.starts_with("permessage-deflate"));
        assert_eq!(inbound.socket_count(), 1);
        assert_eq!(outbound.unwrap().socket_count(), 1);
    }

    #[tokio::test]
    async fn idle_pair_closes_normally() {
        let registry = testutil::registry();
        let (backend, _) = testutil::echo_backend().await;
        let mut entity = testutil::entity("idle", &template_for(backend));
        entity.max_idle_secs = 1;
        let (inbound, outbound, addr) =
            testutil::start_pair(&registry, entity, testutil::pass()).await;
        let outbound = outbound.unwrap();

        let mut ws = connect(addr, "/").await;
        ws.send(Message::Text("once".into())).await.unwrap();
        assert_eq!(next_text(&mut ws).await, "backend:once");
        assert_eq!(outbound.socket_count(), 1);

        assert_eq!(close_code(&mut ws).await, Some(CLOSE_NORMAL));
        assert!(eventually(|| inbound.socket_count() == 0).await);
        assert!(eventually(|| outbound.socket_count() == 0).await);
        assert_eq!(BridgeStats::get(&outbound.stats().closed), 1);
        assert_eq!(inbound.admission().active(), 0);
    }

    #[tokio::test]
    async fn plain_send_is_unsupported() {
        let registry = testutil::registry();
        let entity = Arc::new(testutil::entity("plain", "ws://127.0.0.1:1/"));
        let outbound = OutboundBridge::new(entity, registry, testutil::pass());
        assert!(matches!(
            outbound.send("plain:1:", Frame::Text("x".into())),
            Err(BridgeError::Unsupported(_))
        ));
        assert!(matches!(
            outbound.deliver("plain:1:", Frame::Text("x".into())),
            Err(BridgeError::NotAvailable(_))
        ));
        assert!(outbound.broadcast(&Frame::Text("x".into())).failed.is_empty());
    }
}
