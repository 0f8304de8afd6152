//! Inbound bridge: terminates client WebSocket upgrades for one listener.
//!
//! The upgrade request is authorized by the handshake policy before the
//! upgrade completes. Accepted sockets each get their own task that reads
//! frames in order, runs the message policy, then forwards to the outbound
//! bridge (or echoes back in loopback mode).

use crate::admission::AdmissionControl;
use crate::bridge::{broadcast_to, process_frame, resolve_ids, Bridge, Direction};
use crate::index::ClientIndex;
use crate::registry::ConnectionRegistry;
use crate::socket::{
    close_message, drive, ws_config, BridgeStats, BroadcastReport, FrameHandler, FrameVerdict,
    SocketHandle, SocketSession, SocketTable, CLOSE_GOING_AWAY, CLOSE_SERVER_ERROR,
    CLOSE_TRY_AGAIN,
};
use futures_util::SinkExt;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use wsbridge_core::identity::{bearer_token, query_param};
use wsbridge_core::pipeline::BoxFuture;
use wsbridge_core::{
    AuthContext, BridgeError, BridgeResult, ConnectionEntity, Disposition, Frame,
    MessageEnvelope, PolicyPipeline, RequestContext, SocketIdGenerator,
};

/// Outcome of handshake authorization.
#[derive(Debug, PartialEq, Eq)]
enum HandshakeDecision {
    Proceed { client_id: Option<String> },
    Challenge(Option<String>),
    Refuse(String),
}

/// State captured by the upgrade callback for the socket task.
#[derive(Debug)]
struct Accepted {
    socket_id: String,
    client_id: Option<String>,
    subprotocol: Option<String>,
    origin: Option<String>,
    request: RequestContext,
    auth: AuthContext,
}

pub struct InboundBridge {
    entity: Arc<ConnectionEntity>,
    registry: Arc<ConnectionRegistry>,
    pipeline: Arc<dyn PolicyPipeline>,
    ids: SocketIdGenerator,
    sockets: SocketTable,
    index: ClientIndex,
    admission: AdmissionControl,
    acceptor: Option<TlsAcceptor>,
    stats: BridgeStats,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: OnceLock<SocketAddr>,
}

impl InboundBridge {
    /// Build the bridge and its TLS context. Nothing is bound until [`start`](Self::start).
    ///
    /// A handshake policy runs inside the synchronous upgrade callback and
    /// blocks its worker, so it needs the registry's runtime to be
    /// multi-threaded; any other flavor is a configuration error.
    pub fn new(
        entity: Arc<ConnectionEntity>,
        registry: Arc<ConnectionRegistry>,
        pipeline: Arc<dyn PolicyPipeline>,
    ) -> BridgeResult<Arc<Self>> {
        if entity.inbound.handshake_policy.is_some() && !can_block(registry.runtime()) {
            return Err(BridgeError::Config(format!(
                "bridge {}: a handshake policy needs a multi-thread runtime",
                entity.id
            )));
        }
        let acceptor = match &entity.inbound.tls {
            Some(settings) => Some(TlsAcceptor::from(crate::tls::server_config(settings)?)),
            None => None,
        };
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            ids: SocketIdGenerator::new(entity.id.clone()),
            admission: AdmissionControl::new(entity.max_connections),
            entity,
            registry,
            pipeline,
            sockets: SocketTable::new(),
            index: ClientIndex::new(),
            acceptor,
            stats: BridgeStats::default(),
            shutdown,
            accept_task: Mutex::new(None),
            local_addr: OnceLock::new(),
        }))
    }

    pub fn entity(&self) -> &ConnectionEntity {
        &self.entity
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    pub fn admission(&self) -> &AdmissionControl {
        &self.admission
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// Whether `socket_id` is registered and not closing.
    pub fn is_open(&self, socket_id: &str) -> bool {
        self.sockets
            .get(socket_id)
            .is_some_and(|h| !h.is_closing())
    }

    /// Bind the listener and start accepting. Port 0 binds an ephemeral port.
    pub async fn start(self: &Arc<Self>, default_bind: &str) -> BridgeResult<SocketAddr> {
        let bind = self
            .entity
            .inbound
            .bind_addr
            .as_deref()
            .unwrap_or(default_bind);
        let listener = TcpListener::bind((bind, self.entity.inbound.port))
            .await
            .map_err(|e| {
                BridgeError::Transport(format!(
                    "bind {bind}:{} failed: {e}",
                    self.entity.inbound.port
                ))
            })?;
        let local = listener.local_addr()?;
        let _ = self.local_addr.set(local);

        let this = self.clone();
        let shutdown = self.shutdown.subscribe();
        let task = self
            .registry
            .runtime()
            .spawn(async move { this.accept_loop(listener, shutdown).await });
        if let Ok(mut slot) = self.accept_task.lock() {
            *slot = Some(task);
        }

        info!(
            bridge = %self.entity.id,
            name = %self.entity.display_name(),
            addr = %local,
            tls = self.acceptor.is_some(),
            loopback = self.entity.loopback,
            "inbound bridge listening"
        );
        Ok(local)
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!(bridge = %self.entity.id, "accept loop cancelled");
                    break;
                }
                result = listener.accept() => match result {
                    Ok((stream, remote)) => {
                        debug!(
                            bridge = %self.entity.id,
                            remote = %remote,
                            "tcp connection accepted"
                        );
                        let this = self.clone();
                        self.registry
                            .runtime()
                            .spawn(async move { this.handle_connection(stream, remote).await });
                    }
                    Err(e) => warn!(bridge = %self.entity.id, error = %e, "accept failed"),
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        match &self.acceptor {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls) => self.upgrade(tls, remote).await,
                Err(e) => debug!(
                    bridge = %self.entity.id,
                    remote = %remote,
                    error = %e,
                    "TLS handshake failed"
                ),
            },
            None => self.upgrade(stream, remote).await,
        }
    }

    async fn upgrade<S>(self: &Arc<Self>, stream: S, remote: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let slot: Arc<Mutex<Option<Accepted>>> = Arc::new(Mutex::new(None));
        let callback = {
            let this = self.clone();
            let slot = slot.clone();
            move |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
                let (response, accepted) = this.on_upgrade_request(req, response, remote)?;
                if let Ok(mut slot) = slot.lock() {
                    *slot = Some(accepted);
                }
                Ok(response)
            }
        };

        let config = ws_config(self.entity.max_message_size);
        let upgrade =
            tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(config));
        let ws = match upgrade.await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(
                    bridge = %self.entity.id,
                    remote = %remote,
                    error = %e,
                    "upgrade not completed"
                );
                return;
            }
        };

        let accepted = slot.lock().ok().and_then(|mut s| s.take());
        if let Some(accepted) = accepted {
            self.run_socket(ws, accepted).await;
        }
    }

    /// Runs inside the upgrade callback, before the 101 response is written.
    fn on_upgrade_request(
        &self,
        req: &Request,
        mut response: Response,
        remote: SocketAddr,
    ) -> Result<(Response, Accepted), ErrorResponse> {
        if self.admission.is_full() {
            BridgeStats::bump(&self.stats.refused);
            info!(
                bridge = %self.entity.id,
                remote = %remote,
                "connection limit reached, upgrade refused"
            );
            return Err(refusal(StatusCode::SERVICE_UNAVAILABLE, None, "connection limit reached"));
        }

        let subprotocol = req
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').map(str::trim).find(|p| !p.is_empty()))
            .map(str::to_string);
        let socket_id = self.ids.next_id(subprotocol.as_deref());
        let origin = Some(remote.to_string());

        let mut request = RequestContext::new(
            self.entity.id.clone(),
            Some(remote),
            req.uri().path(),
            req.uri().query().unwrap_or(""),
            collect_headers(req),
        );
        request.bind_socket(&socket_id, subprotocol.as_deref());

        let bearer = request
            .header("authorization")
            .and_then(bearer_token)
            .or_else(|| query_param(&request.query, "access_token").filter(|t| !t.is_empty()))
            .map(str::to_string);
        let mut auth = AuthContext {
            bearer_token: bearer,
            authenticated_user: None,
        };

        let decision = match self.entity.inbound.handshake_policy.as_deref() {
            None => HandshakeDecision::Proceed {
                client_id: auth.bearer_token.clone(),
            },
            // The policy may block on I/O; run it on this connection's worker.
            Some(service) => match Handle::try_current() {
                Ok(runtime) if can_block(&runtime) => tokio::task::block_in_place(|| {
                    runtime.block_on(self.authorize(
                        service,
                        &socket_id,
                        origin.clone(),
                        subprotocol.clone(),
                        &mut request,
                        &mut auth,
                    ))
                }),
                _ => HandshakeDecision::Refuse("handshake policy cannot run here".into()),
            },
        };

        let client_id = match decision {
            HandshakeDecision::Proceed { client_id } => client_id,
            HandshakeDecision::Challenge(challenge) => {
                info!(
                    bridge = %self.entity.id,
                    socket_id = %socket_id,
                    "handshake needs authentication"
                );
                return Err(refusal(
                    StatusCode::UNAUTHORIZED,
                    challenge.as_deref(),
                    "authentication required",
                ));
            }
            HandshakeDecision::Refuse(reason) => {
                warn!(
                    bridge = %self.entity.id,
                    socket_id = %socket_id,
                    reason = %reason,
                    "handshake refused"
                );
                return Err(refusal(StatusCode::INTERNAL_SERVER_ERROR, None, &reason));
            }
        };

        if let Some(cid) = &client_id {
            request.set_var("client.id", cid.clone());
        }
        if let Some(sp) = &subprotocol {
            if let Ok(value) = HeaderValue::from_str(sp) {
                response
                    .headers_mut()
                    .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
            }
        }

        Ok((
            response,
            Accepted {
                socket_id,
                client_id,
                subprotocol,
                origin,
                request,
                auth,
            },
        ))
    }

    async fn authorize(
        &self,
        service: &str,
        socket_id: &str,
        origin: Option<String>,
        subprotocol: Option<String>,
        request: &mut RequestContext,
        auth: &mut AuthContext,
    ) -> HandshakeDecision {
        let envelope = MessageEnvelope::handshake(socket_id)
            .with_origin(origin)
            .with_subprotocol(subprotocol);
        let outcome = self.pipeline.process(service, envelope, request, auth).await;
        match outcome.disposition {
            Disposition::Success => HandshakeDecision::Proceed {
                client_id: outcome
                    .envelope
                    .client_id
                    .or_else(|| auth.authenticated_user.clone())
                    .or_else(|| auth.bearer_token.clone()),
            },
            Disposition::AuthRequired { challenge } => HandshakeDecision::Challenge(challenge),
            Disposition::AuthFailed(reason) | Disposition::Failed(reason) => {
                HandshakeDecision::Refuse(reason)
            }
        }
    }

    async fn run_socket<S>(self: &Arc<Self>, mut ws: WebSocketStream<S>, accepted: Accepted)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(guard) = self.admission.try_acquire() else {
            BridgeStats::bump(&self.stats.refused);
            warn!(
                bridge = %self.entity.id,
                socket_id = %accepted.socket_id,
                "connection limit reached after upgrade"
            );
            let _ = ws
                .send(close_message(CLOSE_TRY_AGAIN, "connection limit reached"))
                .await;
            return;
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Arc::new(SocketHandle::new(
            accepted.socket_id,
            accepted.client_id,
            accepted.subprotocol,
            tx,
            Some(guard),
        ));
        self.sockets.insert(handle.clone());
        if let Some(cid) = handle.client_id() {
            self.index.add(cid, handle.id());
        }
        BridgeStats::bump(&self.stats.opened);
        info!(
            bridge = %self.entity.id,
            socket_id = %handle.id(),
            client_id = handle.client_id().unwrap_or("-"),
            origin = accepted.origin.as_deref().unwrap_or("-"),
            "inbound socket open"
        );

        let mut session = SocketSession {
            handle: handle.clone(),
            request: accepted.request,
            auth: accepted.auth,
            origin: accepted.origin,
        };
        let cause = drive(
            &mut ws,
            &mut rx,
            &mut session,
            self.as_ref(),
            self.entity.idle_timeout(),
        )
        .await;
        self.teardown(&handle, cause.code, &cause.reason);
        handle.mark_closed();
    }

    fn detach(&self, handle: &Arc<SocketHandle>) {
        self.sockets.remove(handle);
        if let Some(cid) = handle.client_id() {
            self.index.remove(cid, handle.id());
        }
        handle.release_slot();
        BridgeStats::bump(&self.stats.closed);
    }

    /// Local close path: unregister the socket and tell the outbound side.
    /// Only the first caller for a socket does anything.
    pub fn teardown(&self, handle: &Arc<SocketHandle>, code: u16, reason: &str) {
        if !handle.begin_close() {
            return;
        }
        self.detach(handle);
        info!(
            bridge = %self.entity.id,
            socket_id = %handle.id(),
            code,
            reason = %reason,
            "inbound socket closed"
        );
        handle.request_close(code, reason);
        if self.entity.loopback {
            return;
        }
        if let Ok(outbound) = self.registry.outbound(&self.entity.id) {
            outbound.close_peer(handle.id(), code, reason);
        }
    }

    pub fn socket(&self, socket_id: &str) -> Option<Arc<SocketHandle>> {
        self.sockets.get(socket_id)
    }

    /// Stop accepting, then close every live socket with 1001.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let task = self.accept_task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            let _ = task.await;
        }
        for handle in self.sockets.snapshot() {
            if handle.begin_close() {
                self.detach(&handle);
                handle.request_close(CLOSE_GOING_AWAY, "going away");
            }
        }
        info!(bridge = %self.entity.id, "inbound bridge stopped");
    }
}

impl FrameHandler for InboundBridge {
    fn on_frame<'a>(
        &'a self,
        session: &'a mut SocketSession,
        frame: Frame,
    ) -> BoxFuture<'a, FrameVerdict> {
        Box::pin(async move {
            debug!(socket_id = %session.handle.id(), bytes = frame.len(), "inbound frame");
            let service = self.entity.inbound.message_policy.as_deref();
            let frame = match process_frame(self.pipeline.as_ref(), service, session, frame).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return FrameVerdict::Continue,
                Err(reason) => {
                    warn!(
                        socket_id = %session.handle.id(),
                        reason = %reason,
                        "message rejected by policy"
                    );
                    return FrameVerdict::Close {
                        code: CLOSE_SERVER_ERROR,
                        reason,
                    };
                }
            };

            let result = if self.entity.loopback {
                session.handle.deliver(frame)
            } else {
                match self.registry.outbound(&self.entity.id) {
                    Ok(outbound) => outbound.forward(session, frame).await,
                    Err(e) => Err(e),
                }
            };
            match result {
                Ok(()) => FrameVerdict::Continue,
                Err(e) => {
                    warn!(socket_id = %session.handle.id(), error = %e, "forwarding failed");
                    FrameVerdict::Close {
                        code: CLOSE_SERVER_ERROR,
                        reason: e.to_string(),
                    }
                }
            }
        })
    }
}

impl Bridge for InboundBridge {
    fn id(&self) -> &str {
        &self.entity.id
    }

    fn direction(&self) -> Direction {
        Direction::Inbound
    }

    fn resolve_socket_ids(&self, id: &str, subprotocol: Option<&str>) -> Vec<String> {
        resolve_ids(&self.entity.id, &self.index, id, subprotocol)
    }

    fn send(&self, socket_id: &str, frame: Frame) -> BridgeResult<()> {
        self.sockets
            .get(socket_id)
            .ok_or_else(|| BridgeError::NotAvailable(socket_id.to_string()))?
            .deliver(frame)
    }

    fn broadcast(&self, frame: &Frame) -> BroadcastReport {
        broadcast_to(&self.sockets, frame)
    }

    fn close_peer(&self, socket_id: &str, code: u16, reason: &str) {
        let Some(handle) = self.sockets.get(socket_id) else {
            debug!(socket_id = %socket_id, "peer close for unknown inbound socket");
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
            "inbound socket closed by peer"
        );
        handle.request_close(code, reason);
    }
}

/// Lowercased header map; repeated headers are joined with `", "`.
/// Whether `block_in_place` is allowed on `runtime`.
fn can_block(runtime: &Handle) -> bool {
    runtime.runtime_flavor() == RuntimeFlavor::MultiThread
}

fn collect_headers(req: &Request) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    for (name, value) in req.headers() {
        let Ok(value) = value.to_str() else { continue };
        headers
            .entry(name.as_str().to_string())
            .and_modify(|v: &mut String| {
                v.push_str(", ");
                v.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    headers
}

fn refusal(status: StatusCode, challenge: Option<&str>, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    if let Some(challenge) = challenge.and_then(|c| HeaderValue::from_str(c).ok()) {
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, challenge);
    }
    response
}
