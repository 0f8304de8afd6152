//! Shared fixtures for the server tests.

use crate::inbound::InboundBridge;
use crate::outbound::OutboundBridge;
use crate::registry::ConnectionRegistry;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use wsbridge_core::entity::{InboundSettings, OutboundSettings};
use wsbridge_core::pipeline::BoxFuture;
use wsbridge_core::{
    AuthContext, ConnectionEntity, Disposition, MessageEnvelope, PayloadKind, PolicyOutcome,
    PolicyPipeline, RequestContext,
};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn registry() -> Arc<ConnectionRegistry> {
    Arc::new(ConnectionRegistry::new(Handle::current(), Duration::from_secs(2)).unwrap())
}

pub fn entity(id: &str, url_template: &str) -> ConnectionEntity {
    ConnectionEntity {
        id: id.to_string(),
        name: String::new(),
        enabled: true,
        loopback: false,
        max_connections: 100,
        max_idle_secs: 0,
        max_message_size: 64 * 1024,
        inbound: InboundSettings {
            port: 0,
            bind_addr: Some("127.0.0.1".into()),
            tls: None,
            handshake_policy: None,
            message_policy: None,
        },
        outbound: OutboundSettings {
            url_template: url_template.to_string(),
            ..Default::default()
        },
    }
}

pub fn loopback(id: &str) -> ConnectionEntity {
    let mut e = entity(id, "");
    e.loopback = true;
    e
}

/// Pipeline that accepts everything unchanged.
pub fn pass() -> Arc<dyn PolicyPipeline> {
    Arc::new(Recorder::default())
}

/// Pipeline test double: records every data payload it sees, in order.
///
/// Service `deny` fails every message, service `auth` answers handshakes
/// without a bearer token with `AuthRequired` and assigns the token as
/// client id otherwise, and text frames equal to `"reject"` fail under any
/// service.
#[derive(Default)]
pub struct Recorder {
    pub seen: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl PolicyPipeline for Recorder {
    fn process<'a>(
        &'a self,
        service_id: &'a str,
        mut envelope: MessageEnvelope,
        _request: &'a mut RequestContext,
        auth: &'a mut AuthContext,
    ) -> BoxFuture<'a, PolicyOutcome> {
        Box::pin(async move {
            if envelope.kind() == PayloadKind::Handshake {
                let disposition = match (service_id, &auth.bearer_token) {
                    ("auth", None) => Disposition::AuthRequired {
                        challenge: Some("Bearer realm=\"test\"".into()),
                    },
                    ("deny", _) => Disposition::Failed("denied".into()),
                    (_, token) => {
                        envelope.client_id = token.clone();
                        Disposition::Success
                    }
                };
                return PolicyOutcome::new(envelope, disposition);
            }
            let text = envelope
                .text_payload()
                .map(str::to_string)
                .unwrap_or_else(|_| "<binary>".into());
            self.seen.lock().unwrap().push(text.clone());
            let disposition = if service_id == "deny" || text == "reject" {
                Disposition::Failed("rejected".into())
            } else {
                Disposition::Success
            };
            PolicyOutcome::new(envelope, disposition)
        })
    }
}

/// Start a loopback-free bridge pair for `entity` on `registry`.
pub async fn start_pair(
    registry: &Arc<ConnectionRegistry>,
    entity: ConnectionEntity,
    pipeline: Arc<dyn PolicyPipeline>,
) -> (Arc<InboundBridge>, Option<Arc<OutboundBridge>>, SocketAddr) {
    let entity = Arc::new(entity);
    let inbound = InboundBridge::new(entity.clone(), registry.clone(), pipeline.clone()).unwrap();
    let outbound = (!entity.loopback).then(|| {
        let outbound = OutboundBridge::new(entity.clone(), registry.clone(), pipeline);
        registry.register_outbound(outbound.clone()).unwrap();
        outbound
    });
    registry.register_inbound(inbound.clone());
    let addr = inbound.start("127.0.0.1").await.unwrap();
    (inbound, outbound, addr)
}

/// In-process backend: echoes every frame prefixed with `"backend:"` and
/// reports the request path of each accepted socket.
pub async fn echo_backend() -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let paths = Arc::new(Mutex::new(Vec::new()));
    let recorded = paths.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let paths = recorded.clone();
            tokio::spawn(async move {
                let callback = record_path(paths);
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    let reply = match msg {
                        Message::Text(t) => Message::Text(format!("backend:{t}")),
                        Message::Binary(b) => Message::Binary(b),
                        Message::Close(_) => break,
                        _ => continue,
                    };
                    if ws.send(reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    (addr, paths)
}

fn record_path(
    paths: Arc<Mutex<Vec<String>>>,
) -> impl FnOnce(&Request, Response) -> Result<Response, ErrorResponse> {
    move |req, resp| {
        paths.lock().unwrap().push(req.uri().path().to_string());
        Ok(resp)
    }
}

pub async fn connect(addr: SocketAddr, path: &str) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}{path}"))
        .await
        .unwrap();
    ws
}

/// Next text frame, failing the test after two seconds.
pub async fn next_text(ws: &mut Client) -> String {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("read failed");
        match msg {
            Message::Text(t) => return t,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

/// Wait for the close frame and return its code.
pub async fn close_code(ws: &mut Client) -> Option<u16> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for close");
        match msg {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
