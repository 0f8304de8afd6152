//! Boundary to the policy / message-processing pipeline.
//!
//! The pipeline is opaque to the bridges: they hand it an envelope plus the
//! request and auth contexts of the socket and act on the returned
//! [`Disposition`]. Implementations may block on external I/O, so the trait
//! returns a boxed future that the calling socket's own task awaits.

use crate::codec;
use crate::envelope::MessageEnvelope;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome category of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Success,
    /// Credentials missing; carries the challenge to put in `WWW-Authenticate`.
    AuthRequired { challenge: Option<String> },
    AuthFailed(String),
    Failed(String),
}

impl Disposition {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Human-readable reason used in close frames and logs.
    pub fn reason(&self) -> &str {
        match self {
            Self::Success => "ok",
            Self::AuthRequired { .. } => "authentication required",
            Self::AuthFailed(r) | Self::Failed(r) => r,
        }
    }
}

/// Request-scoped state captured at handshake time.
///
/// `variables` feeds outbound URL templates; the handshake policy may add to it.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub bridge_id: String,
    pub remote_addr: Option<SocketAddr>,
    pub path: String,
    /// Raw query string without the leading `?`.
    pub query: String,
    /// Header names are lowercased; repeated headers are joined with `", "`.
    pub headers: BTreeMap<String, String>,
    pub variables: HashMap<String, String>,
}

impl RequestContext {
    pub fn new(
        bridge_id: impl Into<String>,
        remote_addr: Option<SocketAddr>,
        path: impl Into<String>,
        query: impl Into<String>,
        headers: BTreeMap<String, String>,
    ) -> Self {
        let mut ctx = Self {
            bridge_id: bridge_id.into(),
            remote_addr,
            path: path.into(),
            query: query.into(),
            headers,
            variables: HashMap::new(),
        };
        ctx.seed_variables();
        ctx
    }

    fn seed_variables(&mut self) {
        let mut vars = HashMap::new();
        vars.insert("bridge.id".to_string(), self.bridge_id.clone());
        vars.insert("request.path".to_string(), self.path.clone());
        vars.insert("request.query".to_string(), self.query.clone());
        if let Some(addr) = self.remote_addr {
            vars.insert("request.remote_addr".to_string(), addr.to_string());
        }
        for pair in self.query.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            vars.insert(format!("request.query.{k}"), v.to_string());
        }
        for (name, value) in &self.headers {
            vars.insert(format!("request.header.{name}"), value.clone());
        }
        self.variables.extend(vars);
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }

    /// Record the socket this context belongs to.
    pub fn bind_socket(&mut self, socket_id: &str, subprotocol: Option<&str>) {
        self.set_var("socket.id", socket_id);
        self.set_var("socket.subprotocol", subprotocol.unwrap_or(""));
    }
}

/// Credentials and identity established for a socket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    pub bearer_token: Option<String>,
    /// Identity asserted by the handshake policy, if any.
    pub authenticated_user: Option<String>,
}

/// Result of one pipeline run.
#[derive(Debug, Clone)]
pub struct PolicyOutcome {
    pub envelope: MessageEnvelope,
    pub disposition: Disposition,
}

impl PolicyOutcome {
    pub fn new(mut envelope: MessageEnvelope, disposition: Disposition) -> Self {
        envelope.status = Some(disposition.clone());
        Self {
            envelope,
            disposition,
        }
    }
}

/// The message-processing pipeline, consumed by both bridges.
pub trait PolicyPipeline: Send + Sync {
    /// Validate and transform `envelope` under the service `service_id`.
    fn process<'a>(
        &'a self,
        service_id: &'a str,
        envelope: MessageEnvelope,
        request: &'a mut RequestContext,
        auth: &'a mut AuthContext,
    ) -> BoxFuture<'a, PolicyOutcome>;
}

/// A policy service that speaks the canonical record form (see [`codec`])
/// instead of in-memory envelopes.
pub trait RecordService: Send + Sync {
    /// Process one canonical JSON record; returns the (possibly rewritten)
    /// record and the disposition.
    fn call<'a>(
        &'a self,
        service_id: &'a str,
        record: String,
        request: &'a mut RequestContext,
        auth: &'a mut AuthContext,
    ) -> BoxFuture<'a, (String, Disposition)>;
}

/// Puts a [`RecordService`] behind the [`PolicyPipeline`] boundary.
///
/// Envelopes are encoded before the call and the reply is decoded back. A
/// reply that does not decode, or that changes the payload type, fails the
/// run and leaves the original envelope in the outcome.
pub struct RecordPipeline<S> {
    service: S,
}

impl<S: RecordService> RecordPipeline<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &S {
        &self.service
    }
}

impl<S: RecordService> PolicyPipeline for RecordPipeline<S> {
    fn process<'a>(
        &'a self,
        service_id: &'a str,
        envelope: MessageEnvelope,
        request: &'a mut RequestContext,
        auth: &'a mut AuthContext,
    ) -> BoxFuture<'a, PolicyOutcome> {
        Box::pin(async move {
            let record = match codec::encode(&envelope) {
                Ok(record) => record,
                Err(e) => return PolicyOutcome::new(envelope, Disposition::Failed(e.to_string())),
            };
            let (reply, disposition) = self.service.call(service_id, record, request, auth).await;
            match codec::decode_expecting(&reply, envelope.kind()) {
                Ok(processed) => PolicyOutcome::new(processed, disposition),
                Err(e) => PolicyOutcome::new(
                    envelope,
                    Disposition::Failed(format!("bad reply from {service_id}: {e}")),
                ),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CanonicalEnvelope;
    use crate::PayloadKind;

    /// Uppercases text records; service `flip` turns them into handshakes.
    struct Shout;

    impl RecordService for Shout {
        fn call<'a>(
            &'a self,
            service_id: &'a str,
            record: String,
            _request: &'a mut RequestContext,
            _auth: &'a mut AuthContext,
        ) -> BoxFuture<'a, (String, Disposition)> {
            Box::pin(async move {
                let mut parsed: CanonicalEnvelope = serde_json::from_str(&record).unwrap();
                parsed.data = parsed.data.to_uppercase();
                parsed.length = parsed.data.len();
                if service_id == "flip" {
                    parsed.kind = PayloadKind::Handshake;
                }
                (serde_json::to_string(&parsed).unwrap(), Disposition::Success)
            })
        }
    }

    #[tokio::test]
    async fn record_service_rewrites_through_codec() {
        let pipeline = RecordPipeline::new(Shout);
        let mut req = RequestContext::default();
        let mut auth = AuthContext::default();
        let env = MessageEnvelope::text("gw:1:", "hi".into()).with_client_id(Some("ann".into()));
        let out = pipeline.process("up", env, &mut req, &mut auth).await;
        assert!(out.disposition.is_success());
        assert_eq!(out.envelope.text_payload().unwrap(), "HI");
        assert_eq!(out.envelope.client_id.as_deref(), Some("ann"));
        assert_eq!(out.envelope.status, Some(Disposition::Success));
    }

    #[tokio::test]
    async fn record_service_cannot_change_payload_type() {
        let pipeline = RecordPipeline::new(Shout);
        let mut req = RequestContext::default();
        let mut auth = AuthContext::default();
        let env = MessageEnvelope::text("gw:1:", "hi".into());
        let out = pipeline.process("flip", env, &mut req, &mut auth).await;
        assert!(matches!(out.disposition, Disposition::Failed(_)));
        assert_eq!(out.envelope.text_payload().unwrap(), "hi");
    }

    #[test]
    fn seeds_template_variables() {
        let mut headers = BTreeMap::new();
        headers.insert("x-tenant".to_string(), "acme".to_string());
        let ctx = RequestContext::new(
            "gw",
            Some("127.0.0.1:4000".parse().unwrap()),
            "/chat",
            "room=7&debug",
            headers,
        );
        assert_eq!(ctx.variables["request.path"], "/chat");
        assert_eq!(ctx.variables["request.query.room"], "7");
        assert_eq!(ctx.variables["request.query.debug"], "");
        assert_eq!(ctx.variables["request.header.x-tenant"], "acme");
        assert_eq!(ctx.variables["request.remote_addr"], "127.0.0.1:4000");
        assert_eq!(ctx.header("X-Tenant"), Some("acme"));
    }

    #[test]
    fn outcome_stamps_status() {
        let out = PolicyOutcome::new(
            MessageEnvelope::text("gw:1:", "x".into()),
            Disposition::Failed("nope".into()),
        );
        assert_eq!(out.envelope.status, Some(Disposition::Failed("nope".into())));
        assert_eq!(out.disposition.reason(), "nope");
    }
}
