//! Built-in rule pipeline.
//!
//! The bridges only see the [`PolicyPipeline`] trait. The binary wires in
//! [`RulePipeline`] from `[[policies]]`, served as a [`RecordService`] behind
//! a [`RecordPipeline`], so the rules read and write the same canonical
//! records an external policy service would. It is split the same way as the
//! rest of the configuration:
//!
//! [`RecordPipeline`]: wsbridge_core::RecordPipeline
//!
//! - [`PolicyRules`] is the plain, deserializable rule set for one service id.
//! - [`RulePipeline`] is the runtime counterpart: rules compiled into lookup
//!   structures, keyed by service id.
//!
//! Handshake envelopes are checked for credentials and may assign a client
//! id; data envelopes are checked for size and content.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use wsbridge_core::identity::query_param;
use wsbridge_core::pipeline::BoxFuture;
use wsbridge_core::{
    codec, template, AuthContext, BridgeError, BridgeResult, Disposition, MessageEnvelope,
    PayloadKind, RecordService, RequestContext,
};

/// Rules for one policy service, as written in the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PolicyRules {
    pub id: String,
    /// Realm for the `Bearer` challenge; when set a handshake without a
    /// token is answered with `AuthRequired`.
    pub require_bearer: Option<String>,
    /// Accepted bearer tokens. Empty accepts any token.
    #[serde(default)]
    pub allowed_tokens: Vec<String>,
    /// `token`, `header:<name>` or `query:<name>`.
    pub client_id_from: Option<String>,
    /// Text frames containing any of these are rejected.
    #[serde(default)]
    pub deny_substrings: Vec<String>,
    pub max_payload_bytes: Option<usize>,
    /// Extra request variables set at handshake time. Values may use
    /// `${name}` placeholders.
    #[serde(default)]
    pub set_variables: BTreeMap<String, String>,
    /// Prepended to every text frame.
    pub text_prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ClientIdSource {
    Token,
    Header(String),
    Query(String),
}

impl ClientIdSource {
    fn parse(raw: &str) -> BridgeResult<Self> {
        match raw.split_once(':') {
            None if raw == "token" => Ok(Self::Token),
            Some(("header", name)) if !name.is_empty() => {
                Ok(Self::Header(name.to_ascii_lowercase()))
            }
            Some(("query", name)) if !name.is_empty() => Ok(Self::Query(name.to_string())),
            _ => Err(BridgeError::Config(format!(
                "client_id_from must be token, header:<name> or query:<name>, got {raw:?}"
            ))),
        }
    }

    fn extract(&self, request: &RequestContext, auth: &AuthContext) -> Option<String> {
        match self {
            Self::Token => auth.bearer_token.clone(),
            Self::Header(name) => request.header(name).map(str::to_string),
            Self::Query(name) => query_param(&request.query, name).map(str::to_string),
        }
        .filter(|id| !id.is_empty())
    }
}

#[derive(Debug)]
struct CompiledRules {
    challenge: Option<String>,
    allowed_tokens: HashSet<String>,
    client_id_from: Option<ClientIdSource>,
    deny_substrings: Vec<String>,
    max_payload_bytes: Option<usize>,
    set_variables: BTreeMap<String, String>,
    text_prefix: Option<String>,
}

/// Runtime rule pipeline over a set of [`PolicyRules`].
#[derive(Debug, Default)]
pub struct RulePipeline {
    services: HashMap<String, CompiledRules>,
}

impl RulePipeline {
    /// Compile the rule sets. Duplicate ids and malformed `client_id_from`
    /// values are configuration errors.
    pub fn new(rules: &[PolicyRules]) -> BridgeResult<Self> {
        let mut services = HashMap::new();
        for r in rules {
            let compiled = CompiledRules {
                challenge: r
                    .require_bearer
                    .as_ref()
                    .map(|realm| format!("Bearer realm=\"{realm}\"")),
                allowed_tokens: r.allowed_tokens.iter().cloned().collect(),
                client_id_from: r
                    .client_id_from
                    .as_deref()
                    .map(ClientIdSource::parse)
                    .transpose()?,
                deny_substrings: r.deny_substrings.clone(),
                max_payload_bytes: r.max_payload_bytes,
                set_variables: r.set_variables.clone(),
                text_prefix: r.text_prefix.clone(),
            };
            if services.insert(r.id.clone(), compiled).is_some() {
                return Err(BridgeError::Config(format!("duplicate policy id {:?}", r.id)));
            }
        }
        Ok(Self { services })
    }

    pub fn has_service(&self, id: &str) -> bool {
        self.services.contains_key(id)
    }

    fn handshake(
        rules: &CompiledRules,
        envelope: &mut MessageEnvelope,
        request: &mut RequestContext,
        auth: &mut AuthContext,
    ) -> Disposition {
        match (&rules.challenge, &auth.bearer_token) {
            (Some(challenge), None) => {
                return Disposition::AuthRequired {
                    challenge: Some(challenge.clone()),
                }
            }
            (_, Some(token))
                if !rules.allowed_tokens.is_empty() && !rules.allowed_tokens.contains(token) =>
            {
                return Disposition::AuthFailed("bearer token not accepted".into())
            }
            _ => {}
        }

        if let Some(source) = &rules.client_id_from {
            if let Some(client_id) = source.extract(request, auth) {
                auth.authenticated_user = Some(client_id.clone());
                envelope.client_id = Some(client_id);
            }
        }

        for (name, value) in &rules.set_variables {
            match template::resolve(value, &request.variables) {
                Ok(resolved) => request.set_var(name.clone(), resolved),
                Err(e) => return Disposition::Failed(e.to_string()),
            }
        }
        Disposition::Success
    }

    fn message(rules: &CompiledRules, envelope: &mut MessageEnvelope) -> Disposition {
        if let Some(max) = rules.max_payload_bytes {
            if envelope.length() > max {
                return Disposition::Failed(format!(
                    "payload of {} bytes exceeds {max}",
                    envelope.length()
                ));
            }
        }
        if envelope.kind() != PayloadKind::Text {
            return Disposition::Success;
        }
        let Ok(text) = envelope.text_payload() else {
            return Disposition::Failed("text envelope without text payload".into());
        };
        if rules.deny_substrings.iter().any(|s| text.contains(s.as_str())) {
            return Disposition::Failed("message denied".into());
        }
        if let Some(prefix) = &rules.text_prefix {
            let rewritten = format!("{prefix}{text}");
            envelope.set_text(rewritten);
        }
        Disposition::Success
    }
}

impl RecordService for RulePipeline {
    fn call<'a>(
        &'a self,
        service_id: &'a str,
        record: String,
        request: &'a mut RequestContext,
        auth: &'a mut AuthContext,
    ) -> BoxFuture<'a, (String, Disposition)> {
        Box::pin(async move {
            let Some(rules) = self.services.get(service_id) else {
                let reason = format!("unknown policy service {service_id:?}");
                return (record, Disposition::Failed(reason));
            };
            let mut envelope = match codec::decode(&record) {
                Ok(envelope) => envelope,
                Err(e) => return (record, Disposition::Failed(format!("malformed record: {e}"))),
            };
            let disposition = match envelope.kind() {
                PayloadKind::Handshake => Self::handshake(rules, &mut envelope, request, auth),
                PayloadKind::Text | PayloadKind::Binary => Self::message(rules, &mut envelope),
            };
            match codec::encode(&envelope) {
                Ok(reply) => (reply, disposition),
                Err(e) => (record, Disposition::Failed(e.to_string())),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wsbridge_core::{PolicyPipeline, RecordPipeline};

    fn request(headers: &[(&str, &str)], query: &str) -> RequestContext {
        let headers = headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RequestContext::new("gw", None, "/chat", query, headers)
    }

    fn pipeline(rules: PolicyRules) -> RecordPipeline<RulePipeline> {
        RecordPipeline::new(RulePipeline::new(&[rules]).unwrap())
    }

    #[tokio::test]
    async fn missing_token_gets_challenge() {
        let p = pipeline(PolicyRules {
            id: "auth".into(),
            require_bearer: Some("gw".into()),
            ..Default::default()
        });
        let mut req = request(&[], "");
        let mut auth = AuthContext::default();
        let out = p
            .process("auth", MessageEnvelope::handshake("gw:1:"), &mut req, &mut auth)
            .await;
        assert_eq!(
            out.disposition,
            Disposition::AuthRequired {
                challenge: Some("Bearer realm=\"gw\"".into())
            }
        );
    }

    #[tokio::test]
    async fn unknown_token_fails_auth() {
        let p = pipeline(PolicyRules {
            id: "auth".into(),
            require_bearer: Some("gw".into()),
            allowed_tokens: vec!["good".into()],
            ..Default::default()
        });
        let mut req = request(&[], "");
        let mut auth = AuthContext {
            bearer_token: Some("bad".into()),
            ..Default::default()
        };
        let out = p
            .process("auth", MessageEnvelope::handshake("gw:1:"), &mut req, &mut auth)
            .await;
        assert!(matches!(out.disposition, Disposition::AuthFailed(_)));
    }

    #[tokio::test]
    async fn assigns_client_id_and_variables() {
        let p = pipeline(PolicyRules {
            id: "auth".into(),
            client_id_from: Some("header:X-User".into()),
            set_variables: [(
                "backend.path".to_string(),
                "users/${request.header.x-user}".to_string(),
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        });
        let mut req = request(&[("x-user", "alice")], "");
        let mut auth = AuthContext::default();
        let out = p
            .process("auth", MessageEnvelope::handshake("gw:1:"), &mut req, &mut auth)
            .await;
        assert!(out.disposition.is_success());
        assert_eq!(out.envelope.client_id.as_deref(), Some("alice"));
        assert_eq!(auth.authenticated_user.as_deref(), Some("alice"));
        assert_eq!(req.variables["backend.path"], "users/alice");
    }

    #[tokio::test]
    async fn message_rules() {
        let p = pipeline(PolicyRules {
            id: "msg".into(),
            deny_substrings: vec!["DROP TABLE".into()],
            max_payload_bytes: Some(8),
            text_prefix: Some(">".into()),
            ..Default::default()
        });
        let mut req = request(&[], "");
        let mut auth = AuthContext::default();

        let out = p
            .process("msg", MessageEnvelope::text("gw:1:", "hi".into()), &mut req, &mut auth)
            .await;
        assert!(out.disposition.is_success());
        assert_eq!(out.envelope.text_payload().unwrap(), ">hi");

        let out = p
            .process(
                "msg",
                MessageEnvelope::text("gw:1:", "DROP TABLE".into()),
                &mut req,
                &mut auth,
            )
            .await;
        assert!(!out.disposition.is_success());

        let out = p
            .process("msg", MessageEnvelope::binary("gw:1:", vec![0; 9]), &mut req, &mut auth)
            .await;
        assert!(matches!(out.disposition, Disposition::Failed(_)));
    }

    #[tokio::test]
    async fn unknown_service_fails() {
        let p = RecordPipeline::new(RulePipeline::default());
        let mut req = request(&[], "");
        let mut auth = AuthContext::default();
        let out = p
            .process("nope", MessageEnvelope::handshake("gw:1:"), &mut req, &mut auth)
            .await;
        assert!(matches!(out.disposition, Disposition::Failed(_)));
        assert_eq!(out.envelope.status, Some(out.disposition.clone()));
    }

    #[tokio::test]
    async fn binary_window_survives_the_record_boundary() {
        let p = pipeline(PolicyRules {
            id: "msg".into(),
            max_payload_bytes: Some(8),
            ..Default::default()
        });
        let mut req = request(&[], "");
        let mut auth = AuthContext::default();
        let env = MessageEnvelope::binary_window("gw:1:", vec![9, 0, 0xff, 0x10, 9], 1, 3).unwrap();
        let out = p.process("msg", env, &mut req, &mut auth).await;
        assert!(out.disposition.is_success());
        assert_eq!(out.envelope.binary_payload().unwrap(), &[0, 0xff, 0x10]);
        assert_eq!((out.envelope.offset(), out.envelope.length()), (1, 3));
    }

    #[tokio::test]
    async fn malformed_record_fails() {
        let rules = RulePipeline::new(&[PolicyRules {
            id: "msg".into(),
            ..Default::default()
        }])
        .unwrap();
        let mut req = request(&[], "");
        let mut auth = AuthContext::default();
        let (reply, disposition) = rules
            .call("msg", "{not json".into(), &mut req, &mut auth)
            .await;
        assert_eq!(reply, "{not json");
        assert!(matches!(disposition, Disposition::Failed(r) if r.starts_with("malformed record")));
    }

    #[test]
    fn rejects_bad_rule_sets() {
        let dup = PolicyRules {
            id: "a".into(),
            ..Default::default()
        };
        assert!(RulePipeline::new(&[dup.clone(), dup]).is_err());
        let bad = PolicyRules {
            id: "b".into(),
            client_id_from: Some("cookie:sid".into()),
            ..Default::default()
        };
        assert!(RulePipeline::new(&[bad]).is_err());
    }
}
