//! Connection entities: the configuration of one logical bridge.
//!
//! Entities are immutable once loaded; a change is applied by stopping the
//! bridge pair and starting a new one from the new entity.

use crate::error::{BridgeError, BridgeResult};
use serde::Deserialize;
use std::time::Duration;

/// TLS client-certificate mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAuth {
    #[default]
    None,
    Optional,
    Required,
}

/// Server-side TLS for the inbound listener.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InboundTls {
    /// PEM chain; when both paths are absent a self-signed certificate is used.
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    #[serde(default)]
    pub client_auth: ClientAuth,
    /// PEM bundle of CAs trusted for client certificates.
    pub client_ca_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InboundSettings {
    /// Zero binds an OS-assigned port.
    pub port: u16,
    pub bind_addr: Option<String>,
    pub tls: Option<InboundTls>,
    /// Service id run against every upgrade request.
    pub handshake_policy: Option<String>,
    /// Service id run against every client frame.
    pub message_policy: Option<String>,
}

/// Client-side TLS for outbound dials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OutboundTls {
    #[serde(default)]
    pub enabled: bool,
    /// Client certificate presented to the backend.
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    /// Extra trust anchors added on top of the default roots.
    pub ca_path: Option<String>,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OutboundSettings {
    #[serde(default)]
    pub url_template: String,
    #[serde(default)]
    pub tls: OutboundTls,
    /// Service id run against every backend frame.
    pub message_policy: Option<String>,
    /// Overrides the server-wide dial timeout.
    pub dial_timeout_secs: Option<u64>,
}

/// One logical bridge: an inbound listener paired with an outbound endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectionEntity {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Never dial outbound; echo every processed frame back to the client.
    #[serde(default)]
    pub loopback: bool,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Zero disables the idle timeout.
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    pub inbound: InboundSettings,
    #[serde(default)]
    pub outbound: OutboundSettings,
}

fn default_true() -> bool {
    true
}
fn default_max_connections() -> usize {
    1000
}
fn default_max_idle_secs() -> u64 {
    300
}
fn default_max_message_size() -> usize {
    1_048_576
}

impl ConnectionEntity {
    /// Check the invariants a bridge relies on before it is started.
    pub fn validate(&self) -> BridgeResult<()> {
        if self.id.is_empty() {
            return Err(BridgeError::Config("connection id must not be empty".into()));
        }
        if self.id.contains(':') {
            return Err(BridgeError::Config(format!(
                "connection id {:?} must not contain ':'",
                self.id
            )));
        }
        if self.max_connections == 0 {
            return Err(BridgeError::Config(format!(
                "connection {}: max_connections must be at least 1",
                self.id
            )));
        }
        if !self.loopback && self.outbound.url_template.trim().is_empty() {
            return Err(BridgeError::Config(format!(
                "connection {}: outbound url_template is required unless loopback is set",
                self.id
            )));
        }
        if let Some(tls) = &self.inbound.tls {
            if tls.client_auth != ClientAuth::None && tls.client_ca_path.is_none() {
                return Err(BridgeError::Config(format!(
                    "connection {}: client_auth requires client_ca_path",
                    self.id
                )));
            }
            if tls.cert_path.is_some() != tls.key_path.is_some() {
                return Err(BridgeError::Config(format!(
                    "connection {}: inbound tls needs both cert_path and key_path",
                    self.id
                )));
            }
        }
        if self.outbound.tls.cert_path.is_some() != self.outbound.tls.key_path.is_some() {
            return Err(BridgeError::Config(format!(
                "connection {}: outbound client certificate needs both cert_path and key_path",
                self.id
            )));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.max_idle_secs > 0).then(|| Duration::from_secs(self.max_idle_secs))
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[cfg(test)]
pub(crate) fn sample(id: &str, port: u16) -> ConnectionEntity {
    ConnectionEntity {
        id: id.to_string(),
        name: String::new(),
        enabled: true,
        loopback: false,
        max_connections: default_max_connections(),
        max_idle_secs: default_max_idle_secs(),
        max_message_size: default_max_message_size(),
        inbound: InboundSettings {
            port,
            bind_addr: None,
            tls: None,
            handshake_policy: None,
            message_policy: None,
        },
        outbound: OutboundSettings {
            url_template: "ws://127.0.0.1:9/${request.path}".into(),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_is_valid() {
        assert!(sample("gw", 8080).validate().is_ok());
    }

    #[test]
    fn rejects_colon_in_id() {
        assert!(sample("a:b", 8080).validate().is_err());
    }

    #[test]
    fn template_required_unless_loopback() {
        let mut e = sample("gw", 8080);
        e.outbound.url_template.clear();
        assert!(e.validate().is_err());
        e.loopback = true;
        assert!(e.validate().is_ok());
    }

    #[test]
    fn client_auth_needs_ca() {
        let mut e = sample("gw", 8443);
        e.inbound.tls = Some(InboundTls {
            client_auth: ClientAuth::Required,
            ..Default::default()
        });
        assert!(e.validate().is_err());
        if let Some(tls) = e.inbound.tls.as_mut() {
            tls.client_ca_path = Some("/etc/ca.pem".into());
        }
        assert!(e.validate().is_ok());
    }

    #[test]
    fn zero_idle_disables_timeout() {
        let mut e = sample("gw", 8080);
        e.max_idle_secs = 0;
        assert!(e.idle_timeout().is_none());
    }
}
