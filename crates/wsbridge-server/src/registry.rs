//! Connection registry: directory of live bridges plus their shared resources.
//!
//! Bridges are keyed by connection-entity id. Outbound TLS contexts are
//! provisioned once when an outbound bridge registers and dropped when it
//! deregisters; every dial reuses them.

use crate::bridge::{Bridge, Direction};
use crate::inbound::InboundBridge;
use crate::outbound::OutboundBridge;
use crate::tls;
use dashmap::DashMap;
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info};
use wsbridge_core::{BridgeError, BridgeResult};

pub struct ConnectionRegistry {
    inbound: DashMap<String, Arc<InboundBridge>>,
    outbound: DashMap<String, Arc<OutboundBridge>>,
    /// Shared outbound context for entities without outbound TLS settings.
    default_client_tls: Arc<ClientConfig>,
    /// Dedicated outbound contexts, by entity id.
    client_tls: DashMap<String, Arc<ClientConfig>>,
    runtime: Handle,
    dial_timeout: Duration,
}

impl ConnectionRegistry {
    /// Build a registry whose socket tasks run on `runtime`.
    pub fn new(runtime: Handle, dial_timeout: Duration) -> BridgeResult<Self> {
        Ok(Self {
            inbound: DashMap::new(),
            outbound: DashMap::new(),
            default_client_tls: tls::default_client_config()?,
            client_tls: DashMap::new(),
            runtime,
            dial_timeout,
        })
    }

    pub fn register_inbound(&self, bridge: Arc<InboundBridge>) {
        info!(bridge = %bridge.id(), "inbound bridge registered");
        self.inbound.insert(bridge.id().to_string(), bridge);
    }

    /// Register an outbound bridge, provisioning its TLS context first.
    pub fn register_outbound(&self, bridge: Arc<OutboundBridge>) -> BridgeResult<()> {
        let id = bridge.id().to_string();
        let settings = &bridge.entity().outbound.tls;
        if settings.enabled {
            self.client_tls
                .insert(id.clone(), tls::client_config(settings)?);
            debug!(bridge = %id, "dedicated outbound TLS context provisioned");
        }
        info!(bridge = %id, "outbound bridge registered");
        self.outbound.insert(id, bridge);
        Ok(())
    }

    pub fn inbound(&self, id: &str) -> BridgeResult<Arc<InboundBridge>> {
        self.inbound
            .get(id)
            .map(|b| b.clone())
            .ok_or_else(|| BridgeError::BridgeNotFound(id.to_string()))
    }

    pub fn outbound(&self, id: &str) -> BridgeResult<Arc<OutboundBridge>> {
        self.outbound
            .get(id)
            .map(|b| b.clone())
            .ok_or_else(|| BridgeError::BridgeNotFound(id.to_string()))
    }

    /// Look a bridge up through its shared capability.
    pub fn bridge(&self, id: &str, direction: Direction) -> BridgeResult<Arc<dyn Bridge>> {
        let bridge: Arc<dyn Bridge> = match direction {
            Direction::Inbound => self.inbound(id)?,
            Direction::Outbound => self.outbound(id)?,
        };
        Ok(bridge)
    }

    pub fn deregister_inbound(&self, id: &str) -> Option<Arc<InboundBridge>> {
        let removed = self.inbound.remove(id).map(|(_, b)| b);
        if removed.is_some() {
            info!(bridge = %id, "inbound bridge deregistered");
        }
        removed
    }

    /// Remove an outbound bridge and discard its dedicated TLS context.
    pub fn deregister_outbound(&self, id: &str) -> Option<Arc<OutboundBridge>> {
        self.client_tls.remove(id);
        let removed = self.outbound.remove(id).map(|(_, b)| b);
        if removed.is_some() {
            info!(bridge = %id, "outbound bridge deregistered");
        }
        removed
    }

    /// TLS context for dials made on behalf of entity `id`.
    pub fn client_tls(&self, id: &str) -> Arc<ClientConfig> {
        self.client_tls
            .get(id)
            .map(|c| c.clone())
            .unwrap_or_else(|| self.default_client_tls.clone())
    }

    pub fn has_dedicated_tls(&self, id: &str) -> bool {
        self.client_tls.contains_key(id)
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    pub fn inbound_ids(&self) -> Vec<String> {
        self.inbound.iter().map(|e| e.key().clone()).collect()
    }
}
