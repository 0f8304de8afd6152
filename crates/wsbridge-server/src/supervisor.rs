//! Bridge lifecycle: the entity change feed drives start / restart / stop.

use crate::inbound::InboundBridge;
use crate::outbound::OutboundBridge;
use crate::registry::ConnectionRegistry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use wsbridge_core::{BridgeError, BridgeResult, ConnectionEntity, PolicyPipeline};

/// A change to the set of configured connection entities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityEvent {
    Created(ConnectionEntity),
    Updated(ConnectionEntity),
    Deleted(String),
}

/// Opens and closes listen ports in whatever firewall sits in front of us.
pub trait PortManager: Send + Sync {
    fn open_port(&self, bridge_id: &str, port: u16) -> BridgeResult<()>;
    fn close_port(&self, bridge_id: &str, port: u16) -> BridgeResult<()>;
}

/// Port manager for hosts without a managed firewall.
#[derive(Debug, Default)]
pub struct LoggingPortManager;

impl PortManager for LoggingPortManager {
    fn open_port(&self, bridge_id: &str, port: u16) -> BridgeResult<()> {
        info!(bridge = %bridge_id, port, "open port");
        Ok(())
    }

    fn close_port(&self, bridge_id: &str, port: u16) -> BridgeResult<()> {
        info!(bridge = %bridge_id, port, "close port");
        Ok(())
    }
}

pub struct Supervisor {
    registry: OnceLock<Arc<ConnectionRegistry>>,
    pipeline: Arc<dyn PolicyPipeline>,
    ports: Arc<dyn PortManager>,
    bind_addr: String,
    /// Listen port currently open for each running bridge.
    open_ports: Mutex<HashMap<String, u16>>,
}

impl Supervisor {
    pub fn new(
        pipeline: Arc<dyn PolicyPipeline>,
        ports: Arc<dyn PortManager>,
        bind_addr: impl Into<String>,
    ) -> Self {
        Self {
            registry: OnceLock::new(),
            pipeline,
            ports,
            bind_addr: bind_addr.into(),
            open_ports: Mutex::new(HashMap::new()),
        }
    }

    /// Create the connection registry. Must happen exactly once, before any
    /// bridge starts.
    pub fn init_registry(
        &self,
        runtime: Handle,
        dial_timeout: Duration,
    ) -> BridgeResult<Arc<ConnectionRegistry>> {
        if self.registry.get().is_some() {
            return Err(BridgeError::RegistryAlreadyInitialized);
        }
        let registry = Arc::new(ConnectionRegistry::new(runtime, dial_timeout)?);
        self.registry
            .set(registry.clone())
            .map_err(|_| BridgeError::RegistryAlreadyInitialized)?;
        Ok(registry)
    }

    pub fn registry(&self) -> BridgeResult<Arc<ConnectionRegistry>> {
        self.registry
            .get()
            .cloned()
            .ok_or_else(|| BridgeError::Config("connection registry not initialized".into()))
    }

    /// Build, register and start the bridge pair for `entity`.
    pub async fn start(&self, entity: ConnectionEntity) -> BridgeResult<SocketAddr> {
        entity.validate()?;
        let registry = self.registry()?;
        let id = entity.id.clone();
        if registry.inbound(&id).is_ok() {
            return Err(BridgeError::Config(format!("bridge {id} is already running")));
        }
        let entity = Arc::new(entity);

        let inbound = InboundBridge::new(entity.clone(), registry.clone(), self.pipeline.clone())?;
        if !entity.loopback {
            let outbound =
                OutboundBridge::new(entity.clone(), registry.clone(), self.pipeline.clone());
            registry.register_outbound(outbound)?;
        }
        registry.register_inbound(inbound.clone());

        let local = match inbound.start(&self.bind_addr).await {
            Ok(addr) => addr,
            Err(e) => {
                registry.deregister_inbound(&id);
                registry.deregister_outbound(&id);
                return Err(e);
            }
        };

        let previous = self.open_ports.lock().await.insert(id.clone(), local.port());
        match previous {
            Some(old) if old == local.port() => {}
            Some(old) => {
                self.ports.close_port(&id, old)?;
                self.ports.open_port(&id, local.port())?;
            }
            None => self.ports.open_port(&id, local.port())?,
        }
        Ok(local)
    }

    /// Stop and deregister both halves of a bridge. The listen port stays
    /// recorded so a restart can tell whether it changed.
    pub async fn stop(&self, id: &str) -> bool {
        let Ok(registry) = self.registry() else {
            return false;
        };
        let inbound = registry.deregister_inbound(id);
        let outbound = registry.deregister_outbound(id);
        if let Some(inbound) = &inbound {
            inbound.stop().await;
        }
        if let Some(outbound) = &outbound {
            outbound.stop().await;
        }
        inbound.is_some() || outbound.is_some()
    }

    async fn release_port(&self, id: &str) -> BridgeResult<()> {
        let port = self.open_ports.lock().await.remove(id);
        match port {
            Some(port) => self.ports.close_port(id, port),
            None => Ok(()),
        }
    }

    /// Apply one change-feed event.
    pub async fn apply(&self, event: EntityEvent) -> BridgeResult<()> {
        match event {
            EntityEvent::Created(entity) => {
                if !entity.enabled {
                    info!(bridge = %entity.id, "entity disabled, not starting");
                    return Ok(());
                }
                self.start(entity).await.map(|_| ())
            }
            EntityEvent::Updated(entity) => {
                let id = entity.id.clone();
                self.stop(&id).await;
                if !entity.enabled {
                    info!(bridge = %id, "entity disabled");
                    return self.release_port(&id).await;
                }
                if let Err(e) = self.start(entity).await {
                    self.release_port(&id).await?;
                    return Err(e);
                }
                info!(bridge = %id, "bridge restarted");
                Ok(())
            }
            EntityEvent::Deleted(id) => {
                self.stop(&id).await;
                self.release_port(&id).await
            }
        }
    }

    /// Consume the change feed until its sender goes away. A failing event
    /// only affects its own bridge.
    pub async fn run(&self, mut events: mpsc::Receiver<EntityEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.apply(event).await {
                warn!(error = %e, "entity event failed");
            }
        }
    }

    /// Stop every running bridge and close their ports.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.open_ports.lock().await.keys().cloned().collect();
        for id in ids {
            self.stop(&id).await;
            if let Err(e) = self.release_port(&id).await {
                warn!(bridge = %id, error = %e, "failed to close port");
            }
        }
    }
}

/// Events that turn the entity set `old` into `new`.
pub fn diff_entities(old: &[ConnectionEntity], new: &[ConnectionEntity]) -> Vec<EntityEvent> {
    let before: HashMap<&str, &ConnectionEntity> = old.iter().map(|e| (e.id.as_str(), e)).collect();
    let after: HashMap<&str, &ConnectionEntity> = new.iter().map(|e| (e.id.as_str(), e)).collect();

    let mut events = Vec::new();
    for e in new {
        match before.get(e.id.as_str()) {
            None => events.push(EntityEvent::Created(e.clone())),
            Some(prev) if *prev != e => events.push(EntityEvent::Updated(e.clone())),
            Some(_) => {}
        }
    }
    for e in old {
        if !after.contains_key(e.id.as_str()) {
            events.push(EntityEvent::Deleted(e.id.clone()));
        }
    }
    events
}
