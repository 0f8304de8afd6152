//! Out-of-band delivery: server-initiated frames pushed to live sockets.

use crate::bridge::{Bridge, Direction};
use crate::registry::ConnectionRegistry;
use std::sync::Arc;
use tracing::debug;
use wsbridge_core::{BridgeResult, Frame};

/// Who an injected frame is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    Broadcast,
    /// Socket ids or client ids; a client id fans out to all its sockets.
    Ids(Vec<String>),
}

#[derive(Clone)]
pub struct Injector {
    registry: Arc<ConnectionRegistry>,
}

impl Injector {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Push `frame` to the addressed sockets of one bridge.
    ///
    /// Returns the ids that could not be reached: socket ids whose delivery
    /// failed, and requested ids that resolved to no live socket. Only a
    /// missing bridge fails the whole call.
    pub fn send_to_client(
        &self,
        bridge_id: &str,
        direction: Direction,
        recipients: &Recipients,
        frame: Frame,
        subprotocol: Option<&str>,
    ) -> BridgeResult<Vec<String>> {
        let bridge = self.registry.bridge(bridge_id, direction)?;
        let ids = match recipients {
            Recipients::Broadcast => {
                let report = bridge.broadcast(&frame);
                debug!(
                    bridge = %bridge_id,
                    %direction,
                    delivered = report.delivered,
                    failed = report.failed.len(),
                    "broadcast"
                );
                return Ok(report.failed);
            }
            Recipients::Ids(ids) => ids,
        };

        let mut failed = Vec::new();
        for id in ids {
            let socket_ids = bridge.resolve_socket_ids(id, subprotocol);
            if socket_ids.is_empty() {
                failed.push(id.clone());
                continue;
            }
            for socket_id in socket_ids {
                let delivered =
                    self.deliver(bridge_id, direction, bridge.as_ref(), &socket_id, frame.clone());
                if delivered.is_err() {
                    failed.push(socket_id);
                }
            }
        }
        debug!(bridge = %bridge_id, %direction, failed = failed.len(), "direct send");
        Ok(failed)
    }

    fn deliver(
        &self,
        bridge_id: &str,
        direction: Direction,
        bridge: &dyn Bridge,
        socket_id: &str,
        frame: Frame,
    ) -> BridgeResult<()> {
        match direction {
            Direction::Inbound => bridge.send(socket_id, frame),
            // Backend sockets reject plain sends; push onto the live socket.
            Direction::Outbound => self.registry.outbound(bridge_id)?.deliver(socket_id, frame),
        }
    }
}
