//! Capability shared by the inbound and outbound halves of a connection.

use crate::index::ClientIndex;
use crate::socket::{BroadcastReport, SocketSession, SocketTable};
use std::fmt;
use wsbridge_core::identity::{is_socket_id_for, parse_socket_id};
use wsbridge_core::{BridgeResult, Frame, MessageEnvelope, PolicyPipeline};

/// Which half of a logical connection a bridge serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

/// Addressing and delivery operations both bridges provide.
pub trait Bridge: Send + Sync {
    fn id(&self) -> &str;

    fn direction(&self) -> Direction;

    /// Map a socket id or client id to the live socket ids it names.
    ///
    /// A socket id minted by this bridge is returned unchanged. Anything else
    /// is treated as a client id and looked up in the reverse index; with
    /// `subprotocol` set, only sockets that negotiated it are returned.
    fn resolve_socket_ids(&self, id: &str, subprotocol: Option<&str>) -> Vec<String>;

    /// Deliver one frame to one socket.
    fn send(&self, socket_id: &str, frame: Frame) -> BridgeResult<()>;

    /// Best-effort delivery to every live socket.
    fn broadcast(&self, frame: &Frame) -> BroadcastReport;

    /// Close `socket_id` because its peer went away. No-op if already gone;
    /// never notifies the peer back.
    fn close_peer(&self, socket_id: &str, code: u16, reason: &str);
}

/// Resolution rule shared by both bridge implementations.
pub(crate) fn resolve_ids(
    bridge_id: &str,
    index: &ClientIndex,
    id: &str,
    subprotocol: Option<&str>,
) -> Vec<String> {
    if is_socket_id_for(bridge_id, id) {
        return vec![id.to_string()];
    }
    index
        .lookup(id)
        .into_iter()
        .filter(|sid| match subprotocol {
            Some(want) => parse_socket_id(sid).is_some_and(|p| p.subprotocol == want),
            None => true,
        })
        .collect()
}

/// Broadcast over a socket table.
pub(crate) fn broadcast_to(sockets: &SocketTable, frame: &Frame) -> BroadcastReport {
    crate::socket::fan_out(&sockets.snapshot(), frame)
}

/// Run one data frame through the per-message policy, if one is configured.
///
/// Returns the frame to pass on (`None` when the pipeline consumed it), or the
/// failure reason for a non-success disposition.
pub(crate) async fn process_frame(
    pipeline: &dyn PolicyPipeline,
    service: Option<&str>,
    session: &mut SocketSession,
    frame: Frame,
) -> Result<Option<Frame>, String> {
    let Some(service) = service else {
        return Ok(Some(frame));
    };
    let envelope = MessageEnvelope::from_frame(session.handle.id(), frame)
        .with_client_id(session.handle.client_id().map(str::to_string))
        .with_origin(session.origin.clone())
        .with_subprotocol(session.handle.subprotocol().map(str::to_string));
    let outcome = pipeline
        .process(service, envelope, &mut session.request, &mut session.auth)
        .await;
    if !outcome.disposition.is_success() {
        return Err(outcome.disposition.reason().to_string());
    }
    Ok(outcome.envelope.into_frame())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_ids_pass_through() {
        let index = ClientIndex::new();
        assert_eq!(resolve_ids("gw", &index, "gw:7:chat", None), vec!["gw:7:chat"]);
    }

    #[test]
    fn foreign_socket_id_is_treated_as_client_id() {
        let index = ClientIndex::new();
        index.add("other:1:", "gw:3:");
        assert_eq!(resolve_ids("gw", &index, "other:1:", None), vec!["gw:3:"]);
    }

    #[test]
    fn client_ids_filter_by_subprotocol() {
        let index = ClientIndex::new();
        index.add("alice", "gw:1:chat");
        index.add("alice", "gw:2:");
        index.add("alice", "gw:3:chat");
        assert_eq!(
            resolve_ids("gw", &index, "alice", Some("chat")),
            vec!["gw:1:chat", "gw:3:chat"]
        );
        assert_eq!(resolve_ids("gw", &index, "alice", None).len(), 3);
        assert!(resolve_ids("gw", &index, "bob", None).is_empty());
    }
}
