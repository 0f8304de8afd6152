//! Socket ids and client-id derivation.
//!
//! A socket id is `<bridge_id>:<sequence>:<subprotocol>` (the subprotocol
//! segment is empty when none was negotiated). Sequences come from a
//! per-bridge atomic counter, so ids are never reused within a process.

use std::sync::atomic::{AtomicU64, Ordering};

/// Generates process-unique socket ids for one bridge.
#[derive(Debug)]
pub struct SocketIdGenerator {
    bridge_id: String,
    next: AtomicU64,
}

impl SocketIdGenerator {
    pub fn new(bridge_id: impl Into<String>) -> Self {
        Self {
            bridge_id: bridge_id.into(),
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next id.
    pub fn next_id(&self, subprotocol: Option<&str>) -> String {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}:{}:{}", self.bridge_id, seq, subprotocol.unwrap_or(""))
    }

    pub fn bridge_id(&self) -> &str {
        &self.bridge_id
    }
}

/// Borrowed view of a parsed socket id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketIdParts<'a> {
    pub bridge_id: &'a str,
    pub sequence: u64,
    pub subprotocol: &'a str,
}

/// Parse a socket id; `None` if it does not have the socket-id shape.
pub fn parse_socket_id(id: &str) -> Option<SocketIdParts<'_>> {
    let mut parts = id.splitn(3, ':');
    let bridge_id = parts.next()?;
    let sequence = parts.next()?.parse::<u64>().ok()?;
    let subprotocol = parts.next()?;
    if bridge_id.is_empty() {
        return None;
    }
    Some(SocketIdParts {
        bridge_id,
        sequence,
        subprotocol,
    })
}

/// Whether `candidate` is a socket id minted by the bridge `bridge_id`.
pub fn is_socket_id_for(bridge_id: &str, candidate: &str) -> bool {
    parse_socket_id(candidate).is_some_and(|p| p.bridge_id == bridge_id)
}

/// Extract a bearer token from an `Authorization` header value.
pub fn bearer_token(authorization: &str) -> Option<&str> {
    let (scheme, token) = authorization.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Look up a query parameter in a raw (undecoded) query string.
pub fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}
