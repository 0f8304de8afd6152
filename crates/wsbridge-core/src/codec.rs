//! Canonical structured form of a [`MessageEnvelope`].
//!
//! Wire format: a JSON object with fixed, ordered fields
//! `id, client_id, type, origin, subprotocol, offset, length, data`.
//! Binary buffers are base64-encoded whole into `data` and the window is
//! carried in `offset`/`length`; text is carried as-is.

use crate::envelope::{check_window, MessageEnvelope, PayloadKind};
use crate::error::{BridgeError, BridgeResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// The ordered record exchanged with policy services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEnvelope {
    pub id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: PayloadKind,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub subprotocol: Option<String>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub length: usize,
    #[serde(default)]
    pub data: String,
}

/// Convert an envelope into its canonical record.
pub fn to_canonical(env: &MessageEnvelope) -> CanonicalEnvelope {
    let data = match env.kind() {
        PayloadKind::Handshake => String::new(),
        PayloadKind::Text => env.text_payload().unwrap_or_default().to_string(),
        PayloadKind::Binary => STANDARD.encode(env.binary_buffer().unwrap_or_default()),
    };
    CanonicalEnvelope {
        id: env.socket_id.clone(),
        client_id: env.client_id.clone(),
        kind: env.kind(),
        origin: env.origin.clone(),
        subprotocol: env.subprotocol.clone(),
        offset: env.offset(),
        length: env.length(),
        data,
    }
}

/// Rebuild an envelope from a canonical record, validating the binary window.
pub fn from_canonical(record: CanonicalEnvelope) -> BridgeResult<MessageEnvelope> {
    let env = match record.kind {
        PayloadKind::Handshake => MessageEnvelope::handshake(record.id),
        PayloadKind::Text => MessageEnvelope::text(record.id, record.data),
        PayloadKind::Binary => {
            let bytes = STANDARD.decode(record.data.as_bytes())?;
            check_window(bytes.len(), record.offset, record.length)?;
            MessageEnvelope::binary_window(record.id, bytes, record.offset, record.length)?
        }
    };
    Ok(env
        .with_client_id(record.client_id)
        .with_origin(record.origin)
        .with_subprotocol(record.subprotocol))
}

/// Serialize an envelope to its canonical JSON text.
pub fn encode(env: &MessageEnvelope) -> BridgeResult<String> {
    Ok(serde_json::to_string(&to_canonical(env))?)
}

/// Parse canonical JSON text back into an envelope.
pub fn decode(text: &str) -> BridgeResult<MessageEnvelope> {
    let record: CanonicalEnvelope = serde_json::from_str(text)?;
    from_canonical(record)
}

/// Decode a canonical record and fail unless it carries `expected`.
pub fn decode_expecting(text: &str, expected: PayloadKind) -> BridgeResult<MessageEnvelope> {
    let env = decode(text)?;
    if env.kind() != expected {
        return Err(BridgeError::InvalidType {
            expected: expected.as_str(),
            actual: env.kind().as_str(),
        });
    }
    Ok(env)
}
