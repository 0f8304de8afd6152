//! The Message Envelope: one frame plus its addressing metadata.
//!
//! A fresh envelope is built for every handshake and every frame and handed
//! to the policy pipeline by value, so no two pipeline calls ever share one.

use crate::error::{BridgeError, BridgeResult};
use crate::pipeline::Disposition;
use serde::{Deserialize, Serialize};

/// Payload kind carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    /// Handshake envelopes carry addressing metadata only.
    Handshake,
    Text,
    Binary,
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::Text => "text",
            Self::Binary => "binary",
        }
    }
}

/// A WebSocket data frame as the bridges move it between sockets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(t) => t.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Payload {
    Empty,
    Text(String),
    Binary(Vec<u8>),
}

/// Canonical unit exchanged with the policy pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    /// Socket id of the physical socket the frame arrived on.
    pub socket_id: String,
    /// Application-level identity, when one was established at handshake.
    pub client_id: Option<String>,
    /// Remote address (or `Origin` header) of the peer.
    pub origin: Option<String>,
    pub subprotocol: Option<String>,
    /// Set by the pipeline after processing.
    pub status: Option<Disposition>,
    payload: Payload,
    offset: usize,
    length: usize,
}

impl MessageEnvelope {
    /// Envelope for handshake authorization: addressing metadata, no payload.
    pub fn handshake(socket_id: impl Into<String>) -> Self {
        Self::with_payload(socket_id.into(), Payload::Empty, 0, 0)
    }

    pub fn text(socket_id: impl Into<String>, text: String) -> Self {
        let length = text.len();
        Self::with_payload(socket_id.into(), Payload::Text(text), 0, length)
    }

    /// Binary envelope covering the whole buffer.
    pub fn binary(socket_id: impl Into<String>, data: Vec<u8>) -> Self {
        let length = data.len();
        Self::with_payload(socket_id.into(), Payload::Binary(data), 0, length)
    }

    /// Binary envelope over a window of `data`; the buffer is not copied.
    pub fn binary_window(
        socket_id: impl Into<String>,
        data: Vec<u8>,
        offset: usize,
        length: usize,
    ) -> BridgeResult<Self> {
        check_window(data.len(), offset, length)?;
        Ok(Self::with_payload(
            socket_id.into(),
            Payload::Binary(data),
            offset,
            length,
        ))
    }

    /// Build the envelope for an incoming frame.
    pub fn from_frame(socket_id: impl Into<String>, frame: Frame) -> Self {
        match frame {
            Frame::Text(t) => Self::text(socket_id, t),
            Frame::Binary(b) => Self::binary(socket_id, b),
        }
    }

    fn with_payload(socket_id: String, payload: Payload, offset: usize, length: usize) -> Self {
        Self {
            socket_id,
            client_id: None,
            origin: None,
            subprotocol: None,
            status: None,
            payload,
            offset,
            length,
        }
    }

    pub fn with_client_id(mut self, client_id: Option<String>) -> Self {
        self.client_id = client_id;
        self
    }

    pub fn with_origin(mut self, origin: Option<String>) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_subprotocol(mut self, subprotocol: Option<String>) -> Self {
        self.subprotocol = subprotocol;
        self
    }

    pub fn kind(&self) -> PayloadKind {
        match self.payload {
            Payload::Empty => PayloadKind::Handshake,
            Payload::Text(_) => PayloadKind::Text,
            Payload::Binary(_) => PayloadKind::Binary,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Text accessor. Fails with [`BridgeError::InvalidType`] on any other kind.
    pub fn text_payload(&self) -> BridgeResult<&str> {
        match &self.payload {
            Payload::Text(t) => Ok(t),
            _ => Err(BridgeError::InvalidType {
                expected: PayloadKind::Text.as_str(),
                actual: self.kind().as_str(),
            }),
        }
    }

    /// Binary accessor: the `offset..offset + length` window of the buffer.
    pub fn binary_payload(&self) -> BridgeResult<&[u8]> {
        match &self.payload {
            Payload::Binary(b) => Ok(&b[self.offset..self.offset + self.length]),
            _ => Err(BridgeError::InvalidType {
                expected: PayloadKind::Binary.as_str(),
                actual: self.kind().as_str(),
            }),
        }
    }

    /// Whole underlying binary buffer, ignoring the window.
    pub(crate) fn binary_buffer(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Replace the text payload, keeping addressing metadata.
    pub fn set_text(&mut self, text: String) {
        self.offset = 0;
        self.length = text.len();
        self.payload = Payload::Text(text);
    }

    /// Replace the binary payload, keeping addressing metadata.
    pub fn set_binary(&mut self, data: Vec<u8>) {
        self.offset = 0;
        self.length = data.len();
        self.payload = Payload::Binary(data);
    }

    /// Turn the (possibly transformed) envelope back into a frame.
    ///
    /// Returns `None` for handshake envelopes. A binary window that covers
    /// the whole buffer is moved out without copying.
    pub fn into_frame(self) -> Option<Frame> {
        match self.payload {
            Payload::Empty => None,
            Payload::Text(t) => Some(Frame::Text(t)),
            Payload::Binary(b) => {
                if self.offset == 0 && self.length == b.len() {
                    Some(Frame::Binary(b))
                } else {
                    Some(Frame::Binary(
                        b[self.offset..self.offset + self.length].to_vec(),
                    ))
                }
            }
        }
    }
}

pub(crate) fn check_window(len: usize, offset: usize, length: usize) -> BridgeResult<()> {
    match offset.checked_add(length) {
        Some(end) if end <= len => Ok(()),
        _ => Err(BridgeError::Codec(format!(
            "window {offset}+{length} exceeds buffer of {len} bytes"
        ))),
    }
}
