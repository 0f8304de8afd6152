//! wsbridge-core: protocol-level pieces of the WebSocket bridge.
//!
//! Provides the Message Envelope and its canonical codec, socket-id
//! generation, URL template resolution, the connection-entity model, and the
//! policy-pipeline boundary. Nothing in this crate touches a socket.

pub mod codec;
pub mod entity;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod pipeline;
pub mod template;

// Re-export commonly used items at crate root.
pub use entity::{ClientAuth, ConnectionEntity};
pub use envelope::{Frame, MessageEnvelope, PayloadKind};
pub use error::{BridgeError, BridgeResult};
pub use identity::{is_socket_id_for, SocketIdGenerator};
pub use pipeline::{
    AuthContext, Disposition, PolicyOutcome, PolicyPipeline, RecordPipeline, RecordService,
    RequestContext,
};
