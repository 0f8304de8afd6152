use thiserror::Error;

/// Errors produced by the bridge engine and its protocol helpers.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid payload type: expected {expected}, envelope carries {actual}")]
    InvalidType {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("socket {0} is no longer available")]
    NotAvailable(String),

    #[error("no bridge registered for connection {0}")]
    BridgeNotFound(String),

    #[error("connection registry already initialized")]
    RegistryAlreadyInitialized,

    #[error("unresolved placeholder in url template: ${{{0}}}")]
    UnresolvedPlaceholder(String),

    #[error("invalid url template: {0}")]
    InvalidTemplate(String),

    #[error("policy error: {0}")]
    Policy(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out dialing {0}")]
    DialTimeout(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Codec(e.to_string())
    }
}

impl From<base64::DecodeError> for BridgeError {
    fn from(e: base64::DecodeError) -> Self {
        BridgeError::Codec(format!("base64: {e}"))
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
