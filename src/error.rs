//! hermes-sshappbackend/src/error.rs
//! Error kinds shared by the wire codecs, the session runtime, and the
//! controller/agent halves of the backend.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HermesError {
    #[error("truncated read: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("unknown message tag {0}")]
    InvalidTag(u8),

    #[error("invalid protocol byte {0} (expected 0=tcp or 1=udp)")]
    InvalidProtocol(u8),

    #[error("invalid IP version byte {0} (expected 4 or 6)")]
    InvalidIpVersion(u8),

    #[error("invalid protocol-check method byte {0} (expected 5 or 6)")]
    InvalidProtocolMethod(u8),

    #[error("unexpected list delimiter byte {0}")]
    ListDelimiterInvalid(u8),

    #[error("dispatch received a message shape it didn't expect: {0}")]
    TypecastMismatch(&'static str),

    #[error("transport closed")]
    TransportClosed,

    #[error("bootstrap failed: {reason}")]
    BootstrapFailed { reason: String },

    #[error("failed to bind listener: {0}")]
    BindFailed(#[source] std::io::Error),

    #[error("failed to dial target: {0}")]
    DialFailed(#[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HermesError>;
