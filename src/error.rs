//! Error taxonomy shared by the routing core and its collaborators.

use thiserror::Error;

/// Errors surfaced by the routing table, correlation layer and transport.
///
/// Peer unreachability ([`KadError::Timeout`], [`KadError::SendQueueFull`]) is
/// never fatal: it resolves a pending request or drives bucket eviction.
#[derive(Debug, Error)]
pub enum KadError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("send queue full")]
    SendQueueFull,

    #[error("request timed out")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,
}

impl KadError {
    /// Whether this failure is the timeout outcome of a pending request.
    pub fn is_timeout(&self) -> bool {
        matches!(self, KadError::Timeout)
    }
}

impl From<toml::de::Error> for KadError {
    fn from(err: toml::de::Error) -> Self {
        KadError::Config(err.to_string())
    }
}
