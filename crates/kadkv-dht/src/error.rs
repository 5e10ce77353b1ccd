//! DHT error types

use libp2p::PeerId;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, DhtError>;

/// DHT errors
#[derive(Debug, Error)]
pub enum DhtError {
    /// Listen or swarm construction failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Substrate self-bootstrap failed
    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),

    /// Dialing a peer failed or timed out
    #[error("Failed to connect to {peer}: {reason}")]
    Connect {
        /// Peer that was dialed
        peer: PeerId,
        /// Underlying cause
        reason: String,
    },

    /// Store retries exhausted
    #[error("Failed to store record after {attempts} attempts: {source}")]
    StoreFailed {
        /// Attempts made
        attempts: u32,
        /// Last underlying error
        #[source]
        source: Box<DhtError>,
    },

    /// Fetch retries exhausted
    #[error("Failed to fetch record after {attempts} attempts: {source}")]
    FetchFailed {
        /// Attempts made
        attempts: u32,
        /// Last underlying error
        #[source]
        source: Box<DhtError>,
    },

    /// No record exists for the key
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Deadline exceeded
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Node already closed
    #[error("Node is closed")]
    Closed,

    /// Key outside the application namespace
    #[error("Invalid key {key:?}: {reason}")]
    InvalidKey {
        /// Offending key
        key: String,
        /// Why it was rejected
        reason: String,
    },

    /// Orchestration assertion failed
    #[error("Verification failed: {0}")]
    Verification(String),

    /// Transient failure of a single substrate call
    #[error("Network error: {0}")]
    Network(String),

    /// Readiness wait cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DhtError {
    /// Attempt count carried by terminal retry errors
    pub fn attempts(&self) -> Option<u32> {
        match self {
            DhtError::StoreFailed { attempts, .. } | DhtError::FetchFailed { attempts, .. } => {
                Some(*attempts)
            }
            _ => None,
        }
    }

    /// Whether this is a definitive absence rather than a failure
    pub fn is_not_found(&self) -> bool {
        matches!(self, DhtError::NotFound(_))
    }
}

impl crate::retry::Retriable for DhtError {
    fn is_retriable(&self) -> bool {
        matches!(self, DhtError::Network(_))
    }
}

impl From<libp2p::core::transport::TransportError<std::io::Error>> for DhtError {
    fn from(err: libp2p::core::transport::TransportError<std::io::Error>) -> Self {
        DhtError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for DhtError {
    fn from(err: serde_json::Error) -> Self {
        DhtError::Configuration(err.to_string())
    }
}
