//! Error types for wgrelay

use thiserror::Error;

/// Result type alias using wgrelay Error
pub type Result<T> = std::result::Result<T, Error>;

/// wgrelay error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Key generation failed: {0}")]
    Generation(String),

    #[error("Subnet {subnet} exhausted, no addresses available")]
    Capacity { subnet: String },

    #[error("WireGuard runtime sync failed: {0}")]
    RuntimeSync(String),

    #[error("Public key already registered: {public_key}")]
    DuplicateKey { public_key: String },

    #[error("Address already assigned to an active peer: {address}")]
    DuplicateAddress { address: String },

    #[error("Peer not found: {public_key}")]
    PeerNotFound { public_key: String },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error indicates a store-constraint violation that should
    /// never occur under correct allocation locking.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            Error::DuplicateKey { .. } | Error::DuplicateAddress { .. }
        )
    }
}
