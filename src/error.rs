//! Error types for zkdocs

use crate::store::DocumentId;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for zkdocs
#[derive(Error, Debug)]
pub enum Error {
    // Crypto errors
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Authentication failed: incorrect passphrase or corrupted data")]
    AuthenticationFailure,

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    #[error("Random source unavailable")]
    RandomUnavailable,

    // Rotation errors
    #[error("Re-encryption failed for {} document(s)", .0.len())]
    PartialReEncryption(Vec<DocumentId>),

    #[error("Persistence conflict: {0}")]
    PersistenceConflict(String),

    #[error("A key rotation is already in progress for user {0}")]
    RotationInProgress(String),

    #[error("Rotation cancelled")]
    Cancelled,

    #[error("Key rotated from version {from} to {to}; save again under the new passphrase")]
    KeyRotated { from: u64, to: u64 },

    // Store errors
    #[error("No active key version for user {0}")]
    NoActiveKeyVersion(String),

    #[error("Key version not found: {0}")]
    KeyVersionNotFound(u64),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the operation may succeed if repeated with the same inputs.
    ///
    /// Only persistence-layer hiccups qualify. Cryptographic failures never do:
    /// retrying a wrong passphrase cannot succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_) | Error::Timeout(_))
    }

    /// Whether this error means the supplied passphrase was rejected
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, Error::AuthenticationFailure)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Error::MalformedInput(format!("invalid base64: {}", e))
    }
}
