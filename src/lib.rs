//! zkdocs - Zero-knowledge document encryption
//!
//! Documents are sealed on the client with AES-256-GCM under a key derived
//! from a passphrase the server never sees. The store keeps only ciphertext,
//! salts, nonces and a pseudonymous identity hash. Passphrase changes rotate
//! every document to a new key version in one atomic commit.

pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod retry;
pub mod rotation;
pub mod store;
pub mod vault;

pub use config::Config;
pub use error::{Error, Result};
pub use vault::DocumentVault;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::crypto::{EncryptedPayload, IdentityHash, Passphrase};
    pub use crate::error::{Error, Result};
    pub use crate::rotation::{RotationHandle, RotationResult, RotationState};
    pub use crate::store::{DocumentId, DocumentStore, EncryptedDocument, UserId};
    pub use crate::vault::{DocumentVault, SaveOutcome};
}
