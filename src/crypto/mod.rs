//! Cryptography module for zkdocs
//!
//! Provides AES-256-GCM encryption with PBKDF2-HMAC-SHA256 key derivation.
//! Documents are sealed on the client; only ciphertext, salt and nonce
//! ever reach the store.

mod engine;
mod identity;
mod kdf;
mod passphrase;
mod payload;
pub mod provider;

pub use engine::EncryptionEngine;
pub use identity::{IdentityHash, IdentityResolver, DEFAULT_IDENTITY_SALT};
pub use kdf::{KeyDerivationService, KeyMaterial};
pub use passphrase::Passphrase;
pub(crate) use payload::base64_serde;
pub use payload::EncryptedPayload;
pub use provider::{CryptoProvider, RingProvider, SeededProvider};

/// Size of AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of GCM nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Size of salt for key derivation
pub const SALT_SIZE: usize = 32;

/// Minimum PBKDF2 work factor accepted by configuration
pub const MIN_KDF_ITERATIONS: u32 = 100_000;

/// Associated data bound into every payload
pub(crate) const PAYLOAD_AAD: &[u8] = b"zkdocs-payload-v1";
