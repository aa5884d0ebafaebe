//! Passphrase key derivation
//!
//! PBKDF2-HMAC-SHA256 with a caller-supplied work factor. The iteration
//! count travels next to the data (in the key version record), never inside
//! the salt, so it can be raised without touching the payload format.

use crate::crypto::{CryptoProvider, Passphrase, KEY_SIZE, SALT_SIZE};
use crate::error::{Error, Result};
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use zeroize::Zeroizing;

/// A derived symmetric key, owned by the call that derived it.
///
/// Never serialized; the key bytes are wiped on drop.
pub struct KeyMaterial {
    key: Zeroizing<[u8; KEY_SIZE]>,
    salt: [u8; SALT_SIZE],
    iterations: u32,
}

impl KeyMaterial {
    /// Get the raw key bytes
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Salt this key was derived with
    pub fn salt(&self) -> &[u8; SALT_SIZE] {
        &self.salt
    }

    /// Work factor this key was derived with
    pub fn iterations(&self) -> u32 {
        self.iterations
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key", &"[REDACTED]")
            .field("salt", &hex::encode(self.salt))
            .field("iterations", &self.iterations)
            .finish()
    }
}

/// Turns a passphrase plus salt into key material. Stateless.
#[derive(Clone)]
pub struct KeyDerivationService {
    provider: Arc<dyn CryptoProvider>,
}

impl KeyDerivationService {
    pub fn new(provider: Arc<dyn CryptoProvider>) -> Self {
        KeyDerivationService { provider }
    }

    /// Derive a key.
    ///
    /// Same `(passphrase, salt, iterations)` always yields the same key.
    /// Fails only on malformed input: a salt of the wrong length or a zero
    /// work factor.
    pub fn derive(
        &self,
        passphrase: &Passphrase,
        salt: &[u8],
        iterations: u32,
    ) -> Result<KeyMaterial> {
        let salt: [u8; SALT_SIZE] = salt.try_into().map_err(|_| {
            Error::MalformedInput(format!(
                "Salt must be {} bytes, got {}",
                SALT_SIZE,
                salt.len()
            ))
        })?;
        let rounds = NonZeroU32::new(iterations).ok_or_else(|| {
            Error::MalformedInput("KDF iteration count must be non-zero".to_string())
        })?;

        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        self.provider
            .derive_key(passphrase.as_bytes(), &salt, rounds, &mut key);

        Ok(KeyMaterial {
            key,
            salt,
            iterations,
        })
    }

    /// Generate a fresh random salt
    pub fn generate_salt(&self) -> Result<[u8; SALT_SIZE]> {
        let mut salt = [0u8; SALT_SIZE];
        self.provider.fill_random(&mut salt)?;
        Ok(salt)
    }
}
