//! AES-256-GCM sealing of document payloads
//!
//! Every seal draws a fresh random nonce. `seal` additionally draws a fresh
//! salt and runs the KDF; `seal_with_key` reuses an already-derived key (and
//! its salt), which is how a whole key version's documents share one
//! derivation.

use crate::crypto::{
    CryptoProvider, EncryptedPayload, KeyDerivationService, KeyMaterial, Passphrase, NONCE_SIZE,
    PAYLOAD_AAD,
};
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::debug;

/// Authenticated encryption of arbitrary byte payloads
#[derive(Clone)]
pub struct EncryptionEngine {
    provider: Arc<dyn CryptoProvider>,
    kdf: KeyDerivationService,
    iterations: u32,
}

impl EncryptionEngine {
    /// Create an engine that derives keys with `iterations` rounds
    pub fn new(provider: Arc<dyn CryptoProvider>, iterations: u32) -> Self {
        EncryptionEngine {
            kdf: KeyDerivationService::new(provider.clone()),
            provider,
            iterations,
        }
    }

    /// Configured KDF work factor
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn kdf(&self) -> &KeyDerivationService {
        &self.kdf
    }

    /// Seal `plaintext` under a key derived from `passphrase` and a fresh salt.
    ///
    /// Ciphertext length is plaintext length plus the tag; the plaintext
    /// length is not hidden.
    pub fn seal(&self, plaintext: &[u8], passphrase: &Passphrase) -> Result<EncryptedPayload> {
        let salt = self.kdf.generate_salt()?;
        let key = self.kdf.derive(passphrase, &salt, self.iterations)?;
        self.seal_with_key(plaintext, &key)
    }

    /// Seal under existing key material, using its salt and a fresh nonce
    pub fn seal_with_key(&self, plaintext: &[u8], key: &KeyMaterial) -> Result<EncryptedPayload> {
        let mut nonce = [0u8; NONCE_SIZE];
        self.provider.fill_random(&mut nonce)?;

        let ciphertext = self
            .provider
            .seal(key.key(), &nonce, PAYLOAD_AAD, plaintext)?;

        Ok(EncryptedPayload {
            ciphertext,
            salt: key.salt().to_vec(),
            nonce: nonce.to_vec(),
        })
    }

    /// Open a payload with the engine's configured work factor.
    ///
    /// Fails closed: a wrong passphrase, corrupted ciphertext or tampering
    /// all yield `Error::AuthenticationFailure`, never partial plaintext.
    pub fn open(&self, payload: &EncryptedPayload, passphrase: &Passphrase) -> Result<Vec<u8>> {
        self.open_with_iterations(payload, passphrase, self.iterations)
    }

    /// Open a payload sealed under a specific work factor
    pub fn open_with_iterations(
        &self,
        payload: &EncryptedPayload,
        passphrase: &Passphrase,
        iterations: u32,
    ) -> Result<Vec<u8>> {
        payload.validate()?;
        let key = self.kdf.derive(passphrase, &payload.salt, iterations)?;
        self.open_with_key(payload, &key)
    }

    /// Open with existing key material; the payload salt must match the key's
    pub fn open_with_key(&self, payload: &EncryptedPayload, key: &KeyMaterial) -> Result<Vec<u8>> {
        payload.validate()?;
        if payload.salt.as_slice() != key.salt().as_slice() {
            return Err(Error::MalformedInput(
                "Payload salt does not match key material".to_string(),
            ));
        }

        let nonce = payload.nonce_array()?;
        let plaintext = self
            .provider
            .open(key.key(), &nonce, PAYLOAD_AAD, &payload.ciphertext)
            .map_err(|e| {
                if e.is_authentication_failure() {
                    debug!("Payload failed authentication");
                }
                e
            })?;

        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{RingProvider, SeededProvider, SALT_SIZE, TAG_SIZE};
    use proptest::prelude::*;
    use std::collections::HashSet;

    const TEST_ITERATIONS: u32 = 1_000;

    fn engine() -> EncryptionEngine {
        EncryptionEngine::new(Arc::new(RingProvider::new()), TEST_ITERATIONS)
    }

    #[test]
    fn test_seal_open_round_trip() {
        let engine = engine();
        let pass = Passphrase::from("correct-horse");

        let payload = engine.seal(b"hello world", &pass).unwrap();
        let opened = engine.open(&payload, &pass).unwrap();

        assert_eq!(opened, b"hello world");
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let engine = engine();
        let payload = engine
            .seal(b"hello world", &Passphrase::from("correct-horse"))
            .unwrap();

        let err = engine
            .open(&payload, &Passphrase::from("wrong-horse"))
            .unwrap_err();
        assert!(err.is_authentication_failure());
    }

    #[test]
    fn test_ciphertext_overhead_is_tag() {
        let engine = engine();
        let pass = Passphrase::from("pass");
        for len in [0usize, 1, 15, 16, 17, 1000] {
            let payload = engine.seal(&vec![0x42; len], &pass).unwrap();
            assert_eq!(payload.ciphertext.len(), len + TAG_SIZE);
            assert_eq!(payload.salt.len(), SALT_SIZE);
            assert_eq!(payload.nonce.len(), NONCE_SIZE);
        }
    }

    #[test]
    fn test_seals_never_repeat_salt_and_nonce() {
        let engine = engine();
        let pass = Passphrase::from("pass");
        let mut seen = HashSet::new();

        for _ in 0..16 {
            let payload = engine.seal(b"same plaintext", &pass).unwrap();
            assert!(seen.insert((payload.salt.clone(), payload.nonce.clone())));
        }
    }

    #[test]
    fn test_seal_with_key_shares_salt_but_not_nonce() {
        let engine = engine();
        let pass = Passphrase::from("pass");
        let salt = engine.kdf().generate_salt().unwrap();
        let key = engine.kdf().derive(&pass, &salt, TEST_ITERATIONS).unwrap();

        let a = engine.seal_with_key(b"doc", &key).unwrap();
        let b = engine.seal_with_key(b"doc", &key).unwrap();

        assert_eq!(a.salt, b.salt);
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);

        // Either path opens it
        assert_eq!(engine.open(&a, &pass).unwrap(), b"doc");
        assert_eq!(engine.open_with_key(&b, &key).unwrap(), b"doc");
    }

    #[test]
    fn test_tampering_detected() {
        let engine = engine();
        let pass = Passphrase::from("pass");
        let payload = engine.seal(b"Secret data", &pass).unwrap();

        let mut flipped = payload.clone();
        flipped.ciphertext[0] ^= 0xFF;
        assert!(engine.open(&flipped, &pass).unwrap_err().is_authentication_failure());

        let mut tag_flipped = payload.clone();
        let last = tag_flipped.ciphertext.len() - 1;
        tag_flipped.ciphertext[last] ^= 0x01;
        assert!(engine
            .open(&tag_flipped, &pass)
            .unwrap_err()
            .is_authentication_failure());

        let mut nonce_flipped = payload;
        nonce_flipped.nonce[0] ^= 0x01;
        assert!(engine
            .open(&nonce_flipped, &pass)
            .unwrap_err()
            .is_authentication_failure());
    }

    #[test]
    fn test_wrong_iterations_fails() {
        let engine = engine();
        let pass = Passphrase::from("pass");
        let payload = engine.seal(b"data", &pass).unwrap();

        let err = engine
            .open_with_iterations(&payload, &pass, TEST_ITERATIONS * 2)
            .unwrap_err();
        assert!(err.is_authentication_failure());
    }

    #[test]
    fn test_open_with_mismatched_key_salt_is_malformed() {
        let engine = engine();
        let pass = Passphrase::from("pass");
        let payload = engine.seal(b"data", &pass).unwrap();
        let other = engine
            .kdf()
            .derive(&pass, &[0u8; SALT_SIZE], TEST_ITERATIONS)
            .unwrap();

        let err = engine.open_with_key(&payload, &other).unwrap_err();
        assert!(matches!(err, Error::MalformedInput(_)));
    }

    #[test]
    fn test_seeded_engines_are_reproducible() {
        let a = EncryptionEngine::new(Arc::new(SeededProvider::new(99)), TEST_ITERATIONS);
        let b = EncryptionEngine::new(Arc::new(SeededProvider::new(99)), TEST_ITERATIONS);
        let pass = Passphrase::from("pass");

        assert_eq!(a.seal(b"x", &pass).unwrap(), b.seal(b"x", &pass).unwrap());
    }

    #[test]
    fn test_payload_survives_json_transport() {
        let engine = engine();
        let pass = Passphrase::from("pass");
        let payload = engine.seal(b"over the wire", &pass).unwrap();

        let restored = EncryptedPayload::from_json(&payload.to_json().unwrap()).unwrap();
        assert_eq!(engine.open(&restored, &pass).unwrap(), b"over the wire");
    }

    #[test]
    fn test_empty_and_large_plaintext() {
        let engine = engine();
        let pass = Passphrase::from("pass");

        let empty = engine.seal(b"", &pass).unwrap();
        assert!(engine.open(&empty, &pass).unwrap().is_empty());

        let large = vec![0x42u8; 1024 * 1024];
        let payload = engine.seal(&large, &pass).unwrap();
        assert_eq!(engine.open(&payload, &pass).unwrap(), large);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 32,
            rng_seed: proptest::test_runner::RngSeed::Fixed(0),
            max_shrink_iters: 0,
            failure_persistence: None,
            .. ProptestConfig::default()
        })]

        #[test]
        fn test_seal_open_round_trips_any_plaintext(
            plaintext in proptest::collection::vec(any::<u8>(), 0..=2048),
            passphrase in "[ -~]{1,32}",
        ) {
            let engine = engine();
            let pass = Passphrase::from(passphrase);
            let payload = engine.seal(&plaintext, &pass).unwrap();

            prop_assert_eq!(payload.ciphertext.len(), plaintext.len() + TAG_SIZE);
            prop_assert_eq!(payload.salt.len(), SALT_SIZE);
            prop_assert_eq!(engine.open(&payload, &pass).unwrap(), plaintext);
        }

        #[test]
        fn test_other_passphrase_never_opens(
            plaintext in proptest::collection::vec(any::<u8>(), 0..=256),
            right in "[ -~]{1,24}",
            wrong in "[ -~]{1,24}",
        ) {
            prop_assume!(right != wrong);
            let engine = engine();
            let payload = engine.seal(&plaintext, &Passphrase::from(right)).unwrap();

            let err = engine.open(&payload, &Passphrase::from(wrong)).unwrap_err();
            prop_assert!(err.is_authentication_failure());
        }
    }
}
