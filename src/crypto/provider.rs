//! Injected cryptographic capability
//!
//! Everything that touches randomness, key stretching or the AEAD goes
//! through [`CryptoProvider`], so the engine can run against the system
//! RNG in production and a seeded RNG in tests.

use crate::crypto::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use std::num::NonZeroU32;

/// Primitive operations the encryption core depends on
pub trait CryptoProvider: Send + Sync {
    /// Fill `dest` with random bytes
    fn fill_random(&self, dest: &mut [u8]) -> Result<()>;

    /// Stretch a passphrase into a key
    fn derive_key(
        &self,
        passphrase: &[u8],
        salt: &[u8],
        iterations: NonZeroU32,
        out: &mut [u8; KEY_SIZE],
    );

    /// Authenticated-encrypt `plaintext`, returning ciphertext with the tag appended
    fn seal(
        &self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>>;

    /// Authenticated-decrypt; any tag mismatch is `Error::AuthenticationFailure`
    fn open(
        &self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>>;
}

/// Production provider backed by `ring`
pub struct RingProvider {
    rng: SystemRandom,
}

impl RingProvider {
    pub fn new() -> Self {
        RingProvider {
            rng: SystemRandom::new(),
        }
    }
}

impl Default for RingProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoProvider for RingProvider {
    fn fill_random(&self, dest: &mut [u8]) -> Result<()> {
        self.rng.fill(dest).map_err(|_| Error::RandomUnavailable)
    }

    fn derive_key(
        &self,
        passphrase: &[u8],
        salt: &[u8],
        iterations: NonZeroU32,
        out: &mut [u8; KEY_SIZE],
    ) {
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            salt,
            passphrase,
            out,
        );
    }

    fn seal(
        &self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        aead_seal(key, nonce, aad, plaintext)
    }

    fn open(
        &self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        aead_open(key, nonce, aad, ciphertext)
    }
}

/// Deterministic provider for tests and reproducible runs.
///
/// Key derivation and the AEAD are the real `ring` primitives; only the
/// random source is replaced by a seeded `StdRng`.
pub struct SeededProvider {
    rng: Mutex<StdRng>,
}

impl SeededProvider {
    pub fn new(seed: u64) -> Self {
        SeededProvider {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl CryptoProvider for SeededProvider {
    fn fill_random(&self, dest: &mut [u8]) -> Result<()> {
        self.rng.lock().fill_bytes(dest);
        Ok(())
    }

    fn derive_key(
        &self,
        passphrase: &[u8],
        salt: &[u8],
        iterations: NonZeroU32,
        out: &mut [u8; KEY_SIZE],
    ) {
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            salt,
            passphrase,
            out,
        );
    }

    fn seal(
        &self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        aead_seal(key, nonce, aad, plaintext)
    }

    fn open(
        &self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        aead_open(key, nonce, aad, ciphertext)
    }
}

fn aead_seal(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let unbound_key = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| Error::Encryption("Failed to create encryption key".to_string()))?;
    let sealing_key = LessSafeKey::new(unbound_key);

    // Prepare buffer: plaintext + space for tag
    let mut in_out = Vec::with_capacity(plaintext.len() + TAG_SIZE);
    in_out.extend_from_slice(plaintext);

    sealing_key
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(*nonce),
            Aad::from(aad),
            &mut in_out,
        )
        .map_err(|_| Error::Encryption("Encryption failed".to_string()))?;

    Ok(in_out)
}

fn aead_open(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_SIZE {
        return Err(Error::MalformedInput("Ciphertext too short".to_string()));
    }

    let unbound_key = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| Error::Encryption("Failed to create decryption key".to_string()))?;
    let opening_key = LessSafeKey::new(unbound_key);

    let mut in_out = ciphertext.to_vec();
    let plaintext = opening_key
        .open_in_place(
            Nonce::assume_unique_for_key(*nonce),
            Aad::from(aad),
            &mut in_out,
        )
        .map_err(|_| Error::AuthenticationFailure)?;

    Ok(plaintext.to_vec())
}

/// Providers for exercising code that runs concurrently with crypto calls
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum ParkOn {
        Open,
        Derive,
    }

    struct Park {
        on: ParkOn,
        at: usize,
        reached: oneshot::Sender<()>,
        release: mpsc::Receiver<()>,
    }

    /// Delegates to another provider, holding one chosen call until released
    pub(crate) struct ParkingProvider {
        inner: Arc<dyn CryptoProvider>,
        opens: AtomicUsize,
        derives: AtomicUsize,
        park: Mutex<Option<Park>>,
    }

    /// Handle on a call held by [`ParkingProvider`]
    pub(crate) struct Parked {
        reached: Option<oneshot::Receiver<()>>,
        release: mpsc::Sender<()>,
    }

    impl Parked {
        /// Wait until the held call has been entered
        pub(crate) async fn reached(&mut self) {
            let reached = self.reached.take().expect("reached twice");
            tokio::time::timeout(Duration::from_secs(10), reached)
                .await
                .expect("held call was never made")
                .expect("provider dropped before the held call");
        }

        /// Let the held call continue
        pub(crate) fn release(self) {
            let _ = self.release.send(());
        }
    }

    impl ParkingProvider {
        pub(crate) fn new(inner: Arc<dyn CryptoProvider>) -> Self {
            ParkingProvider {
                inner,
                opens: AtomicUsize::new(0),
                derives: AtomicUsize::new(0),
                park: Mutex::new(None),
            }
        }

        /// Hold the `skip`-th `open` made from now on (0 is the next one)
        pub(crate) fn park_open(&self, skip: usize) -> Parked {
            self.arm(ParkOn::Open, self.opens.load(Ordering::SeqCst) + skip)
        }

        /// Hold the `skip`-th `derive_key` made from now on
        pub(crate) fn park_derive(&self, skip: usize) -> Parked {
            self.arm(ParkOn::Derive, self.derives.load(Ordering::SeqCst) + skip)
        }

        fn arm(&self, on: ParkOn, at: usize) -> Parked {
            let (reached_tx, reached_rx) = oneshot::channel();
            let (release_tx, release_rx) = mpsc::channel();
            *self.park.lock() = Some(Park {
                on,
                at,
                reached: reached_tx,
                release: release_rx,
            });
            Parked {
                reached: Some(reached_rx),
                release: release_tx,
            }
        }

        /// Blocks the calling thread if this is the held call
        fn checkpoint(&self, on: ParkOn, call: usize) {
            let park = {
                let mut slot = self.park.lock();
                match slot.as_ref() {
                    Some(park) if park.on == on && park.at == call => slot.take(),
                    _ => None,
                }
            };
            if let Some(park) = park {
                let _ = park.reached.send(());
                // A dropped handle releases too
                let _ = park.release.recv();
            }
        }
    }

    impl CryptoProvider for ParkingProvider {
        fn fill_random(&self, dest: &mut [u8]) -> Result<()> {
            self.inner.fill_random(dest)
        }

        fn derive_key(
            &self,
            passphrase: &[u8],
            salt: &[u8],
            iterations: NonZeroU32,
            out: &mut [u8; KEY_SIZE],
        ) {
            let call = self.derives.fetch_add(1, Ordering::SeqCst);
            self.checkpoint(ParkOn::Derive, call);
            self.inner.derive_key(passphrase, salt, iterations, out)
        }

        fn seal(
            &self,
            key: &[u8; KEY_SIZE],
            nonce: &[u8; NONCE_SIZE],
            aad: &[u8],
            plaintext: &[u8],
        ) -> Result<Vec<u8>> {
            self.inner.seal(key, nonce, aad, plaintext)
        }

        fn open(
            &self,
            key: &[u8; KEY_SIZE],
            nonce: &[u8; NONCE_SIZE],
            aad: &[u8],
            ciphertext: &[u8],
        ) -> Result<Vec<u8>> {
            let call = self.opens.fetch_add(1, Ordering::SeqCst);
            self.checkpoint(ParkOn::Open, call);
            self.inner.open(key, nonce, aad, ciphertext)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iterations() -> NonZeroU32 {
        NonZeroU32::new(1_000).unwrap()
    }

    #[test]
    fn test_seeded_provider_is_reproducible() {
        let a = SeededProvider::new(7);
        let b = SeededProvider::new(7);

        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        a.fill_random(&mut x).unwrap();
        b.fill_random(&mut y).unwrap();
        assert_eq!(x, y);

        // The stream advances
        let mut z = [0u8; 32];
        a.fill_random(&mut z).unwrap();
        assert_ne!(x, z);
    }

    #[test]
    fn test_providers_agree_on_kdf() {
        let ring = RingProvider::new();
        let seeded = SeededProvider::new(1);

        let mut k1 = [0u8; KEY_SIZE];
        let mut k2 = [0u8; KEY_SIZE];
        ring.derive_key(b"passphrase", b"some-salt-value", iterations(), &mut k1);
        seeded.derive_key(b"passphrase", b"some-salt-value", iterations(), &mut k2);
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_seal_open_round_trip() {
        let provider = RingProvider::new();
        let key = [9u8; KEY_SIZE];
        let nonce = [3u8; NONCE_SIZE];

        let sealed = provider.seal(&key, &nonce, b"aad", b"plaintext").unwrap();
        assert_eq!(sealed.len(), b"plaintext".len() + TAG_SIZE);

        let opened = provider.open(&key, &nonce, b"aad", &sealed).unwrap();
        assert_eq!(opened, b"plaintext");
    }

    #[test]
    fn test_open_with_wrong_key_is_authentication_failure() {
        let provider = RingProvider::new();
        let nonce = [0u8; NONCE_SIZE];
        let sealed = provider.seal(&[1u8; KEY_SIZE], &nonce, b"", b"data").unwrap();

        let err = provider
            .open(&[2u8; KEY_SIZE], &nonce, b"", &sealed)
            .unwrap_err();
        assert!(err.is_authentication_failure());
    }

    #[test]
    fn test_open_truncated_ciphertext_is_malformed() {
        let provider = RingProvider::new();
        let err = provider
            .open(&[1u8; KEY_SIZE], &[0u8; NONCE_SIZE], b"", &[0u8; 4])
            .unwrap_err();
        assert!(matches!(err, Error::MalformedInput(_)));
    }

    #[tokio::test]
    async fn test_parking_provider_holds_the_chosen_call() {
        use super::test_support::ParkingProvider;
        use std::sync::Arc;

        let provider = Arc::new(ParkingProvider::new(Arc::new(RingProvider::new())));
        let key = [4u8; KEY_SIZE];
        let nonce = [0u8; NONCE_SIZE];
        let sealed = provider.seal(&key, &nonce, b"", b"held").unwrap();

        let mut parked = provider.park_open(1);
        let opener = Arc::clone(&provider);
        let calls = tokio::task::spawn_blocking(move || {
            let first = opener.open(&key, &nonce, b"", &sealed).unwrap();
            let second = opener.open(&key, &nonce, b"", &sealed).unwrap();
            (first, second)
        });

        parked.reached().await;
        assert!(!calls.is_finished());
        parked.release();

        let (first, second) = calls.await.unwrap();
        assert_eq!(first, b"held");
        assert_eq!(second, b"held");
    }
}
