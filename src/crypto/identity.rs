//! Passphrase-derived pseudonymous identity
//!
//! SHA-256 over a fixed application-wide salt followed by the passphrase.
//! The server groups records by this value. It is not a secret: anyone who
//! guesses the passphrase can recompute it offline, because the salt is
//! public and shared by every user.

use crate::crypto::Passphrase;
use ring::digest::{Context, SHA256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Application-wide identity salt
pub const DEFAULT_IDENTITY_SALT: &str = "zkdocs-identity-v1";

/// Hex-encoded identity digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityHash(String);

impl IdentityHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives [`IdentityHash`] values
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    salt: Vec<u8>,
}

impl IdentityResolver {
    pub fn new(salt: impl AsRef<[u8]>) -> Self {
        IdentityResolver {
            salt: salt.as_ref().to_vec(),
        }
    }

    /// Hash `(salt || passphrase)`
    pub fn identify(&self, passphrase: &Passphrase) -> IdentityHash {
        let mut ctx = Context::new(&SHA256);
        ctx.update(&self.salt);
        ctx.update(passphrase.as_bytes());
        IdentityHash(hex::encode(ctx.finish()))
    }
}

impl Default for IdentityResolver {
    fn default() -> Self {
        IdentityResolver::new(DEFAULT_IDENTITY_SALT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_identify_deterministic() {
        let resolver = IdentityResolver::default();
        let a = resolver.identify(&Passphrase::from("correct-horse"));
        let b = resolver.identify(&Passphrase::from("correct-horse"));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_distinct_passphrases_distinct_hashes() {
        let resolver = IdentityResolver::default();
        let a = resolver.identify(&Passphrase::from("correct-horse"));
        let b = resolver.identify(&Passphrase::from("wrong-horse"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_salt_changes_hash() {
        let pass = Passphrase::from("correct-horse");
        let a = IdentityResolver::new("app-a").identify(&pass);
        let b = IdentityResolver::new("app-b").identify(&pass);
        assert_ne!(a, b);
    }

    #[test]
    fn test_known_vector() {
        // SHA-256("abc") with an empty salt
        let hash = IdentityResolver::new("").identify(&Passphrase::from("abc"));
        assert_eq!(
            hash.as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hash_does_not_contain_passphrase() {
        let hash = IdentityResolver::default().identify(&Passphrase::from("deadbeef"));
        assert!(!hash.to_string().contains("deadbeef"));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            rng_seed: proptest::test_runner::RngSeed::Fixed(0),
            max_shrink_iters: 0,
            failure_persistence: None,
            .. ProptestConfig::default()
        })]

        #[test]
        fn test_identify_is_stable_and_separates_passphrases(a in ".{0,48}", b in ".{0,48}") {
            let resolver = IdentityResolver::default();
            let first = resolver.identify(&Passphrase::from(a.as_str()));

            prop_assert_eq!(&first, &resolver.identify(&Passphrase::from(a.as_str())));
            prop_assert_eq!(first.as_str().len(), 64);
            if a != b {
                prop_assert_ne!(first, resolver.identify(&Passphrase::from(b)));
            }
        }
    }
}
