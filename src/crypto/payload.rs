//! Self-contained sealed payload
//!
//! `{ciphertext, salt, nonce}` travels and is stored as one record. Each
//! field is standard base64 text on the wire.

use crate::crypto::{NONCE_SIZE, SALT_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Ciphertext plus everything except the passphrase needed to open it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Ciphertext with appended authentication tag
    #[serde(with = "base64_serde")]
    pub ciphertext: Vec<u8>,
    /// KDF salt
    #[serde(with = "base64_serde")]
    pub salt: Vec<u8>,
    /// AEAD nonce (unique per encryption)
    #[serde(with = "base64_serde")]
    pub nonce: Vec<u8>,
}

impl EncryptedPayload {
    /// Build from the three base64-encoded fields
    pub fn from_base64(ciphertext: &str, salt: &str, nonce: &str) -> Result<Self> {
        let payload = EncryptedPayload {
            ciphertext: STANDARD.decode(ciphertext)?,
            salt: STANDARD.decode(salt)?,
            nonce: STANDARD.decode(nonce)?,
        };
        payload.validate()?;
        Ok(payload)
    }

    /// Base64 text of `(ciphertext, salt, nonce)`
    pub fn to_base64(&self) -> (String, String, String) {
        (
            STANDARD.encode(&self.ciphertext),
            STANDARD.encode(&self.salt),
            STANDARD.encode(&self.nonce),
        )
    }

    /// Check field lengths without touching any key
    pub fn validate(&self) -> Result<()> {
        if self.salt.len() != SALT_SIZE {
            return Err(Error::MalformedInput(format!(
                "Invalid salt length: {}",
                self.salt.len()
            )));
        }
        if self.nonce.len() != NONCE_SIZE {
            return Err(Error::MalformedInput(format!(
                "Invalid nonce length: {}",
                self.nonce.len()
            )));
        }
        if self.ciphertext.len() < TAG_SIZE {
            return Err(Error::MalformedInput("Ciphertext too short".to_string()));
        }
        Ok(())
    }

    pub(crate) fn nonce_array(&self) -> Result<[u8; NONCE_SIZE]> {
        self.nonce.as_slice().try_into().map_err(|_| {
            Error::MalformedInput(format!("Invalid nonce length: {}", self.nonce.len()))
        })
    }

    /// Length of the plaintext this payload decrypts to
    pub fn plaintext_len(&self) -> usize {
        self.ciphertext.len().saturating_sub(TAG_SIZE)
    }

    /// Serialize as JSON for transport
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from JSON and validate field lengths
    pub fn from_json(json: &str) -> Result<Self> {
        let payload: EncryptedPayload = serde_json::from_str(json)
            .map_err(|e| Error::MalformedInput(format!("Invalid payload: {}", e)))?;
        payload.validate()?;
        Ok(payload)
    }
}

pub(crate) mod base64_serde {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EncryptedPayload {
        EncryptedPayload {
            ciphertext: vec![0xAB; 27],
            salt: vec![1; SALT_SIZE],
            nonce: vec![2; NONCE_SIZE],
        }
    }

    #[test]
    fn test_json_fields_are_standard_base64() {
        let json = sample().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["nonce"], "AgICAgICAgICAgIC");
        assert_eq!(
            value["salt"].as_str().unwrap(),
            STANDARD.encode([1u8; SALT_SIZE])
        );

        let restored = EncryptedPayload::from_json(&json).unwrap();
        assert_eq!(restored, sample());
    }

    #[test]
    fn test_from_base64_matches_to_base64() {
        let (ct, salt, nonce) = sample().to_base64();
        let restored = EncryptedPayload::from_base64(&ct, &salt, &nonce).unwrap();
        assert_eq!(restored, sample());
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let err = EncryptedPayload::from_base64("not base64!!", "AAAA", "AAAA").unwrap_err();
        assert!(matches!(err, Error::MalformedInput(_)));
    }

    #[test]
    fn test_validate_lengths() {
        let mut p = sample();
        p.salt.pop();
        assert!(p.validate().is_err());

        let mut p = sample();
        p.nonce.push(0);
        assert!(p.validate().is_err());

        let mut p = sample();
        p.ciphertext.truncate(TAG_SIZE - 1);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_plaintext_len() {
        assert_eq!(sample().plaintext_len(), 27 - TAG_SIZE);
    }
}
