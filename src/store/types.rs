//! Persisted records

use crate::crypto::{EncryptedPayload, IdentityHash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic per-user key version number
pub type VersionId = u64;

/// Opaque user identity, established by the authentication layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        UserId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Application document identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        DocumentId(id.into())
    }

    /// Random identifier for a new document
    pub fn generate() -> Self {
        DocumentId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a key version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyVersionStatus {
    /// The one version new documents are sealed under
    Active,
    /// Superseded by a rotation; kept for the grace period
    Retired { retired_at: DateTime<Utc> },
}

/// One passphrase epoch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVersion {
    /// Monotonic version number
    pub version_id: VersionId,
    /// Salt documents under this version are sealed with
    #[serde(with = "crate::crypto::base64_serde")]
    pub salt: Vec<u8>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Identity hash of the passphrase for this epoch
    pub identity_hash: IdentityHash,
    /// PBKDF2 work factor keys for this version were derived with
    pub kdf_iterations: u32,
    /// Active or retired
    pub status: KeyVersionStatus,
}

impl KeyVersion {
    pub fn is_active(&self) -> bool {
        matches!(self.status, KeyVersionStatus::Active)
    }

    pub fn retired_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            KeyVersionStatus::Active => None,
            KeyVersionStatus::Retired { retired_at } => Some(retired_at),
        }
    }
}

/// A user's document as the server sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedDocument {
    pub document_id: DocumentId,
    /// Key version the payload was sealed under
    pub key_version_id: VersionId,
    pub payload: EncryptedPayload,
    pub updated_at: DateTime<Utc>,
}

/// Compare-and-swap token for a user's key state.
///
/// `write_seq` moves on every document write, so an unchanged epoch means
/// nothing was written since it was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epoch {
    pub version_id: VersionId,
    pub write_seq: u64,
}

/// A re-encrypted document together with the nonce it replaces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotatedDocument {
    pub document: EncryptedDocument,
    pub previous_nonce: Vec<u8>,
}

/// Everything a rotation publishes in one atomic step
#[derive(Debug, Clone)]
pub struct RotationCommit {
    /// Epoch observed before re-encryption started
    pub expected: Epoch,
    /// Version to create and activate
    pub new_version: KeyVersion,
    /// Timestamp recorded on the retired version
    pub retired_at: DateTime<Utc>,
    /// Every document of the old version, re-sealed
    pub documents: Vec<RotatedDocument>,
}

/// Result of a conditional write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// Preconditions no longer hold; nothing was written
    Conflict(String),
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_version_status() {
        let mut version = KeyVersion {
            version_id: 1,
            salt: vec![0; 32],
            created_at: Utc::now(),
            identity_hash: crate::crypto::IdentityResolver::default()
                .identify(&crate::crypto::Passphrase::from("p")),
            kdf_iterations: 100_000,
            status: KeyVersionStatus::Active,
        };
        assert!(version.is_active());
        assert_eq!(version.retired_at(), None);

        let at = Utc::now();
        version.status = KeyVersionStatus::Retired { retired_at: at };
        assert!(!version.is_active());
        assert_eq!(version.retired_at(), Some(at));
    }

    #[test]
    fn test_key_version_json_shape() {
        let version = KeyVersion {
            version_id: 3,
            salt: vec![0xFF; 32],
            created_at: Utc::now(),
            identity_hash: crate::crypto::IdentityResolver::default()
                .identify(&crate::crypto::Passphrase::from("p")),
            kdf_iterations: 150_000,
            status: KeyVersionStatus::Active,
        };
        let value = serde_json::to_value(&version).unwrap();
        assert_eq!(value["status"], "active");
        assert!(value["salt"].as_str().unwrap().starts_with("////"));

        let restored: KeyVersion = serde_json::from_value(value).unwrap();
        assert_eq!(restored, version);
    }

    #[test]
    fn test_generated_document_ids_are_unique() {
        assert_ne!(DocumentId::generate(), DocumentId::generate());
    }
}
