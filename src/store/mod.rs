//! Document and key-version persistence
//!
//! The store only ever sees ciphertext, salts, nonces and identity hashes.
//! Rotation needs one atomic multi-record write, expressed here as
//! [`DocumentStore::commit_rotation`] guarded by an [`Epoch`] compare-and-swap.

mod memory;
mod sled_store;
mod types;

pub use memory::MemoryStore;
pub use sled_store::SledStore;
pub use types::{
    CommitOutcome, DocumentId, EncryptedDocument, Epoch, KeyVersion, KeyVersionStatus,
    RotatedDocument, RotationCommit, UserId, VersionId,
};

use crate::error::Result;
use crate::rotation::StagedRotation;
use chrono::{DateTime, Utc};

/// Persistence collaborator for the encryption core
pub trait DocumentStore: Send + Sync {
    /// Current compare-and-swap token, `None` before the first key version
    fn epoch(&self, user: &UserId) -> Result<Option<Epoch>>;

    /// The user's active key version
    fn active_key_version(&self, user: &UserId) -> Result<Option<KeyVersion>>;

    /// Look up any (active or retired) key version
    fn key_version(&self, user: &UserId, version_id: VersionId) -> Result<Option<KeyVersion>>;

    /// All key versions, oldest first
    fn key_versions(&self, user: &UserId) -> Result<Vec<KeyVersion>>;

    /// Create the user's first key version. Conflicts if one is already active.
    fn create_key_version(&self, user: &UserId, version: &KeyVersion) -> Result<CommitOutcome>;

    /// Documents sealed under `version_id`, ordered by document id
    fn list_documents(&self, user: &UserId, version_id: VersionId)
        -> Result<Vec<EncryptedDocument>>;

    fn get_document(
        &self,
        user: &UserId,
        document_id: &DocumentId,
    ) -> Result<Option<EncryptedDocument>>;

    /// Insert or replace a document. Conflicts unless it is sealed under the
    /// active version.
    fn put_document(&self, user: &UserId, document: &EncryptedDocument) -> Result<CommitOutcome>;

    /// Atomically publish a rotation: create and activate the new version,
    /// swap every document, retire the old version. All or nothing.
    fn commit_rotation(&self, user: &UserId, commit: &RotationCommit) -> Result<CommitOutcome>;

    /// Delete retired versions retired before `cutoff` that no document
    /// still references
    fn purge_retired(&self, user: &UserId, cutoff: DateTime<Utc>) -> Result<Vec<VersionId>>;

    /// Re-encryption work kept from the user's last uncommitted rotation
    fn staged_rotation(&self, user: &UserId) -> Result<Option<StagedRotation>>;

    /// Replace the user's staged rotation
    fn stage_rotation(&self, user: &UserId, staged: &StagedRotation) -> Result<()>;

    /// Returns whether anything was staged
    fn discard_staged_rotation(&self, user: &UserId) -> Result<bool>;
}

/// Precondition checks shared by the store implementations.
///
/// Returns the conflict reason, if any.
pub(crate) fn check_rotation<E, F>(
    commit: &RotationCommit,
    current: Option<Epoch>,
    mut current_document: F,
) -> std::result::Result<Option<String>, E>
where
    F: FnMut(&DocumentId) -> std::result::Result<Option<EncryptedDocument>, E>,
{
    let current = match current {
        Some(epoch) => epoch,
        None => return Ok(Some("no active key version".to_string())),
    };

    if current != commit.expected {
        return Ok(Some(format!(
            "epoch moved from {:?} to {:?}",
            commit.expected, current
        )));
    }

    if commit.new_version.version_id <= commit.expected.version_id {
        return Ok(Some(format!(
            "new version {} does not follow {}",
            commit.new_version.version_id, commit.expected.version_id
        )));
    }

    if !commit.new_version.is_active() {
        return Ok(Some("new version must be active".to_string()));
    }

    for rotated in &commit.documents {
        let id = &rotated.document.document_id;
        if rotated.document.key_version_id != commit.new_version.version_id {
            return Ok(Some(format!("document {} staged under wrong version", id)));
        }

        match current_document(id)? {
            None => return Ok(Some(format!("document {} no longer exists", id))),
            Some(existing) if existing.key_version_id != commit.expected.version_id => {
                return Ok(Some(format!(
                    "document {} is under version {}",
                    id, existing.key_version_id
                )))
            }
            Some(existing) if existing.payload.nonce != rotated.previous_nonce => {
                return Ok(Some(format!("document {} changed since it was read", id)))
            }
            Some(_) => {}
        }
    }

    Ok(None)
}
