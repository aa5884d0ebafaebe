//! Re-encrypted payloads awaiting commit
//!
//! A rotation that fails with partial re-encryption keeps what it already
//! produced, so a retry only has to redo the documents that failed or
//! changed since. Staging is persisted through the document store: it is
//! ciphertext under the new key, and it survives the process that made it.

use crate::crypto::IdentityHash;
use crate::error::Result;
use crate::store::{DocumentId, DocumentStore, EncryptedDocument, KeyVersion, UserId, VersionId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// A document sealed under the staged version, with the nonce it replaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedDocument {
    pub document: EncryptedDocument,
    pub source_nonce: Vec<u8>,
}

/// One user's uncommitted rotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedRotation {
    source_version: VersionId,
    new_version: KeyVersion,
    documents: BTreeMap<DocumentId, StagedDocument>,
}

impl StagedRotation {
    pub fn new(source_version: VersionId, new_version: KeyVersion) -> Self {
        StagedRotation {
            source_version,
            new_version,
            documents: BTreeMap::new(),
        }
    }

    /// The not-yet-committed key version
    pub fn new_version(&self) -> &KeyVersion {
        &self.new_version
    }

    /// Whether a retry from `source_version` to a passphrase hashing to
    /// `new_identity` may reuse this staging
    pub fn matches(&self, source_version: VersionId, new_identity: &IdentityHash) -> bool {
        self.source_version == source_version && &self.new_version.identity_hash == new_identity
    }

    /// The staged replacement for `current`, if `current` has not been
    /// rewritten since it was staged
    pub fn reusable(&self, current: &EncryptedDocument) -> Option<&StagedDocument> {
        self.documents
            .get(&current.document_id)
            .filter(|staged| staged.source_nonce == current.payload.nonce)
    }

    pub fn insert(&mut self, document: EncryptedDocument, source_nonce: Vec<u8>) {
        self.documents.insert(
            document.document_id.clone(),
            StagedDocument {
                document,
                source_nonce,
            },
        );
    }

    /// Drop staged documents that are no longer part of the rotation
    pub fn retain_only(&mut self, ids: &HashSet<DocumentId>) {
        self.documents.retain(|id, _| ids.contains(id));
    }

    pub fn get(&self, id: &DocumentId) -> Option<&StagedDocument> {
        self.documents.get(id)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Per-user staging, shared by every rotation the coordinator runs
pub struct StagingArea {
    store: Arc<dyn DocumentStore>,
}

impl StagingArea {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        StagingArea { store }
    }

    pub fn get(&self, user: &UserId) -> Result<Option<StagedRotation>> {
        self.store.staged_rotation(user)
    }

    /// Persist the user's staging; an empty staging has nothing to resume
    pub fn store(&self, user: &UserId, staged: &StagedRotation) -> Result<()> {
        if staged.is_empty() {
            self.discard(user)?;
            return Ok(());
        }
        self.store.stage_rotation(user, staged)?;
        debug!("Staged {} re-encrypted documents for {}", staged.len(), user);
        Ok(())
    }

    /// Discard the user's staging; returns whether there was any
    pub fn discard(&self, user: &UserId) -> Result<bool> {
        self.store.discard_staged_rotation(user)
    }

    /// Number of documents staged for the user
    pub fn staged_documents(&self, user: &UserId) -> Result<usize> {
        Ok(self.get(user)?.map(|s| s.len()).unwrap_or(0))
    }
}
