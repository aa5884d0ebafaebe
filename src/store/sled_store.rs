//! Sled-based document store
//!
//! Three trees hold key versions, per-user epochs and documents; a fourth
//! keeps staged rotations. Records are bincode-encoded; document payloads are
//! already ciphertext. Rotation commits run as one multi-tree sled
//! transaction.

use crate::error::{Error, Result};
use crate::rotation::StagedRotation;
use crate::store::{
    check_rotation, CommitOutcome, DocumentId, DocumentStore, EncryptedDocument, Epoch,
    KeyVersion, KeyVersionStatus, RotationCommit, UserId, VersionId,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionResult};
use sled::{Db, Transactional, Tree};
use std::path::Path;
use tracing::{debug, info};

const VERSIONS_TREE: &str = "key_versions";
const EPOCHS_TREE: &str = "epochs";
const DOCUMENTS_TREE: &str = "documents";
const STAGING_TREE: &str = "staged_rotations";

/// Durable store using sled
pub struct SledStore {
    db: Db,
    versions: Tree,
    epochs: Tree,
    documents: Tree,
    staging: Tree,
}

impl SledStore {
    /// Open or create a store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let store = Self::from_db(db)?;
        info!("Document store opened at {:?}", path.as_ref());
        Ok(store)
    }

    /// Create a temporary store (for testing)
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self> {
        Ok(SledStore {
            versions: db.open_tree(VERSIONS_TREE)?,
            epochs: db.open_tree(EPOCHS_TREE)?,
            documents: db.open_tree(DOCUMENTS_TREE)?,
            staging: db.open_tree(STAGING_TREE)?,
            db,
        })
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Length-prefixed user key, so no user id is a prefix of another
    fn user_prefix(user: &UserId) -> Vec<u8> {
        let id = user.as_str().as_bytes();
        let mut key = Vec::with_capacity(4 + id.len());
        key.extend_from_slice(&(id.len() as u32).to_be_bytes());
        key.extend_from_slice(id);
        key
    }

    fn version_key(user: &UserId, version_id: VersionId) -> Vec<u8> {
        let mut key = Self::user_prefix(user);
        key.extend_from_slice(&version_id.to_be_bytes());
        key
    }

    fn document_key(user: &UserId, document_id: &DocumentId) -> Vec<u8> {
        let mut key = Self::user_prefix(user);
        key.extend_from_slice(document_id.as_str().as_bytes());
        key
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Deserialization(e.to_string()))
}

fn abort<T>(result: Result<T>) -> std::result::Result<T, ConflictableTransactionError<Error>> {
    result.map_err(ConflictableTransactionError::Abort)
}

fn flatten<T>(result: TransactionResult<T, Error>) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(e)) => Err(e),
        Err(TransactionError::Storage(e)) => Err(Error::Database(e)),
    }
}

impl DocumentStore for SledStore {
    fn epoch(&self, user: &UserId) -> Result<Option<Epoch>> {
        match self.epochs.get(Self::user_prefix(user))? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    fn active_key_version(&self, user: &UserId) -> Result<Option<KeyVersion>> {
        match self.epoch(user)? {
            Some(epoch) => self.key_version(user, epoch.version_id),
            None => Ok(None),
        }
    }

    fn key_version(&self, user: &UserId, version_id: VersionId) -> Result<Option<KeyVersion>> {
        match self.versions.get(Self::version_key(user, version_id))? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    fn key_versions(&self, user: &UserId) -> Result<Vec<KeyVersion>> {
        let mut versions = Vec::new();
        for entry in self.versions.scan_prefix(Self::user_prefix(user)) {
            let (_, raw) = entry?;
            versions.push(decode::<KeyVersion>(&raw)?);
        }
        // Big-endian keys already sort by version id
        Ok(versions)
    }

    fn create_key_version(&self, user: &UserId, version: &KeyVersion) -> Result<CommitOutcome> {
        let epoch_key = Self::user_prefix(user);
        let version_key = Self::version_key(user, version.version_id);
        let record = encode(version)?;
        let epoch = encode(&Epoch {
            version_id: version.version_id,
            write_seq: 0,
        })?;

        let result = (&self.versions, &self.epochs).transaction(|(versions, epochs)| {
            if epochs.get(&epoch_key)?.is_some() {
                return Ok(CommitOutcome::Conflict(
                    "an active key version already exists".to_string(),
                ));
            }
            if versions.get(&version_key)?.is_some() {
                return Ok(CommitOutcome::Conflict(format!(
                    "key version {} already exists",
                    version.version_id
                )));
            }
            versions.insert(version_key.clone(), record.clone())?;
            epochs.insert(epoch_key.clone(), epoch.clone())?;
            Ok(CommitOutcome::Committed)
        });

        let outcome = flatten(result)?;
        if outcome.is_committed() {
            debug!("Created key version {} for {}", version.version_id, user);
        }
        Ok(outcome)
    }

    fn list_documents(
        &self,
        user: &UserId,
        version_id: VersionId,
    ) -> Result<Vec<EncryptedDocument>> {
        let mut documents = Vec::new();
        for entry in self.documents.scan_prefix(Self::user_prefix(user)) {
            let (_, raw) = entry?;
            let document: EncryptedDocument = decode(&raw)?;
            if document.key_version_id == version_id {
                documents.push(document);
            }
        }
        Ok(documents)
    }

    fn get_document(
        &self,
        user: &UserId,
        document_id: &DocumentId,
    ) -> Result<Option<EncryptedDocument>> {
        match self.documents.get(Self::document_key(user, document_id))? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    fn put_document(&self, user: &UserId, document: &EncryptedDocument) -> Result<CommitOutcome> {
        let epoch_key = Self::user_prefix(user);
        let document_key = Self::document_key(user, &document.document_id);
        let record = encode(document)?;

        let result = (&self.epochs, &self.documents).transaction(|(epochs, documents)| {
            let mut epoch: Epoch = match epochs.get(&epoch_key)? {
                Some(raw) => abort(decode(&raw))?,
                None => {
                    return Ok(CommitOutcome::Conflict(
                        "no active key version".to_string(),
                    ))
                }
            };
            if epoch.version_id != document.key_version_id {
                return Ok(CommitOutcome::Conflict(format!(
                    "active version is {}, document is sealed under {}",
                    epoch.version_id, document.key_version_id
                )));
            }

            epoch.write_seq += 1;
            epochs.insert(epoch_key.clone(), abort(encode(&epoch))?)?;
            documents.insert(document_key.clone(), record.clone())?;
            Ok(CommitOutcome::Committed)
        });

        flatten(result)
    }

    fn commit_rotation(&self, user: &UserId, commit: &RotationCommit) -> Result<CommitOutcome> {
        let epoch_key = Self::user_prefix(user);
        let old_key = Self::version_key(user, commit.expected.version_id);
        let new_key = Self::version_key(user, commit.new_version.version_id);
        let new_record = encode(&commit.new_version)?;
        let new_epoch = encode(&Epoch {
            version_id: commit.new_version.version_id,
            write_seq: commit.expected.write_seq + 1,
        })?;
        let mut staged = Vec::with_capacity(commit.documents.len());
        for rotated in &commit.documents {
            staged.push((
                Self::document_key(user, &rotated.document.document_id),
                encode(&rotated.document)?,
            ));
        }

        // Any document write moves write_seq, so a count taken here stays
        // valid as long as the epoch check inside the transaction passes.
        let remaining = self
            .list_documents(user, commit.expected.version_id)?
            .len();
        if remaining != commit.documents.len() {
            return Ok(CommitOutcome::Conflict(format!(
                "{} documents under version {}, commit covers {}",
                remaining,
                commit.expected.version_id,
                commit.documents.len()
            )));
        }

        let result = (&self.versions, &self.epochs, &self.documents).transaction(
            |(versions, epochs, documents)| {
                let current = match epochs.get(&epoch_key)? {
                    Some(raw) => Some(abort(decode::<Epoch>(&raw))?),
                    None => None,
                };

                let conflict = check_rotation::<ConflictableTransactionError<Error>, _>(
                    commit,
                    current,
                    |id| match documents.get(Self::document_key(user, id))? {
                        Some(raw) => Ok(Some(abort(decode::<EncryptedDocument>(&raw))?)),
                        None => Ok(None),
                    },
                )?;
                if let Some(reason) = conflict {
                    return Ok(CommitOutcome::Conflict(reason));
                }
                if versions.get(&new_key)?.is_some() {
                    return Ok(CommitOutcome::Conflict(format!(
                        "key version {} already exists",
                        commit.new_version.version_id
                    )));
                }

                let mut old: KeyVersion = match versions.get(&old_key)? {
                    Some(raw) => abort(decode(&raw))?,
                    None => {
                        return Ok(CommitOutcome::Conflict(format!(
                            "key version {} missing",
                            commit.expected.version_id
                        )))
                    }
                };
                old.status = KeyVersionStatus::Retired {
                    retired_at: commit.retired_at,
                };

                versions.insert(old_key.clone(), abort(encode(&old))?)?;
                versions.insert(new_key.clone(), new_record.clone())?;
                for (key, record) in &staged {
                    documents.insert(key.clone(), record.clone())?;
                }
                epochs.insert(epoch_key.clone(), new_epoch.clone())?;
                Ok(CommitOutcome::Committed)
            },
        );

        let outcome = flatten(result)?;
        if outcome.is_committed() {
            self.db.flush()?;
            debug!(
                "Committed rotation {} -> {} for {} ({} documents)",
                commit.expected.version_id,
                commit.new_version.version_id,
                user,
                commit.documents.len()
            );
        }
        Ok(outcome)
    }

    fn purge_retired(&self, user: &UserId, cutoff: DateTime<Utc>) -> Result<Vec<VersionId>> {
        let mut referenced = std::collections::HashSet::new();
        for entry in self.documents.scan_prefix(Self::user_prefix(user)) {
            let (_, raw) = entry?;
            let document: EncryptedDocument = decode(&raw)?;
            referenced.insert(document.key_version_id);
        }

        let mut purged = Vec::new();
        for version in self.key_versions(user)? {
            let expired = matches!(version.retired_at(), Some(at) if at < cutoff);
            if expired && !referenced.contains(&version.version_id) {
                self.versions
                    .remove(Self::version_key(user, version.version_id))?;
                purged.push(version.version_id);
            }
        }

        if !purged.is_empty() {
            debug!("Purged retired key versions {:?} for {}", purged, user);
        }
        Ok(purged)
    }

    fn staged_rotation(&self, user: &UserId) -> Result<Option<StagedRotation>> {
        match self.staging.get(Self::user_prefix(user))? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    fn stage_rotation(&self, user: &UserId, staged: &StagedRotation) -> Result<()> {
        self.staging
            .insert(Self::user_prefix(user), encode(staged)?)?;
        self.staging.flush()?;
        Ok(())
    }

    fn discard_staged_rotation(&self, user: &UserId) -> Result<bool> {
        Ok(self.staging.remove(Self::user_prefix(user))?.is_some())
    }
}
