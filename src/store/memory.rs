//! In-process document store
//!
//! Holds every record behind one lock, which makes each rotation commit
//! trivially atomic. Used by tests and by embedders that persist elsewhere.

use crate::error::Result;
use crate::rotation::StagedRotation;
use crate::store::{
    check_rotation, CommitOutcome, DocumentId, DocumentStore, EncryptedDocument, Epoch,
    KeyVersion, KeyVersionStatus, RotationCommit, UserId, VersionId,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

#[derive(Default)]
struct UserRecords {
    versions: BTreeMap<VersionId, KeyVersion>,
    epoch: Option<Epoch>,
    documents: BTreeMap<DocumentId, EncryptedDocument>,
    staged: Option<StagedRotation>,
}

/// Store backed by in-memory maps
#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<UserId, UserRecords>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a stored document's payload without any checks.
    ///
    /// Simulates corruption at rest; does not move the epoch.
    pub fn overwrite_document_unchecked(&self, user: &UserId, document: EncryptedDocument) {
        let mut users = self.users.write();
        let records = users.entry(user.clone()).or_default();
        records
            .documents
            .insert(document.document_id.clone(), document);
    }
}

impl DocumentStore for MemoryStore {
    fn epoch(&self, user: &UserId) -> Result<Option<Epoch>> {
        Ok(self.users.read().get(user).and_then(|r| r.epoch))
    }

    fn active_key_version(&self, user: &UserId) -> Result<Option<KeyVersion>> {
        let users = self.users.read();
        Ok(users.get(user).and_then(|r| {
            r.epoch
                .and_then(|epoch| r.versions.get(&epoch.version_id).cloned())
        }))
    }

    fn key_version(&self, user: &UserId, version_id: VersionId) -> Result<Option<KeyVersion>> {
        Ok(self
            .users
            .read()
            .get(user)
            .and_then(|r| r.versions.get(&version_id).cloned()))
    }

    fn key_versions(&self, user: &UserId) -> Result<Vec<KeyVersion>> {
        Ok(self
            .users
            .read()
            .get(user)
            .map(|r| r.versions.values().cloned().collect())
            .unwrap_or_default())
    }

    fn create_key_version(&self, user: &UserId, version: &KeyVersion) -> Result<CommitOutcome> {
        let mut users = self.users.write();
        let records = users.entry(user.clone()).or_default();

        if records.epoch.is_some() {
            return Ok(CommitOutcome::Conflict(
                "an active key version already exists".to_string(),
            ));
        }
        if records.versions.contains_key(&version.version_id) {
            return Ok(CommitOutcome::Conflict(format!(
                "key version {} already exists",
                version.version_id
            )));
        }

        records.versions.insert(version.version_id, version.clone());
        records.epoch = Some(Epoch {
            version_id: version.version_id,
            write_seq: 0,
        });
        debug!("Created key version {} for {}", version.version_id, user);
        Ok(CommitOutcome::Committed)
    }

    fn list_documents(
        &self,
        user: &UserId,
        version_id: VersionId,
    ) -> Result<Vec<EncryptedDocument>> {
        Ok(self
            .users
            .read()
            .get(user)
            .map(|r| {
                r.documents
                    .values()
                    .filter(|d| d.key_version_id == version_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn get_document(
        &self,
        user: &UserId,
        document_id: &DocumentId,
    ) -> Result<Option<EncryptedDocument>> {
        Ok(self
            .users
            .read()
            .get(user)
            .and_then(|r| r.documents.get(document_id).cloned()))
    }

    fn put_document(&self, user: &UserId, document: &EncryptedDocument) -> Result<CommitOutcome> {
        let mut users = self.users.write();
        let records = match users.get_mut(user) {
            Some(records) => records,
            None => {
                return Ok(CommitOutcome::Conflict(
                    "no active key version".to_string(),
                ))
            }
        };

        match records.epoch.as_mut() {
            Some(epoch) if epoch.version_id == document.key_version_id => {
                epoch.write_seq += 1;
            }
            Some(epoch) => {
                return Ok(CommitOutcome::Conflict(format!(
                    "active version is {}, document is sealed under {}",
                    epoch.version_id, document.key_version_id
                )))
            }
            None => {
                return Ok(CommitOutcome::Conflict(
                    "no active key version".to_string(),
                ))
            }
        }

        records
            .documents
            .insert(document.document_id.clone(), document.clone());
        Ok(CommitOutcome::Committed)
    }

    fn commit_rotation(&self, user: &UserId, commit: &RotationCommit) -> Result<CommitOutcome> {
        let mut users = self.users.write();
        let records = users.entry(user.clone()).or_default();

        let conflict = check_rotation::<std::convert::Infallible, _>(commit, records.epoch, |id| {
            Ok(records.documents.get(id).cloned())
        })
        .unwrap_or_else(|never| match never {});
        if let Some(reason) = conflict {
            return Ok(CommitOutcome::Conflict(reason));
        }

        let remaining = records
            .documents
            .values()
            .filter(|d| d.key_version_id == commit.expected.version_id)
            .count();
        if remaining != commit.documents.len() {
            return Ok(CommitOutcome::Conflict(format!(
                "{} documents under version {}, commit covers {}",
                remaining,
                commit.expected.version_id,
                commit.documents.len()
            )));
        }
        if records
            .versions
            .contains_key(&commit.new_version.version_id)
        {
            return Ok(CommitOutcome::Conflict(format!(
                "key version {} already exists",
                commit.new_version.version_id
            )));
        }

        // All checks passed; apply under the same lock
        if let Some(old) = records.versions.get_mut(&commit.expected.version_id) {
            old.status = KeyVersionStatus::Retired {
                retired_at: commit.retired_at,
            };
        }
        records
            .versions
            .insert(commit.new_version.version_id, commit.new_version.clone());
        for rotated in &commit.documents {
            records.documents.insert(
                rotated.document.document_id.clone(),
                rotated.document.clone(),
            );
        }
        records.epoch = Some(Epoch {
            version_id: commit.new_version.version_id,
            write_seq: commit.expected.write_seq + 1,
        });

        debug!(
            "Committed rotation {} -> {} for {} ({} documents)",
            commit.expected.version_id,
            commit.new_version.version_id,
            user,
            commit.documents.len()
        );
        Ok(CommitOutcome::Committed)
    }

    fn purge_retired(&self, user: &UserId, cutoff: DateTime<Utc>) -> Result<Vec<VersionId>> {
        let mut users = self.users.write();
        let records = match users.get_mut(user) {
            Some(records) => records,
            None => return Ok(Vec::new()),
        };

        let purgeable: Vec<VersionId> = records
            .versions
            .values()
            .filter(|v| matches!(v.retired_at(), Some(at) if at < cutoff))
            .filter(|v| {
                !records
                    .documents
                    .values()
                    .any(|d| d.key_version_id == v.version_id)
            })
            .map(|v| v.version_id)
            .collect();

        for id in &purgeable {
            records.versions.remove(id);
        }
        Ok(purgeable)
    }

    fn staged_rotation(&self, user: &UserId) -> Result<Option<StagedRotation>> {
        Ok(self
            .users
            .read()
            .get(user)
            .and_then(|r| r.staged.clone()))
    }

    fn stage_rotation(&self, user: &UserId, staged: &StagedRotation) -> Result<()> {
        self.users.write().entry(user.clone()).or_default().staged = Some(staged.clone());
        Ok(())
    }

    fn discard_staged_rotation(&self, user: &UserId) -> Result<bool> {
        Ok(self
            .users
            .write()
            .get_mut(user)
            .and_then(|r| r.staged.take())
            .is_some())
    }
}
