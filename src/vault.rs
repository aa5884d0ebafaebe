//! Client-facing document operations
//!
//! `DocumentVault` is what an application embeds: it seals and opens
//! documents under the user's active key version, creates the first version
//! on first save, and hands passphrase changes to the rotation coordinator.

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::crypto::{
    CryptoProvider, EncryptedPayload, EncryptionEngine, IdentityHash, IdentityResolver,
    Passphrase, RingProvider,
};
use crate::error::{Error, Result};
use crate::rotation::{KeyRotationCoordinator, RotationHandle, SaveAdmission};
use crate::store::{
    CommitOutcome, DocumentId, DocumentStore, EncryptedDocument, KeyVersion, KeyVersionStatus,
    SledStore, UserId, VersionId,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Result of [`DocumentVault::save_document`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Stored(EncryptedDocument),
    /// A rotation is running; the save is replayed when it ends
    Queued,
}

/// Summary of a user's key state
#[derive(Debug, Clone)]
pub struct VaultStatus {
    pub active_version: Option<KeyVersion>,
    pub versions: Vec<KeyVersion>,
    pub documents: usize,
    pub rotating: bool,
    pub queued_saves: usize,
    pub staged_documents: usize,
}

pub struct DocumentVault {
    engine: EncryptionEngine,
    identity: IdentityResolver,
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    coordinator: KeyRotationCoordinator,
}

impl DocumentVault {
    pub fn new(
        provider: Arc<dyn CryptoProvider>,
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        let engine = EncryptionEngine::new(provider, config.encryption.kdf_iterations);
        let identity = IdentityResolver::new(&config.encryption.identity_salt);
        let coordinator = KeyRotationCoordinator::new(
            engine.clone(),
            identity.clone(),
            store.clone(),
            clock.clone(),
            config.rotation.clone(),
        );

        DocumentVault {
            engine,
            identity,
            store,
            clock,
            coordinator,
        }
    }

    /// Open the sled-backed vault described by `config`
    pub fn open(config: &Config) -> Result<Self> {
        config.ensure_directories()?;
        let path = config.store.database_path();
        let store = SledStore::open(&path)?;
        info!("Opened document store at {:?}", path);

        Ok(Self::new(
            Arc::new(RingProvider::new()),
            Arc::new(store),
            Arc::new(SystemClock),
            config,
        ))
    }

    pub fn coordinator(&self) -> &KeyRotationCoordinator {
        &self.coordinator
    }

    /// Seal under a fresh salt and nonce
    pub fn encrypt_document(
        &self,
        plaintext: &[u8],
        passphrase: &Passphrase,
    ) -> Result<EncryptedPayload> {
        self.engine.seal(plaintext, passphrase)
    }

    /// Open a payload; `AuthenticationFailure` on a wrong passphrase
    pub fn decrypt_document(
        &self,
        payload: &EncryptedPayload,
        passphrase: &Passphrase,
    ) -> Result<Vec<u8>> {
        self.engine.open(payload, passphrase)
    }

    pub fn identify(&self, passphrase: &Passphrase) -> IdentityHash {
        self.identity.identify(passphrase)
    }

    /// Seal and store a document under the active key version.
    ///
    /// The first save creates version 1 from `passphrase`. Later saves must
    /// use the active version's passphrase.
    pub fn save_document(
        &self,
        user: &UserId,
        document_id: &DocumentId,
        plaintext: &[u8],
        passphrase: &Passphrase,
    ) -> Result<SaveOutcome> {
        let version = self.active_or_create(user, passphrase)?;
        let key = self
            .engine
            .kdf()
            .derive(passphrase, &version.salt, version.kdf_iterations)?;

        let admission = self.coordinator.gate().submit(
            user,
            document_id,
            plaintext,
            self.clock.now(),
            |plaintext| {
                let document = EncryptedDocument {
                    document_id: document_id.clone(),
                    key_version_id: version.version_id,
                    payload: self.engine.seal_with_key(plaintext, &key)?,
                    updated_at: self.clock.now(),
                };
                self.ensure_still_active(user, version.version_id)?;
                match self.store.put_document(user, &document)? {
                    CommitOutcome::Committed => Ok(document),
                    CommitOutcome::Conflict(reason) => {
                        self.ensure_still_active(user, version.version_id)?;
                        Err(Error::PersistenceConflict(reason))
                    }
                }
            },
        )?;

        Ok(match admission {
            SaveAdmission::Written(document) => {
                debug!("Saved {} under version {}", document_id, version.version_id);
                SaveOutcome::Stored(document)
            }
            SaveAdmission::Queued => SaveOutcome::Queued,
        })
    }

    /// Fetch and decrypt a document
    pub fn load_document(
        &self,
        user: &UserId,
        document_id: &DocumentId,
        passphrase: &Passphrase,
    ) -> Result<Vec<u8>> {
        let document = self
            .store
            .get_document(user, document_id)?
            .ok_or_else(|| Error::DocumentNotFound(document_id.to_string()))?;
        let version = self
            .store
            .key_version(user, document.key_version_id)?
            .ok_or(Error::KeyVersionNotFound(document.key_version_id))?;

        self.engine
            .open_with_iterations(&document.payload, passphrase, version.kdf_iterations)
    }

    /// Begin a passphrase rotation in the background
    pub fn start_rotation(
        &self,
        user: &UserId,
        old: Passphrase,
        new: Passphrase,
    ) -> Result<RotationHandle> {
        self.coordinator.start(user, old, new)
    }

    /// Purge retired key versions past their grace period
    pub fn collect_retired(&self, user: &UserId) -> Result<Vec<VersionId>> {
        self.coordinator.collect_retired(user)
    }

    pub fn key_versions(&self, user: &UserId) -> Result<Vec<KeyVersion>> {
        self.store.key_versions(user)
    }

    /// Documents under the active key version
    pub fn list_documents(&self, user: &UserId) -> Result<Vec<EncryptedDocument>> {
        match self.store.active_key_version(user)? {
            Some(version) => self.store.list_documents(user, version.version_id),
            None => Ok(Vec::new()),
        }
    }

    pub fn status(&self, user: &UserId) -> Result<VaultStatus> {
        let active_version = self.store.active_key_version(user)?;
        let documents = match &active_version {
            Some(version) => self.store.list_documents(user, version.version_id)?.len(),
            None => 0,
        };

        Ok(VaultStatus {
            active_version,
            versions: self.store.key_versions(user)?,
            documents,
            rotating: self.coordinator.gate().is_rotating(user),
            queued_saves: self.coordinator.gate().queued(user),
            staged_documents: self.coordinator.staged_documents(user)?,
        })
    }

    /// A save resolved against `version_id` must not land after a rotation
    /// replaced it
    fn ensure_still_active(&self, user: &UserId, version_id: VersionId) -> Result<()> {
        match self.store.epoch(user)? {
            Some(epoch) if epoch.version_id == version_id => Ok(()),
            Some(epoch) => Err(Error::KeyRotated {
                from: version_id,
                to: epoch.version_id,
            }),
            None => Err(Error::NoActiveKeyVersion(user.to_string())),
        }
    }

    /// The active version, checked against `passphrase`, or a new first
    /// version derived from it
    fn active_or_create(&self, user: &UserId, passphrase: &Passphrase) -> Result<KeyVersion> {
        let identity = self.identity.identify(passphrase);

        if let Some(active) = self.store.active_key_version(user)? {
            if active.identity_hash != identity {
                return Err(Error::AuthenticationFailure);
            }
            return Ok(active);
        }

        if passphrase.is_empty() {
            return Err(Error::MalformedInput("passphrase is empty".to_string()));
        }

        let version = KeyVersion {
            version_id: 1,
            salt: self.engine.kdf().generate_salt()?.to_vec(),
            created_at: self.clock.now(),
            identity_hash: identity.clone(),
            kdf_iterations: self.engine.iterations(),
            status: KeyVersionStatus::Active,
        };

        match self.store.create_key_version(user, &version)? {
            CommitOutcome::Committed => {
                info!("Created key version 1 for {}", user);
                Ok(version)
            }
            // Another client created it first
            CommitOutcome::Conflict(_) => match self.store.active_key_version(user)? {
                Some(active) if active.identity_hash == identity => Ok(active),
                Some(_) => Err(Error::AuthenticationFailure),
                None => Err(Error::NoActiveKeyVersion(user.to_string())),
            },
        }
    }
}
