//! Passphrase rotation
//!
//! A rotation moves every document of the user's active key version to a new
//! version derived from the new passphrase. It runs as a state machine:
//!
//! ```text
//! Verifying -> ReEncrypting -> Committing -> Done
//!      \             \              \
//!       +-------------+--------------+--> Failed(reason)
//! ```
//!
//! Nothing becomes visible until the single atomic commit. A conflicting
//! writer sends the rotation back to `Verifying`; documents that failed to
//! re-encrypt leave the old version in place and keep the successful work
//! staged for the next attempt.

mod gate;
mod staging;

pub use gate::{QueuedSave, ReplayReport, RotationGuard, SaveAdmission, WriteGate};
pub use staging::{StagedDocument, StagedRotation, StagingArea};

use crate::clock::Clock;
use crate::config::RotationConfig;
use crate::crypto::{
    EncryptedPayload, EncryptionEngine, IdentityResolver, KeyMaterial, Passphrase,
};
use crate::error::{Error, Result};
use crate::retry::ExponentialBackoff;
use crate::store::{
    CommitOutcome, DocumentId, DocumentStore, EncryptedDocument, KeyVersion, KeyVersionStatus,
    RotatedDocument, RotationCommit, UserId, VersionId,
};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

/// Rotation state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationState {
    Verifying,
    ReEncrypting,
    Committing,
    Done,
    Failed(FailureReason),
}

impl RotationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RotationState::Done | RotationState::Failed(_))
    }
}

impl fmt::Display for RotationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationState::Verifying => write!(f, "verifying"),
            RotationState::ReEncrypting => write!(f, "re-encrypting"),
            RotationState::Committing => write!(f, "committing"),
            RotationState::Done => write!(f, "done"),
            RotationState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Why a rotation ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The old passphrase does not belong to the active key version
    WrongPassphrase,
    NoActiveKeyVersion,
    Malformed(String),
    /// These documents could not be re-encrypted; nothing was committed
    PartialReEncryption(Vec<DocumentId>),
    /// Conflicting writers kept moving the epoch
    PersistenceConflict(String),
    /// The commit could not be persisted
    Store(String),
    Cancelled,
}

impl FailureReason {
    fn from_error(err: &Error) -> Self {
        match err {
            Error::AuthenticationFailure => FailureReason::WrongPassphrase,
            Error::NoActiveKeyVersion(_) => FailureReason::NoActiveKeyVersion,
            Error::MalformedInput(m) | Error::KeyDerivation(m) => {
                FailureReason::Malformed(m.clone())
            }
            Error::PartialReEncryption(ids) => FailureReason::PartialReEncryption(ids.clone()),
            Error::PersistenceConflict(r) => FailureReason::PersistenceConflict(r.clone()),
            Error::Cancelled => FailureReason::Cancelled,
            other => FailureReason::Store(other.to_string()),
        }
    }

    /// The crate error a caller should surface for this failure
    pub fn to_error(&self, user: &UserId) -> Error {
        match self {
            FailureReason::WrongPassphrase => Error::AuthenticationFailure,
            FailureReason::NoActiveKeyVersion => Error::NoActiveKeyVersion(user.to_string()),
            FailureReason::Malformed(m) => Error::MalformedInput(m.clone()),
            FailureReason::PartialReEncryption(ids) => Error::PartialReEncryption(ids.clone()),
            FailureReason::PersistenceConflict(r) => Error::PersistenceConflict(r.clone()),
            FailureReason::Store(m) => Error::StoreUnavailable(m.clone()),
            FailureReason::Cancelled => Error::Cancelled,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::WrongPassphrase => write!(f, "wrong passphrase"),
            FailureReason::NoActiveKeyVersion => write!(f, "no active key version"),
            FailureReason::Malformed(m) => write!(f, "malformed input: {}", m),
            FailureReason::PartialReEncryption(ids) => {
                write!(f, "{} document(s) failed to re-encrypt", ids.len())
            }
            FailureReason::PersistenceConflict(r) => write!(f, "persistence conflict: {}", r),
            FailureReason::Store(m) => write!(f, "store error: {}", m),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Snapshot published while a rotation runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationProgress {
    pub state: RotationState,
    /// Documents under the active version in the current attempt
    pub total: usize,
    /// Re-encrypted or reused from staging
    pub completed: usize,
    pub failed: usize,
}

impl RotationProgress {
    fn new() -> Self {
        RotationProgress {
            state: RotationState::Verifying,
            total: 0,
            completed: 0,
            failed: 0,
        }
    }
}

/// Final report of a rotation
#[derive(Debug, Clone)]
pub struct RotationResult {
    pub user: UserId,
    /// `Done` or `Failed`
    pub state: RotationState,
    pub new_version: Option<VersionId>,
    pub retired_version: Option<VersionId>,
    /// Documents decrypted and sealed again, across all attempts
    pub documents_reencrypted: usize,
    /// Documents taken from an earlier attempt's staging
    pub documents_reused: usize,
    pub saves_replayed: usize,
    pub saves_failed: Vec<DocumentId>,
    /// Restarts caused by conflicting writers
    pub restarts: u32,
}

impl RotationResult {
    pub fn is_done(&self) -> bool {
        self.state == RotationState::Done
    }

    /// `Ok` for `Done`, the matching crate error otherwise
    pub fn into_result(self) -> Result<RotationResult> {
        let failure = match &self.state {
            RotationState::Done => None,
            RotationState::Failed(reason) => Some(reason.to_error(&self.user)),
            other => Some(Error::Internal(format!(
                "rotation ended in non-terminal state {}",
                other
            ))),
        };

        match failure {
            None => Ok(self),
            Some(e) => Err(e),
        }
    }
}

/// Cancels a rotation until it reaches `Committing`
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Caller's view of a running rotation
pub struct RotationHandle {
    user: UserId,
    cancel: CancelToken,
    progress: watch::Receiver<RotationProgress>,
    task: JoinHandle<RotationResult>,
}

impl RotationHandle {
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Request cancellation; ignored once committing has begun
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that can cancel this rotation from elsewhere
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn progress(&self) -> watch::Receiver<RotationProgress> {
        self.progress.clone()
    }

    /// Wait for the rotation to reach a terminal state
    pub async fn wait(self) -> Result<RotationResult> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("rotation task failed: {}", e)))
    }
}

struct RotationJob {
    user: UserId,
    old: Passphrase,
    new: Passphrase,
    cancel: CancelToken,
    progress: Arc<watch::Sender<RotationProgress>>,
}

impl RotationJob {
    fn set_state(&self, state: RotationState) {
        debug!("Rotation for {} is {}", self.user, state);
        self.progress.send_modify(|p| p.state = state);
    }

    fn ensure_not_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

type VersionKey = (VersionId, Arc<KeyMaterial>);

/// State carried across attempts of one rotation
#[derive(Default)]
struct RunContext {
    old_key: Option<VersionKey>,
    new_key: Option<VersionKey>,
    reencrypted: usize,
    reused: usize,
    new_version: Option<VersionId>,
    retired_version: Option<VersionId>,
}

enum AttemptOutcome {
    Finished(RotationState),
    Conflict(String),
}

/// Orchestrates passphrase rotations
#[derive(Clone)]
pub struct KeyRotationCoordinator {
    engine: EncryptionEngine,
    identity: IdentityResolver,
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    config: RotationConfig,
    gate: Arc<WriteGate>,
    staging: Arc<StagingArea>,
}

impl KeyRotationCoordinator {
    pub fn new(
        engine: EncryptionEngine,
        identity: IdentityResolver,
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        config: RotationConfig,
    ) -> Self {
        let staging = Arc::new(StagingArea::new(Arc::clone(&store)));
        KeyRotationCoordinator {
            engine,
            identity,
            store,
            clock,
            config,
            gate: Arc::new(WriteGate::new()),
            staging,
        }
    }

    /// Gate ordinary saves must pass through
    pub fn gate(&self) -> &Arc<WriteGate> {
        &self.gate
    }

    /// Documents staged by an earlier, uncommitted attempt
    pub fn staged_documents(&self, user: &UserId) -> Result<usize> {
        self.staging.staged_documents(user)
    }

    /// Start rotating every document of the user's active key version.
    ///
    /// Fails immediately with `RotationInProgress` if the user already has
    /// one running. Must be called from within a tokio runtime.
    pub fn start(&self, user: &UserId, old: Passphrase, new: Passphrase) -> Result<RotationHandle> {
        self.spawn(user, old, new, None)
    }

    /// Like [`start`](Self::start), but the first attempt works from the
    /// caller's document list. Documents not under the active version are
    /// ignored; a list that misses documents ends in a conflict and a
    /// restart from the store's own listing.
    pub fn start_with_documents(
        &self,
        user: &UserId,
        old: Passphrase,
        new: Passphrase,
        documents: Vec<EncryptedDocument>,
    ) -> Result<RotationHandle> {
        self.spawn(user, old, new, Some(documents))
    }

    pub async fn rotate(
        &self,
        user: &UserId,
        old: Passphrase,
        new: Passphrase,
    ) -> Result<RotationResult> {
        self.start(user, old, new)?.wait().await
    }

    pub async fn rotate_documents(
        &self,
        user: &UserId,
        old: Passphrase,
        new: Passphrase,
        documents: Vec<EncryptedDocument>,
    ) -> Result<RotationResult> {
        self.start_with_documents(user, old, new, documents)?
            .wait()
            .await
    }

    /// Purge key versions retired longer than the grace period ago
    pub fn collect_retired(&self, user: &UserId) -> Result<Vec<VersionId>> {
        let cutoff = self.clock.now() - self.config.retired_grace();
        let purged = self.store.purge_retired(user, cutoff)?;
        if !purged.is_empty() {
            info!("Purged retired key versions {:?} for {}", purged, user);
        }
        Ok(purged)
    }

    fn spawn(
        &self,
        user: &UserId,
        old: Passphrase,
        new: Passphrase,
        documents: Option<Vec<EncryptedDocument>>,
    ) -> Result<RotationHandle> {
        let guard = self.gate.begin(user)?;
        let cancel = CancelToken::default();
        let (tx, rx) = watch::channel(RotationProgress::new());

        let job = RotationJob {
            user: user.clone(),
            old,
            new,
            cancel: cancel.clone(),
            progress: Arc::new(tx),
        };

        let coordinator = self.clone();
        let task = tokio::spawn(async move { coordinator.run(job, documents, guard).await });
        info!("Started key rotation for {}", user);

        Ok(RotationHandle {
            user: user.clone(),
            cancel,
            progress: rx,
            task,
        })
    }

    async fn run(
        self,
        job: RotationJob,
        mut documents: Option<Vec<EncryptedDocument>>,
        guard: RotationGuard,
    ) -> RotationResult {
        let mut ctx = RunContext::default();
        let mut restarts = 0u32;

        let state = loop {
            match self.attempt(&job, &guard, documents.take(), &mut ctx).await {
                Ok(AttemptOutcome::Finished(state)) => break state,
                Ok(AttemptOutcome::Conflict(reason)) => {
                    if restarts >= self.config.max_conflict_restarts {
                        break RotationState::Failed(FailureReason::PersistenceConflict(reason));
                    }
                    restarts += 1;
                    warn!(
                        "Rotation for {} conflicted ({}), restarting ({}/{})",
                        job.user, reason, restarts, self.config.max_conflict_restarts
                    );
                }
                Err(e) => {
                    if !matches!(e, Error::Cancelled) {
                        error!("Rotation for {} failed: {}", job.user, e);
                    }
                    break RotationState::Failed(FailureReason::from_error(&e));
                }
            }
        };

        if state == RotationState::Failed(FailureReason::Cancelled) {
            self.drop_staging(&job.user);
            info!("Rotation for {} cancelled", job.user);
        }

        // Queued saves land under whichever version is active now
        let replay_key = match state {
            RotationState::Done => ctx.new_key.clone(),
            _ => ctx.old_key.clone(),
        };
        let report = guard.finish(|save| self.replay(&job.user, replay_key.as_ref(), save));

        match &state {
            RotationState::Done => info!(
                "Rotation for {} done: version {:?} active, {} re-encrypted, {} reused",
                job.user, ctx.new_version, ctx.reencrypted, ctx.reused
            ),
            other => warn!("Rotation for {} ended: {}", job.user, other),
        }
        job.set_state(state.clone());

        RotationResult {
            user: job.user.clone(),
            state,
            new_version: ctx.new_version,
            retired_version: ctx.retired_version,
            documents_reencrypted: ctx.reencrypted,
            documents_reused: ctx.reused,
            saves_replayed: report.replayed,
            saves_failed: report.failed,
            restarts,
        }
    }

    async fn attempt(
        &self,
        job: &RotationJob,
        guard: &RotationGuard,
        provided: Option<Vec<EncryptedDocument>>,
        ctx: &mut RunContext,
    ) -> Result<AttemptOutcome> {
        // Verifying
        job.set_state(RotationState::Verifying);
        job.ensure_not_cancelled()?;

        if job.new.is_empty() {
            return Ok(failed(FailureReason::Malformed(
                "new passphrase is empty".to_string(),
            )));
        }
        let old_identity = self.identity.identify(&job.old);
        let new_identity = self.identity.identify(&job.new);
        if old_identity == new_identity {
            return Ok(failed(FailureReason::Malformed(
                "new passphrase matches the current one".to_string(),
            )));
        }

        let active = match self.store.active_key_version(&job.user)? {
            Some(version) => version,
            None => return Ok(failed(FailureReason::NoActiveKeyVersion)),
        };
        let expected = match self.store.epoch(&job.user)? {
            Some(epoch) if epoch.version_id == active.version_id => epoch,
            _ => {
                return Ok(AttemptOutcome::Conflict(
                    "active version changed while reading".to_string(),
                ))
            }
        };

        if active.identity_hash != old_identity {
            warn!(
                "Rotation for {}: old passphrase does not match key version {}",
                job.user, active.version_id
            );
            return Ok(failed(FailureReason::WrongPassphrase));
        }

        let documents = match provided {
            Some(documents) => unique_under(documents, active.version_id),
            None => self.store.list_documents(&job.user, active.version_id)?,
        };

        let mut salts = vec![active.salt.clone()];
        let mut seen: HashSet<&[u8]> = HashSet::new();
        seen.insert(active.salt.as_slice());
        for document in &documents {
            if seen.insert(document.payload.salt.as_slice()) {
                salts.push(document.payload.salt.clone());
            }
        }
        let old_keys = self
            .derive_keys(job.old.clone(), salts, active.kdf_iterations)
            .await?;
        let version_key = match old_keys.get(&active.salt) {
            Some(key) => Arc::clone(key),
            None => {
                return Ok(failed(FailureReason::Malformed(format!(
                    "key version {} has an unusable salt",
                    active.version_id
                ))))
            }
        };
        ctx.old_key = Some((active.version_id, version_key));

        let mut staged = match self.staging.get(&job.user)? {
            Some(staged) if staged.matches(active.version_id, &new_identity) => {
                debug!(
                    "Resuming rotation for {} with {} staged documents",
                    job.user,
                    staged.len()
                );
                staged
            }
            other => {
                if other.is_some() {
                    debug!("Discarding stale staging for {}", job.user);
                }
                let salt = self.engine.kdf().generate_salt()?;
                StagedRotation::new(
                    active.version_id,
                    KeyVersion {
                        version_id: active.version_id + 1,
                        salt: salt.to_vec(),
                        created_at: self.clock.now(),
                        identity_hash: new_identity.clone(),
                        kdf_iterations: self.engine.iterations(),
                        status: KeyVersionStatus::Active,
                    },
                )
            }
        };
        let ids: HashSet<DocumentId> = documents.iter().map(|d| d.document_id.clone()).collect();
        staged.retain_only(&ids);

        let new_version = staged.new_version().clone();
        let new_key = self
            .derive_keys(
                job.new.clone(),
                vec![new_version.salt.clone()],
                new_version.kdf_iterations,
            )
            .await?
            .remove(&new_version.salt)
            .ok_or_else(|| Error::KeyDerivation("could not derive the new key".to_string()))?;
        ctx.new_key = Some((new_version.version_id, Arc::clone(&new_key)));

        // A representative document that fails to open despite a matching
        // identity is corrupt, not a wrong passphrase.
        let mut failures: Vec<DocumentId> = Vec::new();
        if let Some(first) = documents.first() {
            let verified = match old_keys.get(&first.payload.salt) {
                Some(key) => self
                    .engine
                    .open_with_key(&first.payload, key)
                    .map(|plaintext| drop(Zeroizing::new(plaintext))),
                None => Err(Error::MalformedInput("unusable salt".to_string())),
            };
            if let Err(e) = verified {
                warn!(
                    "Document {} of {} failed verification: {}",
                    first.document_id, job.user, e
                );
                failures.push(first.document_id.clone());
            }
        }

        job.ensure_not_cancelled()?;

        // ReEncrypting
        guard.close();
        let mut pending = Vec::new();
        let mut reused = 0;
        for document in &documents {
            if failures.contains(&document.document_id) {
                continue;
            }
            if staged.reusable(document).is_some() {
                reused += 1;
            } else {
                pending.push(document.clone());
            }
        }
        ctx.reused = reused;

        let total = documents.len();
        let failed_so_far = failures.len();
        job.progress.send_modify(|p| {
            p.state = RotationState::ReEncrypting;
            p.total = total;
            p.completed = reused;
            p.failed = failed_so_far;
        });
        debug!(
            "Re-encrypting {} of {} documents for {} ({} reused)",
            pending.len(),
            total,
            job.user,
            reused
        );

        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let futures: Vec<_> = pending
            .into_iter()
            .map(|document| {
                let semaphore = Arc::clone(&semaphore);
                let engine = self.engine.clone();
                let old_key = old_keys.get(&document.payload.salt).cloned();
                let new_key = Arc::clone(&new_key);
                let cancel = job.cancel.clone();
                let progress = Arc::clone(&job.progress);
                async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            return (
                                document,
                                Err(Error::Internal("worker pool closed".to_string())),
                            )
                        }
                    };
                    if cancel.is_cancelled() {
                        return (document, Err(Error::Cancelled));
                    }

                    let result = match old_key {
                        Some(old_key) => {
                            let payload = document.payload.clone();
                            tokio::task::spawn_blocking(move || {
                                reseal(&engine, &payload, &old_key, &new_key)
                            })
                            .await
                            .unwrap_or_else(|e| {
                                Err(Error::Internal(format!("re-encryption task failed: {}", e)))
                            })
                        }
                        None => Err(Error::MalformedInput(
                            "no key for document salt".to_string(),
                        )),
                    };

                    progress.send_modify(|p| match &result {
                        Ok(_) => p.completed += 1,
                        Err(_) => p.failed += 1,
                    });
                    (document, result)
                }
            })
            .collect();

        let now = self.clock.now();
        let mut cancelled = false;
        for (document, result) in join_all(futures).await {
            match result {
                Ok(payload) => {
                    staged.insert(
                        EncryptedDocument {
                            document_id: document.document_id.clone(),
                            key_version_id: new_version.version_id,
                            payload,
                            updated_at: now,
                        },
                        document.payload.nonce.clone(),
                    );
                    ctx.reencrypted += 1;
                }
                Err(Error::Cancelled) => cancelled = true,
                Err(e) => {
                    warn!(
                        "Failed to re-encrypt document {} of {}: {}",
                        document.document_id, job.user, e
                    );
                    failures.push(document.document_id.clone());
                }
            }
        }

        if cancelled {
            return Err(Error::Cancelled);
        }
        job.ensure_not_cancelled()?;

        if !failures.is_empty() {
            failures.sort();
            failures.dedup();
            self.keep_staging(&job.user, &staged);
            return Ok(failed(FailureReason::PartialReEncryption(failures)));
        }

        // Committing: no longer cancellable
        job.set_state(RotationState::Committing);

        let mut rotated = Vec::with_capacity(documents.len());
        for document in &documents {
            match staged.get(&document.document_id) {
                Some(entry) => rotated.push(RotatedDocument {
                    document: entry.document.clone(),
                    previous_nonce: entry.source_nonce.clone(),
                }),
                None => {
                    return Err(Error::Internal(format!(
                        "document {} missing from staging",
                        document.document_id
                    )))
                }
            }
        }

        let commit = RotationCommit {
            expected,
            new_version: new_version.clone(),
            retired_at: self.clock.now(),
            documents: rotated,
        };

        match self.commit_with_retry(&job.user, commit).await {
            Ok(CommitOutcome::Committed) => {}
            Ok(CommitOutcome::Conflict(reason)) => {
                if !self.landed(&job.user, new_version.version_id) {
                    self.keep_staging(&job.user, &staged);
                    return Ok(AttemptOutcome::Conflict(reason));
                }
                info!(
                    "Earlier commit attempt for {} already landed version {}",
                    job.user, new_version.version_id
                );
            }
            Err(e) => {
                if !self.landed(&job.user, new_version.version_id) {
                    self.keep_staging(&job.user, &staged);
                    return Err(e);
                }
                info!(
                    "Commit for {} reported {} but version {} is active",
                    job.user, e, new_version.version_id
                );
            }
        }

        self.drop_staging(&job.user);
        ctx.new_version = Some(new_version.version_id);
        ctx.retired_version = Some(active.version_id);
        Ok(AttemptOutcome::Finished(RotationState::Done))
    }

    /// Commit under a timeout, retrying transient failures with backoff.
    ///
    /// A call that exceeds the timeout keeps running. Every such call is
    /// awaited before this returns, so the outcome reflects what the store
    /// actually holds; if any of them committed, the rotation committed.
    async fn commit_with_retry(
        &self,
        user: &UserId,
        commit: RotationCommit,
    ) -> Result<CommitOutcome> {
        let commit = Arc::new(commit);
        let timeout = self.config.commit_timeout();
        let mut backoff =
            ExponentialBackoff::new(self.config.retry_base_delay_ms, self.config.retry_attempts);
        let mut outstanding: Vec<JoinHandle<Result<CommitOutcome>>> = Vec::new();

        let result = loop {
            let store = Arc::clone(&self.store);
            let call_user = user.clone();
            let call_commit = Arc::clone(&commit);
            let mut call = tokio::task::spawn_blocking(move || {
                store.commit_rotation(&call_user, &call_commit)
            });

            let result = match tokio::time::timeout(timeout, &mut call).await {
                Ok(joined) => joined_commit(joined),
                Err(_) => {
                    outstanding.push(call);
                    Err(Error::Timeout(timeout))
                }
            };

            match result {
                Err(e) if e.is_transient() => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            "Commit for {} failed ({}), retrying in {:?} (attempt {}/{})",
                            user,
                            e,
                            delay,
                            backoff.attempts(),
                            self.config.retry_attempts
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => break Err(e),
                },
                other => break other,
            }
        };

        if outstanding.is_empty() {
            return result;
        }

        debug!(
            "Waiting for {} timed-out commit call(s) for {}",
            outstanding.len(),
            user
        );
        let mut committed = false;
        for joined in join_all(outstanding).await {
            match joined_commit(joined) {
                Ok(CommitOutcome::Committed) => committed = true,
                Ok(CommitOutcome::Conflict(reason)) => {
                    debug!("Timed-out commit for {} conflicted: {}", user, reason)
                }
                Err(e) => debug!("Timed-out commit for {} failed: {}", user, e),
            }
        }

        if committed {
            info!("A timed-out commit for {} landed", user);
            return Ok(CommitOutcome::Committed);
        }
        result
    }

    /// Keep re-encrypted documents for the next attempt. Losing them only
    /// costs the reuse.
    fn keep_staging(&self, user: &UserId, staged: &StagedRotation) {
        if let Err(e) = self.staging.store(user, staged) {
            warn!("Could not persist staged rotation for {}: {}", user, e);
        }
    }

    fn drop_staging(&self, user: &UserId) {
        if let Err(e) = self.staging.discard(user) {
            warn!("Could not discard staged rotation for {}: {}", user, e);
        }
    }

    /// Whether `version_id` is already the active version
    fn landed(&self, user: &UserId, version_id: VersionId) -> bool {
        matches!(self.store.epoch(user), Ok(Some(epoch)) if epoch.version_id == version_id)
    }

    fn replay(&self, user: &UserId, key: Option<&VersionKey>, save: &QueuedSave) -> Result<()> {
        let (version_id, key) = key.ok_or_else(|| Error::NoActiveKeyVersion(user.to_string()))?;
        let document = EncryptedDocument {
            document_id: save.document_id.clone(),
            key_version_id: *version_id,
            payload: self.engine.seal_with_key(&save.plaintext, key)?,
            updated_at: save.queued_at,
        };

        match self.store.put_document(user, &document)? {
            CommitOutcome::Committed => Ok(()),
            CommitOutcome::Conflict(reason) => Err(Error::PersistenceConflict(reason)),
        }
    }

    /// Derive one key per salt, skipping salts the KDF rejects
    async fn derive_keys(
        &self,
        passphrase: Passphrase,
        salts: Vec<Vec<u8>>,
        iterations: u32,
    ) -> Result<HashMap<Vec<u8>, Arc<KeyMaterial>>> {
        let kdf = self.engine.kdf().clone();
        tokio::task::spawn_blocking(move || {
            let mut keys = HashMap::with_capacity(salts.len());
            for salt in salts {
                match kdf.derive(&passphrase, &salt, iterations) {
                    Ok(key) => {
                        keys.insert(salt, Arc::new(key));
                    }
                    Err(e) => debug!("Skipping unusable salt: {}", e),
                }
            }
            keys
        })
        .await
        .map_err(|e| Error::Internal(format!("key derivation task failed: {}", e)))
    }
}

fn joined_commit(
    joined: std::result::Result<Result<CommitOutcome>, tokio::task::JoinError>,
) -> Result<CommitOutcome> {
    joined.unwrap_or_else(|e| Err(Error::Internal(format!("commit task failed: {}", e))))
}

fn failed(reason: FailureReason) -> AttemptOutcome {
    AttemptOutcome::Finished(RotationState::Failed(reason))
}

/// Open under the old key and seal under the new one
fn reseal(
    engine: &EncryptionEngine,
    payload: &EncryptedPayload,
    old_key: &KeyMaterial,
    new_key: &KeyMaterial,
) -> Result<EncryptedPayload> {
    let plaintext = Zeroizing::new(engine.open_with_key(payload, old_key)?);
    engine.seal_with_key(&plaintext, new_key)
}

/// Keep documents under `version_id`, last occurrence of each id wins
fn unique_under(documents: Vec<EncryptedDocument>, version_id: VersionId) -> Vec<EncryptedDocument> {
    documents
        .into_iter()
        .filter(|d| d.key_version_id == version_id)
        .map(|d| (d.document_id.clone(), d))
        .collect::<BTreeMap<_, _>>()
        .into_values()
        .collect()
}
