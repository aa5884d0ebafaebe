//! Advisory per-user write lock
//!
//! A rotation holds the gate from the start of re-encryption until its commit
//! has been decided. Saves arriving meanwhile are queued and replayed once the
//! rotation releases the gate, under whichever key version is active then.
//! Open-gate saves perform their store write while holding the user's mutex,
//! so a rotation can never close the gate halfway through a save.

use crate::error::{Error, Result};
use crate::store::{DocumentId, UserId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, warn};
use zeroize::Zeroizing;

/// A save held back while a rotation runs
pub struct QueuedSave {
    pub document_id: DocumentId,
    pub plaintext: Zeroizing<Vec<u8>>,
    pub queued_at: DateTime<Utc>,
}

/// What happened to a submitted save
#[derive(Debug)]
pub enum SaveAdmission<T> {
    /// The write ran immediately
    Written(T),
    /// A rotation holds the gate; the save will be replayed
    Queued,
}

/// Outcome of replaying the queue
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    pub replayed: usize,
    pub failed: Vec<DocumentId>,
}

#[derive(Default)]
struct GateState {
    rotating: bool,
    closed: bool,
    queue: Vec<QueuedSave>,
}

/// Per-user gates
#[derive(Default)]
pub struct WriteGate {
    users: DashMap<UserId, Arc<Mutex<GateState>>>,
}

impl WriteGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, user: &UserId) -> Arc<Mutex<GateState>> {
        Arc::clone(&self.users.entry(user.clone()).or_default())
    }

    /// Run `write` now, or queue the plaintext if a rotation holds the gate
    pub fn submit<T, F>(
        &self,
        user: &UserId,
        document_id: &DocumentId,
        plaintext: &[u8],
        queued_at: DateTime<Utc>,
        write: F,
    ) -> Result<SaveAdmission<T>>
    where
        F: FnOnce(&[u8]) -> Result<T>,
    {
        let state = self.state(user);
        let mut state = state.lock();

        if state.closed {
            state.queue.push(QueuedSave {
                document_id: document_id.clone(),
                plaintext: Zeroizing::new(plaintext.to_vec()),
                queued_at,
            });
            debug!(
                "Queued save of {} for {} ({} pending)",
                document_id,
                user,
                state.queue.len()
            );
            return Ok(SaveAdmission::Queued);
        }

        write(plaintext).map(SaveAdmission::Written)
    }

    /// Claim the user's gate for a rotation.
    ///
    /// Fails with `RotationInProgress` if another rotation holds it. Saves are
    /// not queued until [`RotationGuard::close`] is called.
    pub fn begin(&self, user: &UserId) -> Result<RotationGuard> {
        let state = self.state(user);
        {
            let mut guard = state.lock();
            if guard.rotating {
                return Err(Error::RotationInProgress(user.to_string()));
            }
            guard.rotating = true;
        }

        Ok(RotationGuard {
            user: user.clone(),
            state,
            finished: false,
        })
    }

    pub fn is_rotating(&self, user: &UserId) -> bool {
        self.users
            .get(user)
            .map(|s| {
                let rotating = s.lock().rotating;
                rotating
            })
            .unwrap_or(false)
    }

    /// Saves waiting for the user's rotation to finish
    pub fn queued(&self, user: &UserId) -> usize {
        self.users
            .get(user)
            .map(|s| {
                let pending = s.lock().queue.len();
                pending
            })
            .unwrap_or(0)
    }
}

/// Held by a running rotation; releases the gate on `finish` or drop
pub struct RotationGuard {
    user: UserId,
    state: Arc<Mutex<GateState>>,
    finished: bool,
}

impl RotationGuard {
    /// Start queueing saves
    pub fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            debug!("Write gate closed for {}", self.user);
        }
    }

    /// Replay queued saves in arrival order, then reopen the gate.
    ///
    /// Runs under the gate mutex, so saves submitted during replay wait and
    /// land after every queued one.
    pub fn finish<F>(mut self, mut replay: F) -> ReplayReport
    where
        F: FnMut(&QueuedSave) -> Result<()>,
    {
        let mut state = self.state.lock();
        let queue = std::mem::take(&mut state.queue);
        let mut report = ReplayReport::default();

        for save in &queue {
            match replay(save) {
                Ok(()) => report.replayed += 1,
                Err(e) => {
                    error!(
                        "Failed to replay queued save of {} for {}: {}",
                        save.document_id, self.user, e
                    );
                    report.failed.push(save.document_id.clone());
                }
            }
        }

        state.closed = false;
        state.rotating = false;
        drop(state);
        self.finished = true;

        if report.replayed > 0 {
            debug!("Replayed {} queued saves for {}", report.replayed, self.user);
        }
        report
    }
}

impl Drop for RotationGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let mut state = self.state.lock();
        let dropped = state.queue.len();
        state.queue.clear();
        state.closed = false;
        state.rotating = false;
        if dropped > 0 {
            error!(
                "Rotation for {} ended without replay; {} queued saves discarded",
                self.user, dropped
            );
        } else {
            warn!("Rotation guard for {} released without finish", self.user);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserId {
        UserId::new("alice")
    }

    #[test]
    fn test_open_gate_writes_immediately() {
        let gate = WriteGate::new();
        let admission = gate
            .submit(&user(), &DocumentId::new("d1"), b"text", Utc::now(), |p| {
                Ok(p.len())
            })
            .unwrap();
        assert!(matches!(admission, SaveAdmission::Written(4)));
    }

    #[test]
    fn test_write_error_propagates() {
        let gate = WriteGate::new();
        let result: Result<SaveAdmission<()>> =
            gate.submit(&user(), &DocumentId::new("d1"), b"text", Utc::now(), |_| {
                Err(Error::PersistenceConflict("moved".into()))
            });
        assert!(matches!(result, Err(Error::PersistenceConflict(_))));
    }

    #[test]
    fn test_second_rotation_rejected() {
        let gate = WriteGate::new();
        let guard = gate.begin(&user()).unwrap();
        assert!(gate.is_rotating(&user()));
        assert!(matches!(
            gate.begin(&user()),
            Err(Error::RotationInProgress(_))
        ));

        // Other users are unaffected
        let other = gate.begin(&UserId::new("bob")).unwrap();
        drop(other);

        guard.finish(|_| Ok(()));
        assert!(!gate.is_rotating(&user()));
        assert!(gate.begin(&user()).is_ok());
    }

    #[test]
    fn test_saves_pass_until_closed() {
        let gate = WriteGate::new();
        let guard = gate.begin(&user()).unwrap();

        let admission = gate
            .submit(&user(), &DocumentId::new("d1"), b"a", Utc::now(), |_| Ok(()))
            .unwrap();
        assert!(matches!(admission, SaveAdmission::Written(())));

        guard.close();
        let admission = gate
            .submit(&user(), &DocumentId::new("d1"), b"b", Utc::now(), |_| Ok(()))
            .unwrap();
        assert!(matches!(admission, SaveAdmission::Queued));
        assert_eq!(gate.queued(&user()), 1);

        guard.finish(|_| Ok(()));
    }

    #[test]
    fn test_finish_replays_in_order() {
        let gate = WriteGate::new();
        let guard = gate.begin(&user()).unwrap();
        guard.close();

        for (id, text) in [("d1", "one"), ("d2", "two"), ("d1", "three")] {
            gate.submit(&user(), &DocumentId::new(id), text.as_bytes(), Utc::now(), |_| {
                Ok(())
            })
            .unwrap();
        }

        let mut seen = Vec::new();
        let report = guard.finish(|save| {
            if save.document_id.as_str() == "d2" {
                return Err(Error::PersistenceConflict("gone".into()));
            }
            seen.push(String::from_utf8(save.plaintext.to_vec()).unwrap());
            Ok(())
        });

        assert_eq!(seen, vec!["one", "three"]);
        assert_eq!(report.replayed, 2);
        assert_eq!(report.failed, vec![DocumentId::new("d2")]);
        assert_eq!(gate.queued(&user()), 0);

        // Gate is open again
        let admission = gate
            .submit(&user(), &DocumentId::new("d3"), b"x", Utc::now(), |_| Ok(()))
            .unwrap();
        assert!(matches!(admission, SaveAdmission::Written(())));
    }

    #[test]
    fn test_drop_reopens_gate() {
        let gate = WriteGate::new();
        {
            let guard = gate.begin(&user()).unwrap();
            guard.close();
        }
        assert!(!gate.is_rotating(&user()));
        let admission = gate
            .submit(&user(), &DocumentId::new("d1"), b"x", Utc::now(), |_| Ok(()))
            .unwrap();
        assert!(matches!(admission, SaveAdmission::Written(())));
    }
}
