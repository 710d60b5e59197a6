//! Identity persistence boundary.
//!
//! Concurrency contract for implementations:
//! - every method is atomic with respect to a single identity record;
//! - `delete_by_id` on an absent id is a no-op, not an error;
//! - attempt records outlive their identity: deleting an identity keeps
//!   its records reachable through `attempt_history`;
//! - `promote` is atomic as a whole: no caller ever observes the new
//!   registered identity without its merged history, or the quarantine
//!   gone without the new identity in place. Its contact and face checks
//!   run inside the same write scope as the insert;
//! - `find_by_role` and `gallery` return identities in insertion order.

use crate::types::{AttemptRecord, GalleryEntry, Identity, IdentityId, Role};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity not found: {0}")]
    NotFound(IdentityId),
    #[error("identity already exists: {0}")]
    AlreadyExists(IdentityId),
    #[error("contact already registered: {0}")]
    DuplicateContact(String),
    #[error("face already registered as {0}")]
    DuplicateFace(IdentityId),
    #[error("attempt log of {0} is append-only")]
    AttemptLogRewrite(IdentityId),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Decides whether a new face is already registered, given the current
/// registered gallery. Returns the id of the existing owner.
pub type FaceGuard<'a> = &'a dyn Fn(&[GalleryEntry]) -> Option<IdentityId>;

/// Outcome of a registration write.
#[derive(Debug, Clone)]
pub struct Promotion {
    /// The stored registered identity, history already merged.
    pub identity: Identity,
    /// Quarantine id that was claimed, if it still existed.
    pub merged_from: Option<IdentityId>,
}

pub trait IdentityStore: Send + Sync {
    fn find_by_role(&self, role: Role) -> StoreResult<Vec<Identity>>;

    /// Registered ids and enrollment descriptors, without attempt history.
    fn gallery(&self) -> StoreResult<Vec<GalleryEntry>>;

    /// Look up a registered identity by its (normalized) contact.
    fn find_by_contact(&self, contact: &str) -> StoreResult<Option<Identity>>;

    fn get(&self, id: &IdentityId) -> StoreResult<Option<Identity>>;

    /// Every attempt record written under `id`, including those of a deleted identity.
    fn attempt_history(&self, id: &IdentityId) -> StoreResult<Vec<AttemptRecord>>;

    fn insert(&self, identity: &Identity) -> StoreResult<()>;

    fn delete_by_id(&self, id: &IdentityId) -> StoreResult<()>;

    /// Replace a stored identity. The new attempt log must extend the stored one.
    fn update(&self, identity: &Identity) -> StoreResult<()>;

    /// Append one attempt record, optionally bumping `last_seen_at` to its timestamp.
    fn record_attempt(
        &self,
        id: &IdentityId,
        record: AttemptRecord,
        touch_last_seen: bool,
    ) -> StoreResult<Identity>;

    /// Insert a registered identity and, when `quarantine_id` still names a
    /// quarantined identity, delete it and merge its attempt history in.
    ///
    /// Fails with `DuplicateFace` when `face_guard` finds the face in the
    /// registered gallery as it stands inside the write.
    fn promote(
        &self,
        registered: Identity,
        quarantine_id: Option<&IdentityId>,
        face_guard: FaceGuard<'_>,
    ) -> StoreResult<Promotion>;
}

/// Fold a quarantine's history into a freshly registered identity,
/// keeping chronological order.
pub fn merge_history(registered: &mut Identity, quarantine: Identity) {
    tracing::debug!(
        quarantine = %quarantine.id,
        identity = %registered.id,
        records = quarantine.attempt_log.len(),
        "merging quarantine history"
    );
    let mut log = quarantine.attempt_log;
    log.append(&mut registered.attempt_log);
    // Stable sort: equal timestamps keep quarantine-first order.
    log.sort_by_key(|r| r.timestamp);
    registered.attempt_log = log;
}

/// Check that `new` only appends to `old`'s attempt log.
pub fn ensure_append_only(old: &Identity, new: &Identity) -> StoreResult<()> {
    let extends = new.attempt_log.len() >= old.attempt_log.len()
        && new.attempt_log[..old.attempt_log.len()] == old.attempt_log[..];
    if extends {
        Ok(())
    } else {
        Err(StoreError::AttemptLogRewrite(old.id))
    }
}

#[derive(Default)]
struct MemoryState {
    /// Insertion order is the vector order.
    identities: Vec<Identity>,
    /// Records of deleted identities.
    orphaned_attempts: Vec<(IdentityId, AttemptRecord)>,
}

impl MemoryState {
    fn gallery(&self) -> Vec<GalleryEntry> {
        self.identities
            .iter()
            .filter(|i| i.is_registered())
            .map(GalleryEntry::from)
            .collect()
    }
}

/// In-process identity store.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {e}")))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {e}")))
    }
}

fn check_insertable(identities: &[Identity], identity: &Identity) -> StoreResult<()> {
    if identities.iter().any(|i| i.id == identity.id) {
        return Err(StoreError::AlreadyExists(identity.id));
    }
    if identity.is_registered()
        && identities
            .iter()
            .any(|i| i.is_registered() && i.contact == identity.contact)
    {
        return Err(StoreError::DuplicateContact(identity.contact.clone()));
    }
    Ok(())
}

impl IdentityStore for MemoryStore {
    fn find_by_role(&self, role: Role) -> StoreResult<Vec<Identity>> {
        Ok(self
            .read()?
            .identities
            .iter()
            .filter(|i| i.role == role)
            .cloned()
            .collect())
    }

    fn gallery(&self) -> StoreResult<Vec<GalleryEntry>> {
        Ok(self.read()?.gallery())
    }

    fn find_by_contact(&self, contact: &str) -> StoreResult<Option<Identity>> {
        Ok(self
            .read()?
            .identities
            .iter()
            .find(|i| i.is_registered() && i.contact == contact)
            .cloned())
    }

    fn get(&self, id: &IdentityId) -> StoreResult<Option<Identity>> {
        Ok(self.read()?.identities.iter().find(|i| i.id == *id).cloned())
    }

    fn attempt_history(&self, id: &IdentityId) -> StoreResult<Vec<AttemptRecord>> {
        let state = self.read()?;
        let mut history: Vec<AttemptRecord> = state
            .orphaned_attempts
            .iter()
            .filter(|(owner, _)| owner == id)
            .map(|(_, record)| record.clone())
            .collect();
        if let Some(live) = state.identities.iter().find(|i| i.id == *id) {
            history.extend(live.attempt_log.iter().cloned());
        }
        Ok(history)
    }

    fn insert(&self, identity: &Identity) -> StoreResult<()> {
        let mut state = self.write()?;
        check_insertable(&state.identities, identity)?;
        state.identities.push(identity.clone());
        Ok(())
    }

    fn delete_by_id(&self, id: &IdentityId) -> StoreResult<()> {
        let mut state = self.write()?;
        let Some(pos) = state.identities.iter().position(|i| i.id == *id) else {
            tracing::debug!(id = %id, "delete of absent identity ignored");
            return Ok(());
        };
        let removed = state.identities.remove(pos);
        state
            .orphaned_attempts
            .extend(removed.attempt_log.into_iter().map(|record| (removed.id, record)));
        Ok(())
    }

    fn update(&self, identity: &Identity) -> StoreResult<()> {
        let mut state = self.write()?;
        if identity.is_registered()
            && state
                .identities
                .iter()
                .any(|i| i.id != identity.id && i.is_registered() && i.contact == identity.contact)
        {
            return Err(StoreError::DuplicateContact(identity.contact.clone()));
        }
        let slot = state
            .identities
            .iter_mut()
            .find(|i| i.id == identity.id)
            .ok_or(StoreError::NotFound(identity.id))?;
        ensure_append_only(slot, identity)?;
        *slot = identity.clone();
        Ok(())
    }

    fn record_attempt(
        &self,
        id: &IdentityId,
        record: AttemptRecord,
        touch_last_seen: bool,
    ) -> StoreResult<Identity> {
        let mut state = self.write()?;
        let slot = state
            .identities
            .iter_mut()
            .find(|i| i.id == *id)
            .ok_or(StoreError::NotFound(*id))?;
        if touch_last_seen {
            slot.last_seen_at = record.timestamp;
        }
        slot.attempt_log.push(record);
        Ok(slot.clone())
    }

    fn promote(
        &self,
        mut registered: Identity,
        quarantine_id: Option<&IdentityId>,
        face_guard: FaceGuard<'_>,
    ) -> StoreResult<Promotion> {
        let mut state = self.write()?;
        check_insertable(&state.identities, &registered)?;
        if let Some(owner) = face_guard(&state.gallery()) {
            return Err(StoreError::DuplicateFace(owner));
        }

        let identities = &mut state.identities;
        let claimed = quarantine_id.and_then(|qid| {
            identities
                .iter()
                .position(|i| i.id == *qid && i.role == Role::Quarantined)
                .map(|pos| identities.remove(pos))
        });
        let merged_from = claimed.as_ref().map(|q| q.id);
        if let Some(quarantine) = claimed {
            merge_history(&mut registered, quarantine);
        }

        identities.push(registered.clone());
        Ok(Promotion {
            identity: registered,
            merged_from,
        })
    }
}
