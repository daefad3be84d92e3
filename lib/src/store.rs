//! The in-process collection of owned notes.
//!
//! Single-writer: the engine owns the store behind one mutex and never
//! holds it across a suspension point. Every mutation is pushed through
//! the persistence capability before it is allowed to stick; a failed
//! save rolls the in-memory state back so disk and memory never diverge.

use std::collections::{BTreeMap, VecDeque};

use alloy::primitives::{B256, U256};
use ark_bn254::Fr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PersistError, StoreError};
use crate::field::{fr_to_bytes, FrHex};
use crate::note::{Note, TokenInfo};

/// Cap of the persisted notification-dedup set.
pub const DEDUP_CAP: usize = 100;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Dedup key for discovery notifications.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenKey {
    pub commitment: FrHex,
    pub tx_hash: B256,
}

/// A spent note kept for audit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchivedNote {
    pub note: Note,
    pub nullifier: FrHex,
    pub spent_at: DateTime<Utc>,
}

/// Everything the store persists, in one versioned blob.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub notes: Vec<Note>,
    pub archive: Vec<ArchivedNote>,
    pub last_root: Option<FrHex>,
    pub seen: Vec<SeenKey>,
}

impl Default for StoreSnapshot {
    fn default() -> Self {
        StoreSnapshot {
            version: SNAPSHOT_VERSION,
            notes: Vec::new(),
            archive: Vec::new(),
            last_root: None,
            seen: Vec::new(),
        }
    }
}

/// Storage capability handed in by the host. The store does not know or
/// care whether this is an encrypted file, a keychain, or a test double.
pub trait Persistence: Send + Sync {
    fn load(&self) -> Result<Option<StoreSnapshot>, PersistError>;
    fn save(&self, snapshot: &StoreSnapshot) -> Result<(), PersistError>;
}

#[derive(Clone, Default)]
struct Inner {
    /// Active notes keyed by commitment bytes.
    notes: BTreeMap<[u8; 32], Note>,
    archive: Vec<ArchivedNote>,
    last_root: Option<Fr>,
    seen: VecDeque<SeenKey>,
}

pub struct NoteStore {
    inner: Inner,
    persistence: Box<dyn Persistence>,
}

impl NoteStore {
    /// Open the store, loading whatever the capability has.
    pub fn open(persistence: Box<dyn Persistence>) -> Result<Self, StoreError> {
        let mut inner = Inner::default();
        if let Some(snapshot) = persistence.load()? {
            for note in snapshot.notes {
                inner.notes.insert(fr_to_bytes(&note.commitment()), note);
            }
            inner.archive = snapshot.archive;
            inner.last_root = snapshot.last_root.map(|r| r.0);
            inner.seen = snapshot.seen.into();
        }
        Ok(NoteStore { inner, persistence })
    }

    fn snapshot_of(inner: &Inner) -> StoreSnapshot {
        StoreSnapshot {
            version: SNAPSHOT_VERSION,
            notes: inner.notes.values().cloned().collect(),
            archive: inner.archive.clone(),
            last_root: inner.last_root.map(FrHex),
            seen: inner.seen.iter().cloned().collect(),
        }
    }

    /// Run a mutation transactionally: save must succeed or the change is
    /// rolled back.
    fn with_txn<T>(
        &mut self,
        mutate: impl FnOnce(&mut Inner) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let backup = self.inner.clone();
        let out = match mutate(&mut self.inner) {
            Ok(out) => out,
            Err(e) => {
                self.inner = backup;
                return Err(e);
            }
        };
        if let Err(e) = self.persistence.save(&Self::snapshot_of(&self.inner)) {
            self.inner = backup;
            return Err(StoreError::Persistence(e));
        }
        Ok(out)
    }

    /// Insert a note that has no leaf index yet. Re-adding the same
    /// commitment is a no-op.
    pub fn add_pending(&mut self, note: Note) -> Result<(), StoreError> {
        let key = fr_to_bytes(&note.commitment());
        if self.inner.notes.contains_key(&key) {
            return Ok(());
        }
        self.with_txn(move |inner| {
            inner.notes.insert(key, note);
            Ok(())
        })
    }

    /// Record the on-chain leaf index of a pending note. Idempotent for
    /// the same `(commitment, leaf_index)`; a different index for an
    /// already-confirmed note is an invariant violation.
    pub fn confirm(&mut self, commitment: Fr, leaf_index: u32, root: Fr) -> Result<(), StoreError> {
        let key = fr_to_bytes(&commitment);
        match self.inner.notes.get(&key) {
            None => return Err(StoreError::UnknownNote),
            Some(note) => match note.leaf_index {
                Some(existing) if existing == leaf_index => return Ok(()),
                Some(existing) => {
                    return Err(StoreError::InvariantViolation(format!(
                        "leaf index is immutable: note confirmed at {existing}, re-confirmed at {leaf_index}"
                    )))
                }
                None => {}
            },
        }
        self.with_txn(move |inner| {
            if let Some(note) = inner.notes.get_mut(&key) {
                note.leaf_index = Some(leaf_index);
            }
            inner.last_root = Some(root);
            Ok(())
        })
    }

    /// Move a note to the archive once its nullifier is on-chain.
    /// Unknown or already-archived commitments are a no-op.
    pub fn mark_spent(&mut self, commitment: Fr, nullifier: Fr) -> Result<(), StoreError> {
        let key = fr_to_bytes(&commitment);
        if !self.inner.notes.contains_key(&key) {
            return Ok(());
        }
        self.with_txn(move |inner| {
            if let Some(note) = inner.notes.remove(&key) {
                inner.archive.push(ArchivedNote {
                    note,
                    nullifier: FrHex(nullifier),
                    spent_at: Utc::now(),
                });
            }
            Ok(())
        })
    }

    /// Unconditional eviction, used when the chain reports a nullifier as
    /// already spent: the note is unusable whatever our records say.
    pub fn evict(&mut self, commitment: Fr, nullifier: Fr) -> Result<(), StoreError> {
        self.mark_spent(commitment, nullifier)
    }

    pub fn note(&self, commitment: Fr) -> Option<&Note> {
        self.inner.notes.get(&fr_to_bytes(&commitment))
    }

    pub fn notes(&self) -> Vec<Note> {
        self.inner.notes.values().cloned().collect()
    }

    pub fn archive(&self) -> &[ArchivedNote] {
        &self.inner.archive
    }

    /// Sum of unspent amounts matching the token.
    pub fn balance(&self, token: &TokenInfo) -> U256 {
        self.inner
            .notes
            .values()
            .filter(|n| n.matches_token(token))
            .fold(U256::ZERO, |acc, n| acc + n.amount)
    }

    pub fn notes_for_token(&self, token: &TokenInfo) -> Vec<Note> {
        self.inner
            .notes
            .values()
            .filter(|n| n.matches_token(token))
            .cloned()
            .collect()
    }

    /// Notes the planner may choose from: confirmed and carrying value.
    pub fn spendable_notes(&self, token: &TokenInfo) -> Vec<Note> {
        self.inner
            .notes
            .values()
            .filter(|n| n.matches_token(token) && n.is_spendable())
            .cloned()
            .collect()
    }

    pub fn note_by_leaf(&self, leaf_index: u32) -> Option<&Note> {
        self.inner
            .notes
            .values()
            .find(|n| n.leaf_index == Some(leaf_index))
    }

    pub fn last_root(&self) -> Option<Fr> {
        self.inner.last_root
    }

    // -- notification dedup ----------------------------------------------

    pub fn seen_contains(&self, key: &SeenKey) -> bool {
        self.inner.seen.contains(key)
    }

    /// Record a dedup key, evicting the oldest past the cap.
    pub fn record_seen(&mut self, key: SeenKey) -> Result<(), StoreError> {
        if self.inner.seen.contains(&key) {
            return Ok(());
        }
        self.with_txn(move |inner| {
            if inner.seen.len() == DEDUP_CAP {
                inner.seen.pop_front();
            }
            inner.seen.push_back(key);
            Ok(())
        })
    }

    /// Full snapshot, for backup export.
    pub fn snapshot(&self) -> StoreSnapshot {
        Self::snapshot_of(&self.inner)
    }

    /// Replace the whole state from a snapshot (restore path).
    pub fn restore(&mut self, snapshot: StoreSnapshot) -> Result<(), StoreError> {
        self.with_txn(move |inner| {
            inner.notes = snapshot
                .notes
                .into_iter()
                .map(|n| (fr_to_bytes(&n.commitment()), n))
                .collect();
            inner.archive = snapshot.archive;
            inner.last_root = snapshot.last_root.map(|r| r.0);
            inner.seen = snapshot.seen.into();
            Ok(())
        })
    }
}
