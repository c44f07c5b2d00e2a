//! Per-document block lock table.
//!
//! Each block is either unlocked or locked by exactly one session:
//! ```text
//!   Unlocked ──acquire(s)──► Locked(s) ──release(s)──► Unlocked
//!                              │  ▲
//!                              └──┘ acquire(s) again: AlreadyHeld
//! ```
//! Acquisition never waits. A conflicting request gets `Denied` back at once.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::model::{now_millis, BlockId, Participant, SessionId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub block_id: BlockId,
    pub holder: SessionId,
    pub holder_name: String,
    /// Milliseconds since epoch.
    pub acquired_at: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    Acquired(Lock),
    /// The requester already held the lock.
    AlreadyHeld(Lock),
    Denied { holder: Lock },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReleaseOutcome {
    Released(Lock),
    /// Someone else holds it; nothing changed.
    HeldByOther(Lock),
    NotLocked,
}

#[derive(Debug, Default)]
pub struct LockManager {
    locks: HashMap<BlockId, Lock>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self, block_id: &str, who: &Participant) -> AcquireOutcome {
        if let Some(lock) = self.locks.get(block_id) {
            return if lock.holder == who.session_id {
                AcquireOutcome::AlreadyHeld(lock.clone())
            } else {
                AcquireOutcome::Denied {
                    holder: lock.clone(),
                }
            };
        }
        let lock = Lock {
            block_id: block_id.to_string(),
            holder: who.session_id,
            holder_name: who.display_name.clone(),
            acquired_at: now_millis(),
        };
        self.locks.insert(lock.block_id.clone(), lock.clone());
        AcquireOutcome::Acquired(lock)
    }

    pub fn release(&mut self, block_id: &str, session_id: SessionId) -> ReleaseOutcome {
        match self.locks.get(block_id) {
            None => ReleaseOutcome::NotLocked,
            Some(lock) if lock.holder != session_id => ReleaseOutcome::HeldByOther(lock.clone()),
            Some(_) => match self.locks.remove(block_id) {
                Some(lock) => ReleaseOutcome::Released(lock),
                None => ReleaseOutcome::NotLocked,
            },
        }
    }

    /// Release every lock held by `session_id`, ordered by block id.
    pub fn release_all(&mut self, session_id: SessionId) -> Vec<Lock> {
        let mut released: Vec<Lock> = Vec::new();
        self.locks.retain(|_, lock| {
            if lock.holder == session_id {
                released.push(lock.clone());
                false
            } else {
                true
            }
        });
        released.sort_by(|a, b| a.block_id.cmp(&b.block_id));
        released
    }

    pub fn holder(&self, block_id: &str) -> Option<&Lock> {
        self.locks.get(block_id)
    }

    pub fn is_held_by(&self, block_id: &str, session_id: SessionId) -> bool {
        self.locks
            .get(block_id)
            .is_some_and(|lock| lock.holder == session_id)
    }

    /// Keep holder names on outstanding locks current after a rename.
    pub fn rename_holder(&mut self, who: &Participant) {
        for lock in self.locks.values_mut() {
            if lock.holder == who.session_id {
                lock.holder_name = who.display_name.clone();
            }
        }
    }

    /// Drop the lock on a block that no longer exists.
    pub fn remove_block(&mut self, block_id: &str) -> Option<Lock> {
        self.locks.remove(block_id)
    }

    /// Snapshot of all locks, ordered by block id.
    pub fn locks(&self) -> Vec<Lock> {
        let mut locks: Vec<Lock> = self.locks.values().cloned().collect();
        locks.sort_by(|a, b| a.block_id.cmp(&b.block_id));
        locks
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
