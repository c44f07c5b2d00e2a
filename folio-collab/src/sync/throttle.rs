//! Outgoing update throttle.
//!
//! Local edits accumulate per block and are flushed once `edit_threshold`
//! edits have piled up, once the block has been idle for `idle_flush`, or
//! unconditionally when the block loses focus.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::model::BlockId;

#[derive(Debug, Clone, Copy)]
struct Pending {
    edits: u32,
    last_edit: Instant,
}

#[derive(Debug, Clone)]
pub struct Throttle {
    edit_threshold: u32,
    idle_flush: Duration,
    pending: HashMap<BlockId, Pending>,
}

impl Throttle {
    pub fn new(edit_threshold: u32, idle_flush: Duration) -> Self {
        Self {
            edit_threshold: edit_threshold.max(1),
            idle_flush,
            pending: HashMap::new(),
        }
    }

    /// Count an edit. Returns true when the block should flush now, in which
    /// case its pending state is cleared.
    pub fn record(&mut self, block_id: &str, now: Instant) -> bool {
        let entry = self
            .pending
            .entry(block_id.to_string())
            .or_insert(Pending {
                edits: 0,
                last_edit: now,
            });
        entry.edits += 1;
        entry.last_edit = now;
        if entry.edits >= self.edit_threshold {
            self.pending.remove(block_id);
            return true;
        }
        false
    }

    /// Blocks idle long enough to flush. Their pending state is cleared.
    pub fn due(&mut self, now: Instant) -> Vec<BlockId> {
        let mut due: Vec<BlockId> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_edit) >= self.idle_flush)
            .map(|(id, _)| id.clone())
            .collect();
        due.sort();
        for id in &due {
            self.pending.remove(id);
        }
        due
    }

    /// Clear a block's pending state. Returns whether it had unsent edits.
    pub fn take(&mut self, block_id: &str) -> bool {
        self.pending.remove(block_id).is_some()
    }

    /// Every block with unsent edits, sorted. All pending state is cleared.
    pub fn drain(&mut self) -> Vec<BlockId> {
        let mut blocks: Vec<BlockId> = self.pending.drain().map(|(id, _)| id).collect();
        blocks.sort();
        blocks
    }

    pub fn is_pending(&self, block_id: &str) -> bool {
        self.pending.contains_key(block_id)
    }
}
