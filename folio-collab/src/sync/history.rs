//! Per-block undo/redo stacks.

use std::collections::VecDeque;

/// A content snapshot stamped with the global op sequence it was taken at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub content: String,
    pub seq: u64,
}

/// Bounded undo and redo stacks for one block. The oldest undo entry is
/// evicted when the limit is exceeded.
#[derive(Debug, Clone)]
pub struct BlockHistory {
    undo: VecDeque<Snapshot>,
    redo: Vec<Snapshot>,
    limit: usize,
}

impl BlockHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: Vec::new(),
            limit: limit.max(1),
        }
    }

    /// Record that the block moved away from `previous`. Ignored when
    /// `previous` equals the top of the undo stack.
    pub fn record(&mut self, previous: &str, seq: u64) -> bool {
        if self.undo.back().is_some_and(|top| top.content == previous) {
            return false;
        }
        self.undo.push_back(Snapshot {
            content: previous.to_string(),
            seq,
        });
        if self.undo.len() > self.limit {
            self.undo.pop_front();
        }
        self.redo.clear();
        true
    }

    /// Step back: returns the content to restore, stashing `current` for redo.
    pub fn undo(&mut self, current: &str, seq: u64) -> Option<String> {
        let snapshot = self.undo.pop_back()?;
        self.redo.push(Snapshot {
            content: current.to_string(),
            seq,
        });
        Some(snapshot.content)
    }

    pub fn redo(&mut self, current: &str, seq: u64) -> Option<String> {
        let snapshot = self.redo.pop()?;
        self.undo.push_back(Snapshot {
            content: current.to_string(),
            seq,
        });
        if self.undo.len() > self.limit {
            self.undo.pop_front();
        }
        Some(snapshot.content)
    }

    /// Sequence number of the next undo step, if any.
    pub fn undo_seq(&self) -> Option<u64> {
        self.undo.back().map(|s| s.seq)
    }

    pub fn redo_seq(&self) -> Option<u64> {
        self.redo.last().map(|s| s.seq)
    }

    pub fn clear_redo(&mut self) {
        self.redo.clear();
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.undo.is_empty() && self.redo.is_empty()
    }
}
