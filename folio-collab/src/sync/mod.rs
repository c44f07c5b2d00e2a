//! Client-side synchronization engine.
//!
//! A pure state machine: the application feeds it local input (`focus`,
//! `edit`, `blur`, `undo`, `redo`, `tick`) and server messages (`apply`), and
//! drains the client messages it wants sent. It never does I/O, so it can be
//! driven by `CollabClient` events or by tests directly.
//!
//! Lock state per block moves only on server events. Local intent is
//! recorded as `Requesting` until the server confirms or denies.

pub mod history;
pub mod throttle;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::client::ClientEvent;
use crate::model::{Block, BlockId, BlockMetadata, BlockType, DocumentId, SessionId};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::structure;

pub use history::BlockHistory;
pub use throttle::Throttle;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Undo entries kept per block
    pub history_limit: usize,
    /// Local edits accumulated before an update is sent
    pub edit_threshold: u32,
    /// Idle time after which pending edits are sent
    pub idle_flush: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            history_limit: 50,
            edit_threshold: 20,
            idle_flush: Duration::from_secs(10),
        }
    }
}

/// This client's view of its own lock on a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Requesting,
    Held,
    Denied { holder: String },
    Released,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("nothing to undo")]
    NothingToUndo,

    #[error("nothing to redo")]
    NothingToRedo,

    #[error("block {block_id} is locked by {holder}")]
    LockedElsewhere { block_id: BlockId, holder: String },

    #[error("block {block_id} is not locked by this client")]
    NotHeld { block_id: BlockId },

    #[error("no document is open")]
    NoDocument,
}

pub type SyncResult<T> = Result<T, SyncError>;

/// A history step on a block we do not hold, waiting for its lock.
#[derive(Debug, Clone)]
struct PendingStep {
    /// Content to commit once the lock is ours. `None` once a remote update
    /// superseded the step; the lock is then just handed back.
    restored: Option<String>,
    /// Content to show again if the lock is denied.
    previous: String,
}

/// Position of a table-structural block.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TablePart {
    Options { table_id: BlockId },
    Cell { table_id: BlockId, row: u32, col: u32 },
}

/// Which way a history step goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Undo,
    Redo,
}

pub struct SyncEngine {
    config: SyncConfig,
    session_id: Option<SessionId>,
    document_id: Option<DocumentId>,
    locks: HashMap<BlockId, LockState>,
    /// Blocks held by other sessions, with the holder's display name.
    remote_locks: HashMap<BlockId, String>,
    content: HashMap<BlockId, String>,
    histories: HashMap<BlockId, BlockHistory>,
    table_parts: HashMap<BlockId, TablePart>,
    /// Global op sequence across all blocks.
    op_seq: u64,
    throttle: Throttle,
    focused: Option<BlockId>,
    /// History steps waiting for a lock before a synthetic update/unlock.
    synthetic: HashMap<BlockId, PendingStep>,
    outgoing: Vec<ClientMessage>,
}

impl SyncEngine {
    pub fn new(config: SyncConfig) -> Self {
        let throttle = Throttle::new(config.edit_threshold, config.idle_flush);
        Self {
            config,
            session_id: None,
            document_id: None,
            locks: HashMap::new(),
            remote_locks: HashMap::new(),
            content: HashMap::new(),
            histories: HashMap::new(),
            table_parts: HashMap::new(),
            op_seq: 0,
            throttle,
            focused: None,
            synthetic: HashMap::new(),
            outgoing: Vec::new(),
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn document_id(&self) -> Option<DocumentId> {
        self.document_id
    }

    pub fn lock_state(&self, block_id: &str) -> Option<&LockState> {
        self.locks.get(block_id)
    }

    /// Display name of the other session holding `block_id`, if any.
    pub fn remote_holder(&self, block_id: &str) -> Option<&str> {
        self.remote_locks.get(block_id).map(String::as_str)
    }

    pub fn content(&self, block_id: &str) -> Option<&str> {
        self.content.get(block_id).map(String::as_str)
    }

    /// `(row, col)` of a table cell.
    pub fn cell_position(&self, block_id: &str) -> Option<(u32, u32)> {
        match self.table_parts.get(block_id)? {
            TablePart::Cell { row, col, .. } => Some((*row, *col)),
            TablePart::Options { .. } => None,
        }
    }

    /// Id of the options block of `table_id`, when known.
    pub fn options_block(&self, table_id: &str) -> Option<&str> {
        self.table_parts.iter().find_map(|(id, part)| match part {
            TablePart::Options { table_id: t } if t == table_id => Some(id.as_str()),
            _ => None,
        })
    }

    pub fn focused(&self) -> Option<&str> {
        self.focused.as_deref()
    }

    pub fn can_undo(&self) -> bool {
        self.histories.values().any(|h| h.undo_seq().is_some())
    }

    pub fn can_redo(&self) -> bool {
        self.histories.values().any(|h| h.redo_seq().is_some())
    }

    /// Messages queued for the server since the last drain.
    pub fn drain_outgoing(&mut self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.outgoing)
    }

    fn require_document(&self) -> SyncResult<DocumentId> {
        self.document_id.ok_or(SyncError::NoDocument)
    }

    /// Ask for a document's snapshot. State from a previous document is dropped.
    pub fn open(&mut self, document_id: DocumentId) {
        self.reset_document(document_id);
        self.outgoing.push(ClientMessage::OpenDocument { document_id });
    }

    fn reset_document(&mut self, document_id: DocumentId) {
        self.document_id = Some(document_id);
        self.locks.clear();
        self.remote_locks.clear();
        self.content.clear();
        self.histories.clear();
        self.table_parts.clear();
        self.synthetic.clear();
        self.focused = None;
        self.throttle = Throttle::new(self.config.edit_threshold, self.config.idle_flush);
    }

    /// Cache a block's content and, for table parts, where it sits.
    fn track(&mut self, block: &Block) {
        self.content
            .insert(block.block_id.clone(), block.content.clone());
        let Some(table_id) = block.parent_block_id.clone() else {
            return;
        };
        let part = match (block.block_type, block.row_index, block.col_index) {
            (BlockType::TableOptions, _, _) => TablePart::Options { table_id },
            (BlockType::TableCell, Some(row), Some(col)) => TablePart::Cell { table_id, row, col },
            _ => return,
        };
        self.table_parts.insert(block.block_id.clone(), part);
    }

    fn forget(&mut self, block_id: &str) {
        self.content.remove(block_id);
        self.histories.remove(block_id);
        self.table_parts.remove(block_id);
        self.locks.remove(block_id);
        self.remote_locks.remove(block_id);
        self.synthetic.remove(block_id);
        self.throttle.take(block_id);
        if self.focused.as_deref() == Some(block_id) {
            self.focused = None;
        }
    }

    /// Feed an event from `CollabClient`.
    pub fn handle_event(&mut self, event: &ClientEvent) {
        match event {
            ClientEvent::Message(message) => self.apply(message),
            ClientEvent::Disconnected | ClientEvent::GaveUp => self.connection_lost(),
            ClientEvent::Connected => {}
        }
    }

    /// The server released everything this client held when the connection
    /// dropped. Own lock states, waiting history steps, unsent edits and
    /// queued messages go with it; cached content stays until the next
    /// snapshot.
    pub fn connection_lost(&mut self) {
        let unsent = self.throttle.drain();
        if !unsent.is_empty() {
            log::warn!("Dropping unsent edits on {} blocks", unsent.len());
        }
        for (block_id, step) in self.synthetic.drain() {
            self.content.insert(block_id, step.previous);
        }
        self.locks.clear();
        self.focused = None;
        self.outgoing.clear();
    }

    /// Ask for a fresh snapshot of the open document.
    fn resync(&mut self) {
        if let Some(document_id) = self.document_id {
            log::info!("Resynchronising document {document_id}");
            self.outgoing.push(ClientMessage::OpenDocument { document_id });
        }
    }

    /// Start editing a block: blur the previous one and request the lock.
    pub fn focus(&mut self, block_id: &str) -> SyncResult<()> {
        let document_id = self.require_document()?;
        if self.focused.as_deref() == Some(block_id) {
            return Ok(());
        }
        if let Some(holder) = self.remote_locks.get(block_id) {
            return Err(SyncError::LockedElsewhere {
                block_id: block_id.to_string(),
                holder: holder.clone(),
            });
        }
        if let Some(previous) = self.focused.clone() {
            self.blur(&previous)?;
        }
        self.focused = Some(block_id.to_string());
        match self.locks.get(block_id) {
            Some(LockState::Held) | Some(LockState::Requesting) => {}
            _ => {
                self.locks.insert(block_id.to_string(), LockState::Requesting);
                self.outgoing.push(ClientMessage::LockBlock {
                    document_id,
                    block_id: block_id.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Stop editing a block: flush pending edits, then release the lock.
    pub fn blur(&mut self, block_id: &str) -> SyncResult<()> {
        let document_id = self.require_document()?;
        if self.focused.as_deref() == Some(block_id) {
            self.focused = None;
        }
        if self.throttle.take(block_id) {
            self.push_update(document_id, block_id);
        }
        if matches!(
            self.locks.get(block_id),
            Some(LockState::Held) | Some(LockState::Requesting)
        ) {
            self.outgoing.push(ClientMessage::UnlockBlock {
                document_id,
                block_id: block_id.to_string(),
            });
        }
        Ok(())
    }

    /// Apply a local edit to a held block.
    pub fn edit(&mut self, block_id: &str, content: &str, now: Instant) -> SyncResult<()> {
        let document_id = self.require_document()?;
        if self.locks.get(block_id) != Some(&LockState::Held) {
            return Err(SyncError::NotHeld {
                block_id: block_id.to_string(),
            });
        }
        let previous = self.content.get(block_id).cloned().unwrap_or_default();
        if previous == content {
            return Ok(());
        }

        self.op_seq += 1;
        let limit = self.config.history_limit;
        self.histories
            .entry(block_id.to_string())
            .or_insert_with(|| BlockHistory::new(limit))
            .record(&previous, self.op_seq);
        self.content.insert(block_id.to_string(), content.to_string());

        if self.throttle.record(block_id, now) {
            self.push_update(document_id, block_id);
        }
        Ok(())
    }

    /// Send updates for blocks that have been idle long enough.
    pub fn tick(&mut self, now: Instant) {
        let Some(document_id) = self.document_id else {
            return;
        };
        for block_id in self.throttle.due(now) {
            log::debug!("Idle flush of {block_id}");
            self.push_update(document_id, &block_id);
        }
    }

    fn push_update(&mut self, document_id: DocumentId, block_id: &str) {
        let content = self.content.get(block_id).cloned().unwrap_or_default();
        self.outgoing.push(ClientMessage::UpdateDocument {
            document_id,
            block_id: block_id.to_string(),
            content,
            metadata: BlockMetadata::default(),
        });
    }

    /// Undo the most recent local change across all blocks. Returns the
    /// block it applied to.
    pub fn undo(&mut self) -> SyncResult<BlockId> {
        self.step(Step::Undo)
    }

    pub fn redo(&mut self) -> SyncResult<BlockId> {
        self.step(Step::Redo)
    }

    fn step(&mut self, step: Step) -> SyncResult<BlockId> {
        let document_id = self.require_document()?;
        let target = self
            .histories
            .iter()
            .filter_map(|(id, h)| {
                let seq = match step {
                    Step::Undo => h.undo_seq(),
                    Step::Redo => h.redo_seq(),
                }?;
                Some((seq, id.clone()))
            })
            .max();
        let Some((_, block_id)) = target else {
            return Err(match step {
                Step::Undo => SyncError::NothingToUndo,
                Step::Redo => SyncError::NothingToRedo,
            });
        };

        let held = self.locks.get(&block_id) == Some(&LockState::Held);
        if !held {
            if let Some(holder) = self.remote_locks.get(&block_id) {
                return Err(SyncError::LockedElsewhere {
                    block_id,
                    holder: holder.clone(),
                });
            }
        }

        self.op_seq += 1;
        let current = self.content.get(&block_id).cloned().unwrap_or_default();
        let Some(history) = self.histories.get_mut(&block_id) else {
            return Err(SyncError::NothingToUndo);
        };
        let restored = match step {
            Step::Undo => history.undo(&current, self.op_seq),
            Step::Redo => history.redo(&current, self.op_seq),
        };
        let Some(restored) = restored else {
            return Err(match step {
                Step::Undo => SyncError::NothingToUndo,
                Step::Redo => SyncError::NothingToRedo,
            });
        };
        self.content.insert(block_id.clone(), restored.clone());

        if held {
            self.throttle.take(&block_id);
            self.push_update(document_id, &block_id);
        } else {
            // lock, commit, unlock once the lock is confirmed
            self.synthetic.insert(
                block_id.clone(),
                PendingStep {
                    restored: Some(restored),
                    previous: current,
                },
            );
            self.locks.insert(block_id.clone(), LockState::Requesting);
            self.outgoing.push(ClientMessage::LockBlock {
                document_id,
                block_id: block_id.clone(),
            });
        }
        Ok(block_id)
    }

    /// Drop a block's undo/redo history.
    fn invalidate(&mut self, block_id: &str) {
        if let Some(history) = self.histories.get_mut(block_id) {
            if !history.is_empty() {
                log::debug!("History of {block_id} invalidated");
            }
            history.clear();
        }
    }

    fn is_own(&self, session_id: SessionId) -> bool {
        self.session_id == Some(session_id)
    }

    /// Fold a server message into the local state.
    pub fn apply(&mut self, message: &ServerMessage) {
        match message {
            ServerMessage::SessionAck { session_id, .. } => {
                let previous = self.session_id.replace(*session_id);
                if previous.is_some_and(|p| p != *session_id) {
                    log::info!("Now session {session_id}; locks of the old session are gone");
                    self.connection_lost();
                    self.resync();
                }
            }

            ServerMessage::DocumentSnapshot {
                document,
                blocks,
                locks,
                ..
            } => {
                self.reset_document(document.document_id);
                for block in blocks {
                    self.track(block);
                }
                for lock in locks {
                    if self.is_own(lock.holder) {
                        self.locks.insert(lock.block_id.clone(), LockState::Held);
                    } else {
                        self.remote_locks
                            .insert(lock.block_id.clone(), lock.holder_name.clone());
                    }
                }
            }

            ServerMessage::BlockLocked {
                block_id,
                locked_by,
                session_id,
                ..
            } => {
                if self.is_own(*session_id) {
                    self.remote_locks.remove(block_id);
                    self.locks.insert(block_id.clone(), LockState::Held);
                    if let Some(step) = self.synthetic.remove(block_id) {
                        self.finish_synthetic(block_id, step.restored);
                    }
                } else {
                    self.remote_locks.insert(block_id.clone(), locked_by.clone());
                    self.invalidate(block_id);
                }
            }

            ServerMessage::BlockUnlocked {
                block_id,
                session_id,
                ..
            } => {
                if self.is_own(*session_id) {
                    self.locks.insert(block_id.clone(), LockState::Released);
                } else {
                    self.remote_locks.remove(block_id);
                }
            }

            ServerMessage::LockDenied {
                block_id,
                locked_by,
                ..
            } => {
                self.locks.insert(
                    block_id.clone(),
                    LockState::Denied {
                        holder: locked_by.clone(),
                    },
                );
                self.remote_locks.insert(block_id.clone(), locked_by.clone());
                if let Some(step) = self.synthetic.remove(block_id) {
                    log::warn!("History step on {block_id} abandoned: locked by {locked_by}");
                    self.content.insert(block_id.clone(), step.previous);
                }
                if self.focused.as_deref() == Some(block_id.as_str()) {
                    self.focused = None;
                }
                self.invalidate(block_id);
            }

            ServerMessage::DocumentUpdated {
                block_id,
                content_html,
                session_id,
                ..
            } => {
                self.content.insert(block_id.clone(), content_html.clone());
                if !self.is_own(*session_id) {
                    self.superseded(block_id, content_html);
                }
            }

            ServerMessage::TableOptionsUpdated {
                table_id,
                options_json,
                ..
            } => {
                let options_id = self
                    .options_block(table_id)
                    .map(str::to_string)
                    .unwrap_or_else(|| structure::options_block_id(table_id));
                self.content.insert(options_id.clone(), options_json.clone());
                self.superseded(&options_id, options_json);
            }

            ServerMessage::BlockAdded { added_blocks, .. } => {
                for block in added_blocks {
                    self.track(block);
                }
            }

            ServerMessage::TableRowAdded {
                added_blocks,
                shifted,
                ..
            } => {
                for shift in shifted {
                    if let Some(TablePart::Cell { row, .. }) = self.table_parts.get_mut(&shift.block_id) {
                        *row = shift.row_index;
                    }
                }
                for block in added_blocks {
                    self.track(block);
                }
            }

            ServerMessage::BlockDeleted {
                block_id,
                removed_block_ids,
                ..
            } => {
                for id in std::iter::once(block_id).chain(removed_block_ids) {
                    self.forget(id);
                }
            }

            ServerMessage::Error {
                error_code,
                error_message,
            } if error_code == "lagged" => {
                log::warn!("Missed server events: {error_message}");
                // the locks are still ours, so unsent edits can go first
                if let Some(document_id) = self.document_id {
                    for block_id in self.throttle.drain() {
                        self.push_update(document_id, &block_id);
                    }
                }
                self.resync();
            }

            ServerMessage::Error { error_message, .. } => {
                log::warn!("Server reported: {error_message}");
            }

            _ => {}
        }
    }

    /// Someone else changed `block_id`: drop its history and pending edits,
    /// and turn a waiting history step into a plain lock hand-back.
    fn superseded(&mut self, block_id: &str, content: &str) {
        self.throttle.take(block_id);
        self.invalidate(block_id);
        if let Some(step) = self.synthetic.get_mut(block_id) {
            log::debug!("History step on {block_id} superseded by a remote update");
            step.restored = None;
            step.previous = content.to_string();
        }
    }

    fn finish_synthetic(&mut self, block_id: &str, content: Option<String>) {
        let Some(document_id) = self.document_id else {
            return;
        };
        if let Some(content) = content {
            log::debug!("Committing history step on {block_id} under a synthetic lock");
            self.outgoing.push(ClientMessage::UpdateDocument {
                document_id,
                block_id: block_id.to_string(),
                content,
                metadata: BlockMetadata::default(),
            });
            if let Some(history) = self.histories.get_mut(block_id) {
                history.clear_redo();
            }
        }
        self.outgoing.push(ClientMessage::UnlockBlock {
            document_id,
            block_id: block_id.to_string(),
        });
    }
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new(SyncConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::Lock;
    use crate::model::{CellShift, Document};
    use uuid::Uuid;

    struct Fixture {
        engine: SyncEngine,
        me: SessionId,
        other: SessionId,
        doc: DocumentId,
    }

    fn fixture(config: SyncConfig) -> Fixture {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let document = Document::new("Doc");
        let doc = document.document_id;
        let mut engine = SyncEngine::new(config);
        engine.apply(&ServerMessage::SessionAck {
            session_id: me,
            username: "Ann".into(),
        });
        engine.apply(&ServerMessage::DocumentSnapshot {
            document,
            blocks: vec![
                Block::new(doc, "b1", BlockType::Text, "", 0),
                Block::new(doc, "b2", BlockType::Text, "two", 1024),
            ],
            locks: vec![],
            latest_version: 0,
        });
        Fixture {
            engine,
            me,
            other,
            doc,
        }
    }

    fn locked(f: &Fixture, block_id: &str, session_id: SessionId, name: &str) -> ServerMessage {
        ServerMessage::BlockLocked {
            document_id: f.doc,
            block_id: block_id.into(),
            locked_by: name.into(),
            session_id,
        }
    }

    fn unlocked(f: &Fixture, block_id: &str, session_id: SessionId) -> ServerMessage {
        ServerMessage::BlockUnlocked {
            document_id: f.doc,
            block_id: block_id.into(),
            unlocked_by: "x".into(),
            session_id,
        }
    }

    fn updated(f: &Fixture, block_id: &str, content: &str, session_id: SessionId) -> ServerMessage {
        ServerMessage::DocumentUpdated {
            document_id: f.doc,
            block_id: block_id.into(),
            version_id: 1,
            content_html: content.into(),
            metadata: BlockMetadata::default(),
            updated_by: "x".into(),
            session_id,
        }
    }

    fn hold(f: &mut Fixture, block_id: &str) {
        f.engine.focus(block_id).unwrap();
        let msg = locked(f, block_id, f.me, "Ann");
        f.engine.apply(&msg);
        f.engine.drain_outgoing();
    }

    #[test]
    fn test_lock_state_follows_server_events() {
        let mut f = fixture(SyncConfig::default());
        f.engine.focus("b1").unwrap();
        assert_eq!(f.engine.lock_state("b1"), Some(&LockState::Requesting));
        assert!(matches!(
            f.engine.drain_outgoing().as_slice(),
            [ClientMessage::LockBlock { block_id, .. }] if block_id == "b1"
        ));

        let msg = locked(&f, "b1", f.me, "Ann");
        f.engine.apply(&msg);
        assert_eq!(f.engine.lock_state("b1"), Some(&LockState::Held));

        f.engine.blur("b1").unwrap();
        // still held until the server confirms
        assert_eq!(f.engine.lock_state("b1"), Some(&LockState::Held));
        let msg = unlocked(&f, "b1", f.me);
        f.engine.apply(&msg);
        assert_eq!(f.engine.lock_state("b1"), Some(&LockState::Released));
    }

    #[test]
    fn test_denied_records_holder() {
        let mut f = fixture(SyncConfig::default());
        f.engine.focus("b2").unwrap();
        f.engine.apply(&ServerMessage::LockDenied {
            document_id: f.doc,
            block_id: "b2".into(),
            locked_by: "Bob".into(),
        });
        assert_eq!(
            f.engine.lock_state("b2"),
            Some(&LockState::Denied {
                holder: "Bob".into()
            })
        );
        assert_eq!(f.engine.remote_holder("b2"), Some("Bob"));
        assert_eq!(f.engine.focused(), None);
        assert!(matches!(
            f.engine.focus("b2"),
            Err(SyncError::LockedElsewhere { .. })
        ));
    }

    #[test]
    fn test_edit_requires_held_lock() {
        let mut f = fixture(SyncConfig::default());
        let err = f.engine.edit("b1", "x", Instant::now()).unwrap_err();
        assert_eq!(err, SyncError::NotHeld { block_id: "b1".into() });
    }

    #[test]
    fn test_threshold_flush_sends_latest_content() {
        let mut f = fixture(SyncConfig {
            edit_threshold: 3,
            ..SyncConfig::default()
        });
        hold(&mut f, "b1");
        let now = Instant::now();
        f.engine.edit("b1", "H", now).unwrap();
        f.engine.edit("b1", "He", now).unwrap();
        assert!(f.engine.drain_outgoing().is_empty());
        f.engine.edit("b1", "Hel", now).unwrap();
        match f.engine.drain_outgoing().as_slice() {
            [ClientMessage::UpdateDocument { content, .. }] => assert_eq!(content, "Hel"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_idle_and_blur_flush() {
        let mut f = fixture(SyncConfig::default());
        hold(&mut f, "b1");
        let start = Instant::now();
        f.engine.edit("b1", "Hello", start).unwrap();
        f.engine.tick(start + Duration::from_secs(1));
        assert!(f.engine.drain_outgoing().is_empty());
        f.engine.tick(start + Duration::from_secs(10));
        assert_eq!(f.engine.drain_outgoing().len(), 1);

        f.engine.edit("b1", "Hello!", start).unwrap();
        f.engine.blur("b1").unwrap();
        let sent = f.engine.drain_outgoing();
        assert!(matches!(
            sent.as_slice(),
            [ClientMessage::UpdateDocument { content, .. }, ClientMessage::UnlockBlock { .. }]
                if content == "Hello!"
        ));
    }

    #[test]
    fn test_undo_while_held() {
        let mut f = fixture(SyncConfig::default());
        hold(&mut f, "b1");
        let now = Instant::now();
        f.engine.edit("b1", "Hello", now).unwrap();
        f.engine.edit("b1", "Hello World", now).unwrap();
        f.engine.drain_outgoing();

        assert_eq!(f.engine.undo().unwrap(), "b1");
        assert_eq!(f.engine.content("b1"), Some("Hello"));
        assert!(matches!(
            f.engine.drain_outgoing().as_slice(),
            [ClientMessage::UpdateDocument { content, .. }] if content == "Hello"
        ));
        assert_eq!(f.engine.redo().unwrap(), "b1");
        assert_eq!(f.engine.content("b1"), Some("Hello World"));
    }

    #[test]
    fn test_remote_update_clears_history() {
        let mut f = fixture(SyncConfig::default());
        hold(&mut f, "b1");
        let now = Instant::now();
        for text in ["a", "ab", "abc"] {
            f.engine.edit("b1", text, now).unwrap();
        }
        let msg = unlocked(&f, "b1", f.me);
        f.engine.apply(&msg);
        let msg = updated(&f, "b1", "remote", f.other);
        f.engine.apply(&msg);

        assert_eq!(f.engine.undo(), Err(SyncError::NothingToUndo));
        assert_eq!(f.engine.content("b1"), Some("remote"));
    }

    #[test]
    fn test_remote_lock_clears_history() {
        let mut f = fixture(SyncConfig::default());
        hold(&mut f, "b1");
        f.engine.edit("b1", "mine", Instant::now()).unwrap();
        let msg = unlocked(&f, "b1", f.me);
        f.engine.apply(&msg);
        let msg = locked(&f, "b1", f.other, "Bob");
        f.engine.apply(&msg);
        assert!(!f.engine.can_undo());
    }

    #[test]
    fn test_undo_targets_latest_block() {
        let mut f = fixture(SyncConfig::default());
        let now = Instant::now();
        hold(&mut f, "b1");
        f.engine.edit("b1", "one", now).unwrap();
        hold(&mut f, "b2");
        f.engine.edit("b2", "two!", now).unwrap();
        hold(&mut f, "b1");
        f.engine.edit("b1", "one!", now).unwrap();

        assert_eq!(f.engine.undo().unwrap(), "b1");
        assert_eq!(f.engine.undo().unwrap(), "b2");
        assert_eq!(f.engine.undo().unwrap(), "b1");
        assert_eq!(f.engine.content("b1"), Some(""));
    }

    #[test]
    fn test_undo_without_lock_is_synthetic() {
        let mut f = fixture(SyncConfig::default());
        hold(&mut f, "b1");
        f.engine.edit("b1", "draft", Instant::now()).unwrap();
        f.engine.blur("b1").unwrap();
        let msg = unlocked(&f, "b1", f.me);
        f.engine.apply(&msg);
        f.engine.drain_outgoing();

        assert_eq!(f.engine.undo().unwrap(), "b1");
        assert_eq!(f.engine.lock_state("b1"), Some(&LockState::Requesting));
        assert!(matches!(
            f.engine.drain_outgoing().as_slice(),
            [ClientMessage::LockBlock { .. }]
        ));

        let msg = locked(&f, "b1", f.me, "Ann");
        f.engine.apply(&msg);
        let sent = f.engine.drain_outgoing();
        assert!(matches!(
            sent.as_slice(),
            [ClientMessage::UpdateDocument { content, .. }, ClientMessage::UnlockBlock { .. }]
                if content.is_empty()
        ));
        assert!(!f.engine.can_redo());
    }

    #[test]
    fn test_undo_rejected_when_locked_elsewhere() {
        let mut f = fixture(SyncConfig::default());
        hold(&mut f, "b1");
        f.engine.edit("b1", "draft", Instant::now()).unwrap();
        let msg = unlocked(&f, "b1", f.me);
        f.engine.apply(&msg);
        // a block_locked from Bob would also clear the history
        f.engine.remote_locks.insert("b1".into(), "Bob".into());

        let err = f.engine.undo().unwrap_err();
        assert_eq!(
            err,
            SyncError::LockedElsewhere {
                block_id: "b1".into(),
                holder: "Bob".into()
            }
        );
        assert!(f.engine.can_undo());
    }

    #[test]
    fn test_snapshot_restores_locks() {
        let mut f = fixture(SyncConfig::default());
        let document = Document::new("Other");
        let doc = document.document_id;
        let lock = |block: &str, holder: SessionId, name: &str| Lock {
            block_id: block.into(),
            holder,
            holder_name: name.into(),
            acquired_at: 0,
        };
        f.engine.apply(&ServerMessage::DocumentSnapshot {
            document,
            blocks: vec![Block::new(doc, "x", BlockType::Text, "hi", 0)],
            locks: vec![lock("x", f.me, "Ann"), lock("y", f.other, "Bob")],
            latest_version: 3,
        });
        assert_eq!(f.engine.document_id(), Some(doc));
        assert_eq!(f.engine.lock_state("x"), Some(&LockState::Held));
        assert_eq!(f.engine.remote_holder("y"), Some("Bob"));
        assert_eq!(f.engine.content("x"), Some("hi"));
        assert_eq!(f.engine.content("b1"), None);
    }

    #[test]
    fn test_delete_drops_block_state() {
        let mut f = fixture(SyncConfig::default());
        hold(&mut f, "b1");
        f.engine.edit("b1", "x", Instant::now()).unwrap();
        f.engine.apply(&ServerMessage::BlockDeleted {
            document_id: f.doc,
            block_id: "b1".into(),
            removed_block_ids: vec!["b1".into()],
        });
        assert_eq!(f.engine.content("b1"), None);
        assert_eq!(f.engine.lock_state("b1"), None);
        assert!(!f.engine.can_undo());
    }

    /// Held `b1`, edited to "draft", released; undo then waits for a lock.
    fn waiting_undo(f: &mut Fixture) {
        hold(f, "b1");
        f.engine.edit("b1", "draft", Instant::now()).unwrap();
        f.engine.blur("b1").unwrap();
        let msg = unlocked(f, "b1", f.me);
        f.engine.apply(&msg);
        f.engine.drain_outgoing();
        f.engine.undo().unwrap();
        f.engine.drain_outgoing();
    }

    #[test]
    fn test_denied_history_step_restores_content() {
        let mut f = fixture(SyncConfig::default());
        waiting_undo(&mut f);
        assert_eq!(f.engine.content("b1"), Some(""));

        f.engine.apply(&ServerMessage::LockDenied {
            document_id: f.doc,
            block_id: "b1".into(),
            locked_by: "Bob".into(),
        });
        assert_eq!(f.engine.content("b1"), Some("draft"));
        assert!(!f.engine.can_undo());
        assert!(f.engine.drain_outgoing().is_empty());
    }

    #[test]
    fn test_remote_update_supersedes_waiting_step() {
        let mut f = fixture(SyncConfig::default());
        waiting_undo(&mut f);
        let msg = updated(&f, "b1", "remote", f.other);
        f.engine.apply(&msg);
        assert_eq!(f.engine.content("b1"), Some("remote"));

        let msg = locked(&f, "b1", f.me, "Ann");
        f.engine.apply(&msg);
        assert!(matches!(
            f.engine.drain_outgoing().as_slice(),
            [ClientMessage::UnlockBlock { .. }]
        ));
        assert_eq!(f.engine.content("b1"), Some("remote"));
    }

    #[test]
    fn test_new_session_drops_stale_locks() {
        let mut f = fixture(SyncConfig::default());
        hold(&mut f, "b1");
        f.engine.edit("b1", "typed", Instant::now()).unwrap();

        f.engine.apply(&ServerMessage::SessionAck {
            session_id: Uuid::new_v4(),
            username: "Ann".into(),
        });
        assert_eq!(f.engine.lock_state("b1"), None);
        assert_eq!(
            f.engine.edit("b1", "lost", Instant::now()),
            Err(SyncError::NotHeld { block_id: "b1".into() })
        );
        assert!(matches!(
            f.engine.drain_outgoing().as_slice(),
            [ClientMessage::OpenDocument { document_id }] if *document_id == f.doc
        ));
    }

    #[test]
    fn test_repeated_ack_keeps_locks() {
        let mut f = fixture(SyncConfig::default());
        hold(&mut f, "b1");
        f.engine.apply(&ServerMessage::SessionAck {
            session_id: f.me,
            username: "Ann B".into(),
        });
        assert_eq!(f.engine.lock_state("b1"), Some(&LockState::Held));
        assert!(f.engine.drain_outgoing().is_empty());
    }

    #[test]
    fn test_disconnect_drops_locks_and_queue() {
        let mut f = fixture(SyncConfig::default());
        hold(&mut f, "b1");
        f.engine.edit("b1", "typed", Instant::now()).unwrap();
        f.engine.focus("b2").unwrap();

        f.engine.handle_event(&ClientEvent::Disconnected);
        assert_eq!(f.engine.lock_state("b1"), None);
        assert_eq!(f.engine.focused(), None);
        assert!(f.engine.drain_outgoing().is_empty());
        assert!(f.engine.edit("b1", "more", Instant::now()).is_err());
        // cached content stays until a snapshot replaces it
        assert_eq!(f.engine.content("b1"), Some("typed"));
    }

    #[test]
    fn test_lagged_flushes_then_reopens() {
        let mut f = fixture(SyncConfig::default());
        hold(&mut f, "b1");
        f.engine.edit("b1", "typed", Instant::now()).unwrap();
        assert!(f.engine.drain_outgoing().is_empty());

        f.engine
            .handle_event(&ClientEvent::Message(ServerMessage::error("lagged", "3 events were dropped")));
        let sent = f.engine.drain_outgoing();
        assert!(matches!(
            sent.as_slice(),
            [ClientMessage::UpdateDocument { content, .. }, ClientMessage::OpenDocument { .. }]
                if content == "typed"
        ));
        // other errors are only reported
        f.engine.apply(&ServerMessage::error("not_found", "block x not found"));
        assert!(f.engine.drain_outgoing().is_empty());
    }

    #[test]
    fn test_table_options_and_row_shift() {
        let mut f = fixture(SyncConfig::default());
        let document = Document::new("Tables");
        let doc = document.document_id;
        let table = Block::new(doc, "t1", BlockType::Table, "", 0);
        let mut options = Block::new(doc, "opts", BlockType::TableOptions, "{}", 1);
        options.parent_block_id = Some("t1".into());
        let lower = Block::cell(doc, "t1", 1, 0, "below", 3);
        let lower_id = lower.block_id.clone();
        f.engine.apply(&ServerMessage::DocumentSnapshot {
            document,
            blocks: vec![
                table,
                options,
                Block::cell(doc, "t1", 0, 0, "top", 2),
                lower,
            ],
            locks: vec![],
            latest_version: 0,
        });
        assert_eq!(f.engine.options_block("t1"), Some("opts"));

        f.engine.apply(&ServerMessage::TableOptionsUpdated {
            document_id: doc,
            table_id: "t1".into(),
            options_json: r#"{"columns":["80px"]}"#.into(),
            version_id: 1,
        });
        assert_eq!(f.engine.content("opts"), Some(r#"{"columns":["80px"]}"#));

        let added = Block::cell(doc, "t1", 1, 0, "", 0);
        let added_id = added.block_id.clone();
        f.engine.apply(&ServerMessage::TableRowAdded {
            document_id: doc,
            table_id: "t1".into(),
            row_index: 1,
            added_blocks: vec![added],
            shifted: vec![CellShift {
                block_id: lower_id.clone(),
                row_index: 2,
            }],
        });
        assert_eq!(f.engine.cell_position(&lower_id), Some((2, 0)));
        assert_eq!(f.engine.cell_position(&added_id), Some((1, 0)));
        assert_eq!(f.engine.content(&added_id), Some(""));
        assert_eq!(f.engine.cell_position("opts"), None);
    }
}
