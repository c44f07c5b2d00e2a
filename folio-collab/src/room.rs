//! Document rooms: one actor per open document.
//!
//! ```text
//!   RoomHandle (Clone, Send)      mpsc       DocumentRoom (own task)
//!   ┌──────────────────────┐  ──────────▶  ┌────────────────────────────┐
//!   │ .acquire()           │               │ DocumentLog (blocks, log)  │
//!   │ .commit()            │  ◀──────────  │ LockManager                │
//!   │ .add_block() …       │    oneshot    │ BroadcastGroup ──▶ members │
//!   └──────────────────────┘               └────────────────────────────┘
//! ```
//!
//! The room task is the only code that touches a document's locks and
//! blocks, so every mutation and the event it publishes happen in one order.
//! Different documents run on different tasks and never wait on each other.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};

use crate::broadcast::{Audience, BroadcastGroup, BroadcastStats, Envelope};
use crate::error::{CollabError, Result};
use crate::locks::{AcquireOutcome, Lock, LockManager, ReleaseOutcome};
use crate::model::{
    BlockId, BlockMetadata, BlockType, DocumentId, Participant, SessionId, Template, Version,
    VersionId, VersionSummary,
};
use crate::protocol::ServerMessage;
use crate::storage::Storage;
use crate::structure;
use crate::versioner::{AddedBlocks, AddedRow, DocumentLog};

/// Commands a room can queue before senders wait.
const ROOM_MAILBOX: usize = 256;

/// What a session gets back when it joins a room.
pub struct Joined {
    pub receiver: broadcast::Receiver<Arc<Envelope>>,
    /// `document_snapshot` taken at the moment of joining.
    pub snapshot: ServerMessage,
}

enum RoomCommand {
    Join {
        who: Participant,
        reply: oneshot::Sender<Result<Joined>>,
    },
    Leave {
        session_id: SessionId,
        reply: oneshot::Sender<Result<Vec<Lock>>>,
    },
    Rename {
        who: Participant,
        reply: oneshot::Sender<Result<()>>,
    },
    Acquire {
        who: Participant,
        block_id: BlockId,
        reply: oneshot::Sender<Result<AcquireOutcome>>,
    },
    Release {
        who: Participant,
        block_id: BlockId,
        reply: oneshot::Sender<Result<ReleaseOutcome>>,
    },
    Commit {
        who: Participant,
        block_id: BlockId,
        content: String,
        metadata: BlockMetadata,
        reply: oneshot::Sender<Result<Version>>,
    },
    AddBlock {
        who: Participant,
        block_type: BlockType,
        after: Option<BlockId>,
        reply: oneshot::Sender<Result<AddedBlocks>>,
    },
    DeleteBlock {
        who: Participant,
        block_id: BlockId,
        reply: oneshot::Sender<Result<Vec<BlockId>>>,
    },
    UpdateTableOptions {
        who: Participant,
        table_id: BlockId,
        options_json: String,
        reply: oneshot::Sender<Result<Version>>,
    },
    AddTableRow {
        who: Participant,
        table_id: BlockId,
        after_row: Option<u32>,
        reply: oneshot::Sender<Result<AddedRow>>,
    },
    History {
        reply: oneshot::Sender<Result<Vec<VersionSummary>>>,
    },
    Version {
        version_id: VersionId,
        reply: oneshot::Sender<Result<Version>>,
    },
    Snapshot {
        reply: oneshot::Sender<Result<ServerMessage>>,
    },
    TableText {
        table_id: BlockId,
        reply: oneshot::Sender<Result<Vec<Vec<String>>>>,
    },
    Template {
        reply: oneshot::Sender<Result<Template>>,
    },
}

/// Cheap, cloneable handle to a running room.
#[derive(Clone)]
pub struct RoomHandle {
    document_id: DocumentId,
    tx: mpsc::Sender<RoomCommand>,
    broadcast: Arc<BroadcastGroup>,
}

impl RoomHandle {
    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn broadcast(&self) -> &Arc<BroadcastGroup> {
        &self.broadcast
    }

    pub async fn stats(&self) -> BroadcastStats {
        self.broadcast.stats().await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> RoomCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| CollabError::Shutdown)?;
        rx.await.map_err(|_| CollabError::Shutdown)?
    }

    /// Become a member. The receiver sees every event published after the snapshot.
    pub async fn join(&self, who: Participant) -> Result<Joined> {
        self.request(|reply| RoomCommand::Join { who, reply }).await
    }

    /// Stop being a member, releasing every lock the session held here.
    pub async fn leave(&self, session_id: SessionId) -> Result<Vec<Lock>> {
        self.request(|reply| RoomCommand::Leave { session_id, reply })
            .await
    }

    pub async fn rename(&self, who: Participant) -> Result<()> {
        self.request(|reply| RoomCommand::Rename { who, reply }).await
    }

    pub async fn acquire(&self, who: Participant, block_id: BlockId) -> Result<AcquireOutcome> {
        self.request(|reply| RoomCommand::Acquire {
            who,
            block_id,
            reply,
        })
        .await
    }

    pub async fn release(&self, who: Participant, block_id: BlockId) -> Result<ReleaseOutcome> {
        self.request(|reply| RoomCommand::Release {
            who,
            block_id,
            reply,
        })
        .await
    }

    pub async fn commit(
        &self,
        who: Participant,
        block_id: BlockId,
        content: String,
        metadata: BlockMetadata,
    ) -> Result<Version> {
        self.request(|reply| RoomCommand::Commit {
            who,
            block_id,
            content,
            metadata,
            reply,
        })
        .await
    }

    pub async fn add_block(
        &self,
        who: Participant,
        block_type: BlockType,
        after: Option<BlockId>,
    ) -> Result<AddedBlocks> {
        self.request(|reply| RoomCommand::AddBlock {
            who,
            block_type,
            after,
            reply,
        })
        .await
    }

    /// Delete a block. Returns every removed id (the block plus cascaded children).
    pub async fn delete_block(&self, who: Participant, block_id: BlockId) -> Result<Vec<BlockId>> {
        self.request(|reply| RoomCommand::DeleteBlock {
            who,
            block_id,
            reply,
        })
        .await
    }

    pub async fn update_table_options(
        &self,
        who: Participant,
        table_id: BlockId,
        options_json: String,
    ) -> Result<Version> {
        self.request(|reply| RoomCommand::UpdateTableOptions {
            who,
            table_id,
            options_json,
            reply,
        })
        .await
    }

    pub async fn add_table_row(
        &self,
        who: Participant,
        table_id: BlockId,
        after_row: Option<u32>,
    ) -> Result<AddedRow> {
        self.request(|reply| RoomCommand::AddTableRow {
            who,
            table_id,
            after_row,
            reply,
        })
        .await
    }

    pub async fn history(&self) -> Result<Vec<VersionSummary>> {
        self.request(|reply| RoomCommand::History { reply }).await
    }

    pub async fn version(&self, version_id: VersionId) -> Result<Version> {
        self.request(|reply| RoomCommand::Version { version_id, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<ServerMessage> {
        self.request(|reply| RoomCommand::Snapshot { reply }).await
    }

    /// A table's cells as tag-stripped text, row by row.
    pub async fn table_text(&self, table_id: BlockId) -> Result<Vec<Vec<String>>> {
        self.request(|reply| RoomCommand::TableText { table_id, reply })
            .await
    }

    pub async fn template(&self) -> Result<Template> {
        self.request(|reply| RoomCommand::Template { reply }).await
    }
}

/// The actor. Owns one document's live state.
struct DocumentRoom {
    log: DocumentLog,
    locks: LockManager,
    broadcast: Arc<BroadcastGroup>,
    rx: mpsc::Receiver<RoomCommand>,
}

impl DocumentRoom {
    async fn run(mut self) {
        let document_id = self.log.document_id();
        log::debug!("Room for document {document_id} started");
        while let Some(cmd) = self.rx.recv().await {
            self.handle(cmd).await;
        }
        log::debug!("Room for document {document_id} stopped");
    }

    async fn handle(&mut self, cmd: RoomCommand) {
        // A dropped reply receiver means the caller went away; the work stands.
        match cmd {
            RoomCommand::Join { who, reply } => {
                let receiver = self.broadcast.join(&who).await;
                log::info!(
                    "'{}' joined document {}",
                    who.display_name,
                    self.log.document_id()
                );
                let _ = reply.send(Ok(Joined {
                    receiver,
                    snapshot: self.snapshot(),
                }));
            }
            RoomCommand::Leave { session_id, reply } => {
                let released = self.leave(session_id).await;
                let _ = reply.send(Ok(released));
            }
            RoomCommand::Rename { who, reply } => {
                self.locks.rename_holder(&who);
                self.broadcast.rename(&who).await;
                let _ = reply.send(Ok(()));
            }
            RoomCommand::Acquire {
                who,
                block_id,
                reply,
            } => {
                let _ = reply.send(self.acquire(&who, &block_id).await);
            }
            RoomCommand::Release {
                who,
                block_id,
                reply,
            } => {
                let _ = reply.send(Ok(self.release(&who, &block_id)));
            }
            RoomCommand::Commit {
                who,
                block_id,
                content,
                metadata,
                reply,
            } => {
                let _ = reply.send(self.commit(&who, &block_id, &content, &metadata).await);
            }
            RoomCommand::AddBlock {
                who,
                block_type,
                after,
                reply,
            } => {
                let _ = reply.send(self.add_block(&who, block_type, after));
            }
            RoomCommand::DeleteBlock {
                who,
                block_id,
                reply,
            } => {
                let _ = reply.send(self.delete_block(&who, &block_id));
            }
            RoomCommand::UpdateTableOptions {
                who,
                table_id,
                options_json,
                reply,
            } => {
                let _ = reply.send(self.update_table_options(&who, &table_id, &options_json));
            }
            RoomCommand::AddTableRow {
                who,
                table_id,
                after_row,
                reply,
            } => {
                let _ = reply.send(self.add_table_row(&who, &table_id, after_row));
            }
            RoomCommand::History { reply } => {
                let _ = reply.send(self.log.history());
            }
            RoomCommand::Version { version_id, reply } => {
                let _ = reply.send(self.log.version(version_id));
            }
            RoomCommand::Snapshot { reply } => {
                let _ = reply.send(Ok(self.snapshot()));
            }
            RoomCommand::TableText { table_id, reply } => {
                let text = self
                    .log
                    .table(&table_id)
                    .map(|grid| structure::table_text(&grid));
                let _ = reply.send(text);
            }
            RoomCommand::Template { reply } => {
                let _ = reply.send(Ok(self.log.to_template()));
            }
        }
    }

    fn publish(&self, audience: Audience, message: ServerMessage) {
        if let Err(e) = self.broadcast.publish(audience, message) {
            log::error!("Failed to encode event for {}: {e}", self.log.document_id());
        }
    }

    fn snapshot(&self) -> ServerMessage {
        ServerMessage::DocumentSnapshot {
            document: self.log.document().clone(),
            blocks: self.log.ordered_blocks().into_iter().cloned().collect(),
            locks: self.locks.locks(),
            latest_version: self.log.latest_version(),
        }
    }

    fn unlocked_event(&self, lock: &Lock) -> ServerMessage {
        ServerMessage::BlockUnlocked {
            document_id: self.log.document_id(),
            block_id: lock.block_id.clone(),
            unlocked_by: lock.holder_name.clone(),
            session_id: lock.holder,
        }
    }

    async fn leave(&mut self, session_id: SessionId) -> Vec<Lock> {
        let released = self.locks.release_all(session_id);
        for lock in &released {
            log::info!(
                "Released {} held by departing '{}'",
                lock.block_id,
                lock.holder_name
            );
            self.publish(Audience::All, self.unlocked_event(lock));
        }
        self.broadcast.leave(session_id).await;
        released
    }

    /// Requests that leave state behind the session are only taken from
    /// members, so nothing is granted to a session that already left.
    async fn require_member(&self, who: &Participant) -> Result<()> {
        if self.broadcast.is_member(who.session_id).await {
            return Ok(());
        }
        log::debug!(
            "Refusing request from '{}': not in {}",
            who.display_name,
            self.log.document_id()
        );
        Err(CollabError::NotInDocument {
            document_id: self.log.document_id(),
        })
    }

    async fn acquire(&mut self, who: &Participant, block_id: &str) -> Result<AcquireOutcome> {
        self.require_member(who).await?;
        self.log.block(block_id)?;
        let document_id = self.log.document_id();
        let outcome = self.locks.acquire(block_id, who);
        match &outcome {
            AcquireOutcome::Acquired(lock) | AcquireOutcome::AlreadyHeld(lock) => {
                let audience = if matches!(outcome, AcquireOutcome::Acquired(_)) {
                    log::info!("'{}' locked {block_id} in {document_id}", who.display_name);
                    Audience::All
                } else {
                    Audience::Session(who.session_id)
                };
                self.publish(
                    audience,
                    ServerMessage::BlockLocked {
                        document_id,
                        block_id: block_id.to_string(),
                        locked_by: lock.holder_name.clone(),
                        session_id: lock.holder,
                    },
                );
            }
            AcquireOutcome::Denied { holder } => {
                log::debug!(
                    "'{}' denied {block_id}: held by '{}'",
                    who.display_name,
                    holder.holder_name
                );
                self.publish(
                    Audience::Session(who.session_id),
                    ServerMessage::LockDenied {
                        document_id,
                        block_id: block_id.to_string(),
                        locked_by: holder.holder_name.clone(),
                    },
                );
            }
        }
        Ok(outcome)
    }

    fn release(&mut self, who: &Participant, block_id: &str) -> ReleaseOutcome {
        let outcome = self.locks.release(block_id, who.session_id);
        match &outcome {
            ReleaseOutcome::Released(lock) => {
                log::info!("'{}' unlocked {block_id}", who.display_name);
                self.publish(Audience::All, self.unlocked_event(lock));
            }
            ReleaseOutcome::HeldByOther(lock) => log::debug!(
                "Ignoring unlock of {block_id} by '{}': held by '{}'",
                who.display_name,
                lock.holder_name
            ),
            ReleaseOutcome::NotLocked => {
                log::debug!("Ignoring unlock of unlocked block {block_id}")
            }
        }
        outcome
    }

    async fn commit(
        &mut self,
        who: &Participant,
        block_id: &str,
        content: &str,
        metadata: &BlockMetadata,
    ) -> Result<Version> {
        self.require_member(who).await?;
        let version = self.log.commit(&self.locks, block_id, content, metadata, who)?;
        self.publish(
            Audience::All,
            ServerMessage::DocumentUpdated {
                document_id: version.document_id,
                block_id: version.block_id.clone(),
                version_id: version.version_id,
                content_html: version.content.clone(),
                metadata: version.metadata.clone(),
                updated_by: who.display_name.clone(),
                session_id: who.session_id,
            },
        );
        Ok(version)
    }

    fn add_block(
        &mut self,
        who: &Participant,
        block_type: BlockType,
        after: Option<BlockId>,
    ) -> Result<AddedBlocks> {
        let added = self.log.add_block(block_type, after.as_deref())?;
        log::debug!("'{}' added {} blocks", who.display_name, added.added.len());
        self.publish(
            Audience::All,
            ServerMessage::BlockAdded {
                document_id: self.log.document_id(),
                added_blocks: added.added.clone(),
                after_block_id: after,
                reordered: added.reordered.clone(),
            },
        );
        Ok(added)
    }

    fn delete_block(&mut self, who: &Participant, block_id: &str) -> Result<Vec<BlockId>> {
        let removal = self.log.removal_set(block_id)?;
        for id in &removal {
            if let Some(lock) = self.locks.holder(id).filter(|l| l.holder != who.session_id) {
                return Err(CollabError::BlockLocked {
                    block_id: id.clone(),
                    holder: lock.holder_name.clone(),
                });
            }
        }
        self.log.remove_blocks(&removal)?;

        for id in &removal {
            if let Some(lock) = self.locks.remove_block(id) {
                self.publish(Audience::All, self.unlocked_event(&lock));
            }
        }
        log::info!(
            "'{}' deleted {block_id} ({} blocks)",
            who.display_name,
            removal.len()
        );
        self.publish(
            Audience::All,
            ServerMessage::BlockDeleted {
                document_id: self.log.document_id(),
                block_id: block_id.to_string(),
                removed_block_ids: removal.clone(),
            },
        );
        Ok(removal)
    }

    fn update_table_options(
        &mut self,
        who: &Participant,
        table_id: &str,
        options_json: &str,
    ) -> Result<Version> {
        let version = self
            .log
            .update_table_options(&self.locks, table_id, options_json, who)?;
        self.publish(
            Audience::All,
            ServerMessage::TableOptionsUpdated {
                document_id: self.log.document_id(),
                table_id: table_id.to_string(),
                options_json: options_json.to_string(),
                version_id: version.version_id,
            },
        );
        Ok(version)
    }

    fn add_table_row(
        &mut self,
        who: &Participant,
        table_id: &str,
        after_row: Option<u32>,
    ) -> Result<AddedRow> {
        let row = self.log.add_table_row(table_id, after_row)?;
        log::debug!("'{}' added row {} to {table_id}", who.display_name, row.row_index);
        self.publish(
            Audience::All,
            ServerMessage::TableRowAdded {
                document_id: self.log.document_id(),
                table_id: table_id.to_string(),
                row_index: row.row_index,
                added_blocks: row.added.clone(),
                shifted: row.shifted.clone(),
            },
        );
        Ok(row)
    }
}

/// Start a room task for a loaded document.
fn spawn_room(log: DocumentLog, capacity: usize) -> RoomHandle {
    let (tx, rx) = mpsc::channel(ROOM_MAILBOX);
    let broadcast = Arc::new(BroadcastGroup::new(capacity));
    let handle = RoomHandle {
        document_id: log.document_id(),
        tx,
        broadcast: broadcast.clone(),
    };
    let room = DocumentRoom {
        log,
        locks: LockManager::new(),
        broadcast,
        rx,
    };
    tokio::spawn(room.run());
    handle
}

/// Maps document ids to running rooms, opening them from storage on demand.
///
/// Rooms stay up for the life of the manager, so a document never has two
/// owners.
pub struct RoomManager {
    rooms: RwLock<HashMap<DocumentId, RoomHandle>>,
    store: Arc<dyn Storage>,
    capacity: usize,
}

impl RoomManager {
    pub fn new(store: Arc<dyn Storage>, capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            capacity,
        }
    }

    /// Get the room for `document_id`, loading the document if needed.
    pub async fn get_or_open(&self, document_id: DocumentId) -> Result<RoomHandle> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&document_id) {
                return Ok(room.clone());
            }
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(&document_id) {
            return Ok(room.clone());
        }
        let log = DocumentLog::open(self.store.clone(), document_id)?;
        let room = spawn_room(log, self.capacity);
        rooms.insert(document_id, room.clone());
        log::info!("Opened room for document {document_id}");
        Ok(room)
    }

    pub async fn get(&self, document_id: DocumentId) -> Option<RoomHandle> {
        self.rooms.read().await.get(&document_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<DocumentId> {
        self.rooms.read().await.keys().copied().collect()
    }
}
