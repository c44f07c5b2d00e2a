//! Session-to-document coordination.
//!
//! The hub owns the session registry and the room manager and keeps them
//! consistent: a session is a member of at most one room, and whenever it
//! leaves that room (switching documents, disconnecting, timing out) the room
//! releases its locks first.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, RwLock};

use crate::error::{CollabError, Missing, Result};
use crate::model::{Block, BlockType, Document, DocumentId, Participant, SessionId};
use crate::room::{Joined, RoomHandle, RoomManager};
use crate::session::{ConnectionId, DisconnectReason, Session, SessionRegistry};
use crate::storage::{sanitize_template_name, DocumentStore, Storage, TemplateStore};
use crate::structure;

pub struct Hub {
    sessions: RwLock<SessionRegistry>,
    rooms: RoomManager,
    store: Arc<dyn Storage>,
}

impl Hub {
    pub fn new(store: Arc<dyn Storage>, broadcast_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(SessionRegistry::new()),
            rooms: RoomManager::new(store.clone(), broadcast_capacity),
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn Storage> {
        &self.store
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    pub async fn register(
        &self,
        connection: ConnectionId,
        display_name: Option<String>,
        closer: Option<oneshot::Sender<DisconnectReason>>,
    ) -> Result<Participant> {
        let mut sessions = self.sessions.write().await;
        let session_id = sessions.register(connection, display_name, closer)?;
        sessions.participant(session_id)
    }

    pub async fn participant(&self, session_id: SessionId) -> Result<Participant> {
        self.sessions.read().await.participant(session_id)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Rename a session and refresh its name on any locks it holds.
    pub async fn rename(&self, session_id: SessionId, display_name: &str) -> Result<Participant> {
        let (who, document) = {
            let mut sessions = self.sessions.write().await;
            let who = sessions.rename(session_id, display_name)?;
            (who, sessions.get(session_id)?.document)
        };
        if let Some(room) = self.room_if_open(document).await {
            room.rename(who.clone()).await?;
        }
        Ok(who)
    }

    pub async fn heartbeat(&self, session_id: SessionId) -> Result<()> {
        self.sessions.write().await.heartbeat(session_id)
    }

    async fn room_if_open(&self, document: Option<DocumentId>) -> Option<RoomHandle> {
        match document {
            Some(id) => self.rooms.get(id).await,
            None => None,
        }
    }

    /// Remove a session, releasing its locks in the room it was in.
    pub async fn deregister(&self, session_id: SessionId) -> Option<Session> {
        let session = self.sessions.write().await.deregister(session_id)?;
        if let Some(room) = self.room_if_open(session.document).await {
            if let Err(e) = room.leave(session_id).await {
                log::warn!("Session {session_id} could not leave {}: {e}", room.document_id());
            }
        }
        Some(session)
    }

    /// Tear down a connection's session. `last_room` is the room the
    /// connection was routing to; it is left even when the session is
    /// already gone, since a sweep may have raced the connection's last
    /// requests into it.
    pub async fn disconnect(
        &self,
        session_id: SessionId,
        last_room: Option<&RoomHandle>,
    ) -> Option<Session> {
        let session = self.deregister(session_id).await;
        if let Some(room) = last_room {
            match room.leave(session_id).await {
                Ok(released) if !released.is_empty() => log::warn!(
                    "Released {} stray locks of session {session_id} in {}",
                    released.len(),
                    room.document_id()
                ),
                Ok(_) => {}
                Err(e) => log::warn!(
                    "Session {session_id} could not leave {}: {e}",
                    room.document_id()
                ),
            }
        }
        session
    }

    /// Make `document_id` the session's current document.
    ///
    /// Returns `Some(Joined)` when the session newly joined, `None` when it was
    /// already a member. Switching away from another document leaves that
    /// room first, which releases the session's locks there.
    pub async fn enter_document(
        &self,
        session_id: SessionId,
        document_id: DocumentId,
    ) -> Result<(RoomHandle, Option<Joined>)> {
        let (who, current) = {
            let sessions = self.sessions.read().await;
            let session = sessions.get(session_id)?;
            (session.participant(), session.document)
        };
        let room = self.rooms.get_or_open(document_id).await?;
        if current == Some(document_id) {
            return Ok((room, None));
        }

        if let Some(previous) = self.room_if_open(current).await {
            log::info!(
                "'{}' switching from {} to {document_id}",
                who.display_name,
                previous.document_id()
            );
            previous.leave(session_id).await?;
        }
        let joined = room.join(who).await?;
        self.sessions
            .write()
            .await
            .set_document(session_id, Some(document_id))?;
        Ok((room, Some(joined)))
    }

    /// Close every session whose heartbeat is older than `timeout`.
    pub async fn sweep_expired(&self, timeout: Duration) -> Vec<SessionId> {
        let expired = self.sessions.read().await.expired(Instant::now(), timeout);
        for session_id in &expired {
            if let Some(mut session) = self.deregister(*session_id).await {
                log::warn!(
                    "Session {session_id} ('{}') timed out after {timeout:?}",
                    session.display_name
                );
                session.close(DisconnectReason::HeartbeatTimeout);
            }
        }
        expired
    }

    /// Create a document, expanding `template` when given. Without a template
    /// the document starts with one empty text block.
    pub async fn create_document(&self, title: &str, template: Option<&str>) -> Result<Document> {
        let document = Document::new(title);
        let blocks = match template {
            Some(name) => {
                let template = self
                    .store
                    .get_template(name)?
                    .ok_or_else(|| CollabError::NotFound(Missing::Template(name.to_string())))?;
                structure::expand_template(document.document_id, &template)
            }
            None => vec![Block::new(
                document.document_id,
                uuid::Uuid::new_v4().to_string(),
                BlockType::Text,
                "",
                0,
            )],
        };
        self.store.create_document(&document, &blocks)?;
        log::info!(
            "Created document {} '{title}' with {} blocks",
            document.document_id,
            blocks.len()
        );
        Ok(document)
    }

    pub async fn list_documents(&self) -> Result<Vec<Document>> {
        Ok(self.store.list_documents()?)
    }

    /// Store the current content of a document as a template. Returns the
    /// sanitized name it was saved under.
    pub async fn save_as_template(&self, document_id: DocumentId, name: &str) -> Result<String> {
        let name = sanitize_template_name(name);
        if name.is_empty() {
            return Err(CollabError::InvalidRequest("template name is empty".into()));
        }
        let room = self.rooms.get_or_open(document_id).await?;
        let template = room.template().await?;
        self.store.save_template(&name, &template)?;
        log::info!("Saved document {document_id} as template '{name}'");
        Ok(name)
    }

    pub async fn list_templates(&self) -> Result<Vec<String>> {
        Ok(self.store.list_templates()?)
    }
}
