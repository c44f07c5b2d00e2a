//! Session registry: one entry per live connection.
//!
//! The registry only tracks identity and liveness. Releasing a departing
//! session's locks is the caller's job (see `Hub::deregister`), because the
//! locks live inside the document rooms.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{CollabError, Missing, Result};
use crate::model::{DocumentId, Participant, SessionId};

/// Identity of one physical connection, assigned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Allocate a process-unique connection id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why the server closed a connection on its own initiative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    HeartbeatTimeout,
    ServerShutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::HeartbeatTimeout => f.write_str("heartbeat timeout"),
            DisconnectReason::ServerShutdown => f.write_str("server shutdown"),
        }
    }
}

#[derive(Debug)]
pub struct Session {
    pub session_id: SessionId,
    pub display_name: String,
    pub connection: ConnectionId,
    pub last_heartbeat: Instant,
    /// Document the session is currently a member of.
    pub document: Option<DocumentId>,
    /// Tells the connection task to hang up.
    closer: Option<oneshot::Sender<DisconnectReason>>,
}

impl Session {
    pub fn participant(&self) -> Participant {
        Participant::new(self.session_id, self.display_name.clone())
    }

    /// Ask the owning connection task to close. Returns false if it is already gone.
    pub fn close(&mut self, reason: DisconnectReason) -> bool {
        match self.closer.take() {
            Some(tx) => tx.send(reason).is_ok(),
            None => false,
        }
    }
}

/// Default display name for a fresh session: `User_` plus the first four hex
/// digits of its id.
pub fn default_display_name(session_id: SessionId) -> String {
    let simple = session_id.simple().to_string();
    format!("User_{}", &simple[..4])
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    by_connection: HashMap<ConnectionId, SessionId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. A `None` name gets the default `User_xxxx`.
    pub fn register(
        &mut self,
        connection: ConnectionId,
        display_name: Option<String>,
        closer: Option<oneshot::Sender<DisconnectReason>>,
    ) -> Result<SessionId> {
        if self.by_connection.contains_key(&connection) {
            return Err(CollabError::DuplicateConnection(connection));
        }
        let session_id = Uuid::new_v4();
        let display_name = display_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| default_display_name(session_id));

        log::info!("Session {session_id} registered on {connection} as '{display_name}'");
        self.by_connection.insert(connection, session_id);
        self.sessions.insert(
            session_id,
            Session {
                session_id,
                display_name,
                connection,
                last_heartbeat: Instant::now(),
                document: None,
                closer,
            },
        );
        Ok(session_id)
    }

    /// Change a session's display name. Setting the same name twice is a no-op.
    pub fn rename(&mut self, session_id: SessionId, display_name: &str) -> Result<Participant> {
        let name = display_name.trim();
        if name.is_empty() {
            return Err(CollabError::InvalidRequest("username must not be empty".into()));
        }
        let session = self.get_mut(session_id)?;
        if session.display_name != name {
            log::info!("Session {session_id} renamed '{}' -> '{name}'", session.display_name);
            session.display_name = name.to_string();
        }
        Ok(session.participant())
    }

    pub fn heartbeat(&mut self, session_id: SessionId) -> Result<()> {
        self.heartbeat_at(session_id, Instant::now())
    }

    pub fn heartbeat_at(&mut self, session_id: SessionId, now: Instant) -> Result<()> {
        let session = self.get_mut(session_id)?;
        session.last_heartbeat = now;
        Ok(())
    }

    /// Remove a session. The caller releases its locks and memberships.
    pub fn deregister(&mut self, session_id: SessionId) -> Option<Session> {
        let session = self.sessions.remove(&session_id)?;
        self.by_connection.remove(&session.connection);
        log::info!("Session {session_id} ('{}') deregistered", session.display_name);
        Some(session)
    }

    /// Sessions whose last heartbeat is older than `timeout` at `now`.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<SessionId> {
        let mut ids: Vec<_> = self
            .sessions
            .values()
            .filter(|s| now.saturating_duration_since(s.last_heartbeat) > timeout)
            .map(|s| s.session_id)
            .collect();
        ids.sort();
        ids
    }

    pub fn participant(&self, session_id: SessionId) -> Result<Participant> {
        self.get(session_id).map(Session::participant)
    }

    /// Record which document the session now belongs to, returning the previous one.
    pub fn set_document(
        &mut self,
        session_id: SessionId,
        document: Option<DocumentId>,
    ) -> Result<Option<DocumentId>> {
        let session = self.get_mut(session_id)?;
        Ok(std::mem::replace(&mut session.document, document))
    }

    pub fn by_connection(&self, connection: ConnectionId) -> Option<SessionId> {
        self.by_connection.get(&connection).copied()
    }

    pub fn get(&self, session_id: SessionId) -> Result<&Session> {
        self.sessions
            .get(&session_id)
            .ok_or(CollabError::NotFound(Missing::Session(session_id)))
    }

    fn get_mut(&mut self, session_id: SessionId) -> Result<&mut Session> {
        self.sessions
            .get_mut(&session_id)
            .ok_or(CollabError::NotFound(Missing::Session(session_id)))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
