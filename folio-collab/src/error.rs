//! Error taxonomy for the collaboration core.
//!
//! A denied lock is not an error: it is an `AcquireOutcome`. Everything here
//! is reported back to the session that caused it and never takes down a
//! document room or a connection.

use std::fmt;

use crate::model::{BlockId, DocumentId, SessionId, VersionId};
use crate::protocol::ProtocolError;
use crate::session::ConnectionId;
use crate::storage::StoreError;

/// What a `NotFound` failed to find.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Missing {
    Document(DocumentId),
    Block(BlockId),
    Version(VersionId),
    Template(String),
    Session(SessionId),
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Missing::Document(id) => write!(f, "document {id}"),
            Missing::Block(id) => write!(f, "block {id}"),
            Missing::Version(id) => write!(f, "version {id}"),
            Missing::Template(name) => write!(f, "template '{name}'"),
            Missing::Session(id) => write!(f, "session {id}"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CollabError {
    #[error("block {block_id} is not locked by this session")]
    NotLockHolder { block_id: BlockId },

    #[error("{0} not found")]
    NotFound(Missing),

    #[error("block {block_id} is locked by {holder}")]
    BlockLocked { block_id: BlockId, holder: String },

    #[error("session is not in document {document_id}")]
    NotInDocument { document_id: DocumentId },

    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),

    #[error("connection lost")]
    ConnectionLost,

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("document room shut down")]
    Shutdown,
}

impl CollabError {
    /// Stable code sent to clients next to the message.
    pub fn code(&self) -> &'static str {
        match self {
            CollabError::NotLockHolder { .. } => "not_lock_holder",
            CollabError::NotFound(_) => "not_found",
            CollabError::BlockLocked { .. } => "block_locked",
            CollabError::NotInDocument { .. } => "not_in_document",
            CollabError::DuplicateConnection(_) => "duplicate_connection",
            CollabError::ConnectionLost => "connection_lost",
            CollabError::MalformedMessage(_) => "malformed_message",
            CollabError::InvalidRequest(_) => "invalid_request",
            CollabError::Store(_) => "storage",
            CollabError::Shutdown => "shutdown",
        }
    }
}

impl From<ProtocolError> for CollabError {
    fn from(e: ProtocolError) -> Self {
        CollabError::MalformedMessage(e.to_string())
    }
}

pub type Result<T, E = CollabError> = std::result::Result<T, E>;
