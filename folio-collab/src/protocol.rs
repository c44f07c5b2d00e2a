//! JSON wire protocol.
//!
//! Every frame is a text WebSocket message holding one envelope:
//! ```text
//! { "type": "lock_block", "payload": { "document_id": "…", "block_id": "b1" } }
//! ```
//! The `type` tag is the snake_case variant name; the payload is the
//! variant's fields.

use serde::{Deserialize, Serialize};

use crate::locks::Lock;
use crate::model::{
    Block, BlockId, BlockMetadata, BlockOrder, BlockType, CellShift, Document, DocumentId,
    SessionId, Version, VersionId, VersionSummary,
};

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    SetUsername {
        username: String,
    },
    Heartbeat {
        #[serde(default)]
        client_time: Option<u64>,
    },
    OpenDocument {
        document_id: DocumentId,
    },
    LockBlock {
        document_id: DocumentId,
        block_id: BlockId,
    },
    UnlockBlock {
        document_id: DocumentId,
        block_id: BlockId,
    },
    UpdateDocument {
        document_id: DocumentId,
        block_id: BlockId,
        #[serde(default)]
        content: String,
        #[serde(default)]
        metadata: BlockMetadata,
    },
    AddBlock {
        document_id: DocumentId,
        block_type: BlockType,
        #[serde(default)]
        after_block_id: Option<BlockId>,
    },
    DeleteBlock {
        document_id: DocumentId,
        block_id: BlockId,
    },
    UpdateTableOptions {
        document_id: DocumentId,
        table_id: BlockId,
        options_json: String,
    },
    AddTableRow {
        document_id: DocumentId,
        table_id: BlockId,
        #[serde(default)]
        after_row_index: Option<u32>,
    },
    GetHistory {
        document_id: DocumentId,
    },
    GetVersion {
        document_id: DocumentId,
        version_id: VersionId,
    },
}

impl ClientMessage {
    /// The document this message operates on, if any.
    pub fn document_id(&self) -> Option<DocumentId> {
        match self {
            ClientMessage::SetUsername { .. } | ClientMessage::Heartbeat { .. } => None,
            ClientMessage::OpenDocument { document_id }
            | ClientMessage::LockBlock { document_id, .. }
            | ClientMessage::UnlockBlock { document_id, .. }
            | ClientMessage::UpdateDocument { document_id, .. }
            | ClientMessage::AddBlock { document_id, .. }
            | ClientMessage::DeleteBlock { document_id, .. }
            | ClientMessage::UpdateTableOptions { document_id, .. }
            | ClientMessage::AddTableRow { document_id, .. }
            | ClientMessage::GetHistory { document_id }
            | ClientMessage::GetVersion { document_id, .. } => Some(*document_id),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionAck {
        session_id: SessionId,
        username: String,
    },
    HeartbeatAck {
        server_time: u64,
    },
    DocumentSnapshot {
        document: Document,
        blocks: Vec<Block>,
        locks: Vec<Lock>,
        latest_version: VersionId,
    },
    BlockLocked {
        document_id: DocumentId,
        block_id: BlockId,
        locked_by: String,
        session_id: SessionId,
    },
    BlockUnlocked {
        document_id: DocumentId,
        block_id: BlockId,
        unlocked_by: String,
        session_id: SessionId,
    },
    LockDenied {
        document_id: DocumentId,
        block_id: BlockId,
        locked_by: String,
    },
    DocumentUpdated {
        document_id: DocumentId,
        block_id: BlockId,
        version_id: VersionId,
        content_html: String,
        metadata: BlockMetadata,
        updated_by: String,
        session_id: SessionId,
    },
    BlockAdded {
        document_id: DocumentId,
        added_blocks: Vec<Block>,
        after_block_id: Option<BlockId>,
        #[serde(default)]
        reordered: Vec<BlockOrder>,
    },
    BlockDeleted {
        document_id: DocumentId,
        block_id: BlockId,
        #[serde(default)]
        removed_block_ids: Vec<BlockId>,
    },
    TableOptionsUpdated {
        document_id: DocumentId,
        table_id: BlockId,
        options_json: String,
        version_id: VersionId,
    },
    TableRowAdded {
        document_id: DocumentId,
        table_id: BlockId,
        row_index: u32,
        added_blocks: Vec<Block>,
        #[serde(default)]
        shifted: Vec<CellShift>,
    },
    History {
        document_id: DocumentId,
        versions: Vec<VersionSummary>,
    },
    Version {
        version: Version,
    },
    Error {
        #[serde(default)]
        error_code: String,
        error_message: String,
    },
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            error_code: code.into(),
            error_message: message.into(),
        }
    }

    /// Wire name of the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::SessionAck { .. } => "session_ack",
            ServerMessage::HeartbeatAck { .. } => "heartbeat_ack",
            ServerMessage::DocumentSnapshot { .. } => "document_snapshot",
            ServerMessage::BlockLocked { .. } => "block_locked",
            ServerMessage::BlockUnlocked { .. } => "block_unlocked",
            ServerMessage::LockDenied { .. } => "lock_denied",
            ServerMessage::DocumentUpdated { .. } => "document_updated",
            ServerMessage::BlockAdded { .. } => "block_added",
            ServerMessage::BlockDeleted { .. } => "block_deleted",
            ServerMessage::TableOptionsUpdated { .. } => "table_options_updated",
            ServerMessage::TableRowAdded { .. } => "table_row_added",
            ServerMessage::History { .. } => "history",
            ServerMessage::Version { .. } => "version",
            ServerMessage::Error { .. } => "error",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
}
