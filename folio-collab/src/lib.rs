//! # folio-collab — Real-time block collaboration core
//!
//! Several people edit one structured document at the same time. Each
//! document is a flat list of blocks; a block is edited only under an
//! exclusive, session-scoped lock, every committed edit becomes a numbered
//! version, and every change is broadcast to everyone viewing the document.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket       ┌──────────────┐
//! │ CollabClient │ ◄─────────────────► │ CollabServer │
//! │ + SyncEngine │   JSON {type,payload}│   (central)  │
//! └──────────────┘                     └──────┬───────┘
//!                                             │
//!                                      ┌──────┴───────┐
//!                                      │     Hub      │ sessions
//!                                      └──────┬───────┘
//!                                             │ one actor per document
//!                                      ┌──────┴───────┐
//!                                      │ DocumentRoom │ locks, blocks,
//!                                      │              │ versions, fan-out
//!                                      └──────┬───────┘
//!                                             │
//!                                      ┌──────┴───────┐
//!                                      │   Storage    │ memory | RocksDB
//!                                      └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire protocol
//! - [`session`] — Session registry and heartbeat expiry
//! - [`locks`] — Block lock manager
//! - [`versioner`] — Per-document block state and version log
//! - [`structure`] — Block ordering, tables and templates
//! - [`broadcast`] — Per-document event fan-out
//! - [`room`] — Document room actors
//! - [`hub`] — Sessions-to-rooms coordination
//! - [`storage`] — Document, version and template stores
//! - [`server`] — WebSocket server
//! - [`client`] — WebSocket client with bounded reconnect
//! - [`sync`] — Client-side lock tracking, undo/redo and update throttling

pub mod broadcast;
pub mod client;
pub mod error;
pub mod hub;
pub mod locks;
pub mod model;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;
pub mod structure;
pub mod sync;
pub mod versioner;

// Re-exports for convenience
pub use broadcast::{Audience, BroadcastGroup, BroadcastStats, Envelope};
pub use client::{ClientConfig, ClientEvent, CollabClient, ConnectionState, ReconnectPolicy};
pub use error::{CollabError, Missing, Result};
pub use hub::Hub;
pub use locks::{AcquireOutcome, Lock, LockManager, ReleaseOutcome};
pub use model::{
    Block, BlockId, BlockMetadata, BlockType, Document, DocumentId, Participant, SessionId,
    Template, TemplateBlock, Version, VersionId, VersionSummary,
};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use room::{RoomHandle, RoomManager};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use session::{ConnectionId, DisconnectReason, SessionRegistry};
pub use storage::{
    DocumentStore, MemoryStore, RocksStore, Storage, StoreConfig, StoreError, TemplateStore,
    VersionStore,
};
pub use structure::{ColumnWidth, GridCell, TableGrid};
pub use sync::{LockState, SyncConfig, SyncEngine, SyncError};
pub use versioner::DocumentLog;
