//! Persistence boundary for documents, versions and templates.
//!
//! ```text
//! ┌──────────────┐  load on first open   ┌──────────────────────────────┐
//! │ DocumentRoom │ ◄──────────────────── │ Storage                      │
//! │ (in-memory)  │ ────────────────────► │  DocumentStore  VersionStore │
//! └──────────────┘  versions + blocks    │  TemplateStore               │
//!                                        └───────┬──────────────┬───────┘
//!                                                ▼              ▼
//!                                          MemoryStore     RocksStore
//! ```
//!
//! The rooms own the live state; stores only see finished writes. Stores are
//! synchronous and cheap enough to call from inside a room task.

pub mod memory;
pub mod rocks;

use std::path::Path;

use crate::model::{Block, BlockId, Document, DocumentId, Template, Version, VersionId};

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    DatabaseError(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("deserialization error: {0}")]
    DeserializationError(String),
    #[error("compression error: {0}")]
    CompressionError(String),
    #[error("I/O error: {0}")]
    IoError(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::IoError(e.to_string())
    }
}

/// A document header with all of its blocks, in no particular order.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub document: Document,
    pub blocks: Vec<Block>,
}

pub trait DocumentStore: Send + Sync {
    fn get_document(&self, document_id: DocumentId) -> Result<Option<StoredDocument>, StoreError>;

    fn create_document(&self, document: &Document, blocks: &[Block]) -> Result<(), StoreError>;

    /// Headers of every stored document, oldest first.
    fn list_documents(&self) -> Result<Vec<Document>, StoreError>;

    /// Insert or overwrite blocks and bump the document's `updated_at`.
    fn put_blocks(&self, document_id: DocumentId, blocks: &[Block]) -> Result<(), StoreError>;

    fn delete_blocks(&self, document_id: DocumentId, block_ids: &[BlockId])
        -> Result<(), StoreError>;
}

pub trait VersionStore: Send + Sync {
    fn append_version(&self, version: &Version) -> Result<(), StoreError>;

    /// Append `version` and write `block` as its new live state in one
    /// atomic write. Either both land or neither does.
    fn commit_version(&self, version: &Version, block: &Block) -> Result<(), StoreError>;

    /// All versions of a document, ascending by id.
    fn list_versions(&self, document_id: DocumentId) -> Result<Vec<Version>, StoreError>;

    fn get_version(
        &self,
        document_id: DocumentId,
        version_id: VersionId,
    ) -> Result<Option<Version>, StoreError>;
}

pub trait TemplateStore: Send + Sync {
    fn save_template(&self, name: &str, template: &Template) -> Result<(), StoreError>;

    fn get_template(&self, name: &str) -> Result<Option<Template>, StoreError>;

    /// Template names, sorted.
    fn list_templates(&self) -> Result<Vec<String>, StoreError>;
}

/// Everything the collaboration core needs from persistence.
pub trait Storage: DocumentStore + VersionStore + TemplateStore {}

impl<T: DocumentStore + VersionStore + TemplateStore> Storage for T {}

/// Reduce a user-supplied template name to `[A-Za-z0-9_-]`.
pub fn sanitize_template_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// Load every `*.json` template in `dir` into `store`, named after the file stem.
///
/// Files that fail to parse are skipped with a warning. Returns the names loaded.
pub fn import_templates(dir: &Path, store: &dyn TemplateStore) -> Result<Vec<String>, StoreError> {
    let mut loaded = Vec::new();
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    for path in paths {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let name = sanitize_template_name(stem);
        if name.is_empty() {
            continue;
        }
        let text = std::fs::read_to_string(&path)?;
        match serde_json::from_str::<Template>(&text) {
            Ok(template) => {
                store.save_template(&name, &template)?;
                log::info!("Imported template '{name}' ({} items)", template.len());
                loaded.push(name);
            }
            Err(e) => log::warn!("Skipping template {}: {e}", path.display()),
        }
    }
    Ok(loaded)
}
