//! In-process store. Default backend; nothing survives a restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::{DocumentStore, StoreError, StoredDocument, TemplateStore, VersionStore};
use crate::model::{now_millis, Block, BlockId, Document, DocumentId, Template, Version, VersionId};

#[derive(Debug)]
struct DocumentEntry {
    document: Document,
    blocks: HashMap<BlockId, Block>,
    versions: BTreeMap<VersionId, Version>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<DocumentId, DocumentEntry>>,
    templates: RwLock<BTreeMap<String, Template>>,
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::DatabaseError("memory store lock poisoned".into())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for MemoryStore {
    fn get_document(&self, document_id: DocumentId) -> Result<Option<StoredDocument>, StoreError> {
        let docs = self.documents.read().map_err(poisoned)?;
        Ok(docs.get(&document_id).map(|entry| StoredDocument {
            document: entry.document.clone(),
            blocks: entry.blocks.values().cloned().collect(),
        }))
    }

    fn create_document(&self, document: &Document, blocks: &[Block]) -> Result<(), StoreError> {
        let mut docs = self.documents.write().map_err(poisoned)?;
        docs.insert(
            document.document_id,
            DocumentEntry {
                document: document.clone(),
                blocks: blocks
                    .iter()
                    .map(|b| (b.block_id.clone(), b.clone()))
                    .collect(),
                versions: BTreeMap::new(),
            },
        );
        Ok(())
    }

    fn list_documents(&self) -> Result<Vec<Document>, StoreError> {
        let docs = self.documents.read().map_err(poisoned)?;
        let mut list: Vec<Document> = docs.values().map(|e| e.document.clone()).collect();
        list.sort_by_key(|d| (d.created_at, d.document_id));
        Ok(list)
    }

    fn put_blocks(&self, document_id: DocumentId, blocks: &[Block]) -> Result<(), StoreError> {
        let mut docs = self.documents.write().map_err(poisoned)?;
        let entry = docs
            .get_mut(&document_id)
            .ok_or_else(|| StoreError::NotFound(format!("document {document_id}")))?;
        for block in blocks {
            entry.blocks.insert(block.block_id.clone(), block.clone());
        }
        entry.document.updated_at = now_millis();
        Ok(())
    }

    fn delete_blocks(
        &self,
        document_id: DocumentId,
        block_ids: &[BlockId],
    ) -> Result<(), StoreError> {
        let mut docs = self.documents.write().map_err(poisoned)?;
        if let Some(entry) = docs.get_mut(&document_id) {
            for id in block_ids {
                entry.blocks.remove(id);
            }
            entry.document.updated_at = now_millis();
        }
        Ok(())
    }
}

impl VersionStore for MemoryStore {
    fn append_version(&self, version: &Version) -> Result<(), StoreError> {
        let mut docs = self.documents.write().map_err(poisoned)?;
        let entry = docs
            .get_mut(&version.document_id)
            .ok_or_else(|| StoreError::NotFound(format!("document {}", version.document_id)))?;
        entry.versions.insert(version.version_id, version.clone());
        Ok(())
    }

    fn commit_version(&self, version: &Version, block: &Block) -> Result<(), StoreError> {
        let mut docs = self.documents.write().map_err(poisoned)?;
        let entry = docs
            .get_mut(&version.document_id)
            .ok_or_else(|| StoreError::NotFound(format!("document {}", version.document_id)))?;
        entry.versions.insert(version.version_id, version.clone());
        entry.blocks.insert(block.block_id.clone(), block.clone());
        entry.document.updated_at = version.timestamp;
        Ok(())
    }

    fn list_versions(&self, document_id: DocumentId) -> Result<Vec<Version>, StoreError> {
        let docs = self.documents.read().map_err(poisoned)?;
        Ok(docs
            .get(&document_id)
            .map(|e| e.versions.values().cloned().collect())
            .unwrap_or_default())
    }

    fn get_version(
        &self,
        document_id: DocumentId,
        version_id: VersionId,
    ) -> Result<Option<Version>, StoreError> {
        let docs = self.documents.read().map_err(poisoned)?;
        Ok(docs
            .get(&document_id)
            .and_then(|e| e.versions.get(&version_id).cloned()))
    }
}

impl TemplateStore for MemoryStore {
    fn save_template(&self, name: &str, template: &Template) -> Result<(), StoreError> {
        self.templates
            .write()
            .map_err(poisoned)?
            .insert(name.to_string(), template.clone());
        Ok(())
    }

    fn get_template(&self, name: &str) -> Result<Option<Template>, StoreError> {
        Ok(self.templates.read().map_err(poisoned)?.get(name).cloned())
    }

    fn list_templates(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.templates.read().map_err(poisoned)?.keys().cloned().collect())
    }
}
