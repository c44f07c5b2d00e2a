//! Live state of one document and its append-only version log.
//!
//! A `DocumentLog` is owned by exactly one document room. Every write goes to
//! the store first; the in-memory copy only changes once the store accepted it.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{CollabError, Missing, Result};
use crate::locks::LockManager;
use crate::model::{
    now_millis, Block, BlockId, BlockMetadata, BlockOrder, BlockType, CellShift, Document,
    DocumentId, Participant, Template, Version, VersionId, VersionSummary,
};
use crate::storage::{DocumentStore, Storage, VersionStore};
use crate::structure::{self, TableGrid};

/// Result of inserting blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct AddedBlocks {
    pub added: Vec<Block>,
    pub reordered: Vec<BlockOrder>,
}

/// Result of inserting a table row.
#[derive(Debug, Clone, PartialEq)]
pub struct AddedRow {
    pub row_index: u32,
    pub added: Vec<Block>,
    pub shifted: Vec<CellShift>,
}

pub struct DocumentLog {
    document: Document,
    blocks: HashMap<BlockId, Block>,
    next_version: VersionId,
    store: Arc<dyn Storage>,
}

impl DocumentLog {
    /// Load a document and pick up its version counter where it left off.
    pub fn open(store: Arc<dyn Storage>, document_id: DocumentId) -> Result<Self> {
        let stored = store
            .get_document(document_id)?
            .ok_or(CollabError::NotFound(Missing::Document(document_id)))?;
        let next_version = store
            .list_versions(document_id)?
            .iter()
            .map(|v| v.version_id)
            .max()
            .map_or(1, |v| v + 1);

        log::debug!(
            "Loaded document {document_id} ({} blocks, next version {next_version})",
            stored.blocks.len()
        );
        Ok(Self {
            document: stored.document,
            blocks: stored
                .blocks
                .into_iter()
                .map(|b| (b.block_id.clone(), b))
                .collect(),
            next_version,
            store,
        })
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn document_id(&self) -> DocumentId {
        self.document.document_id
    }

    pub fn block(&self, block_id: &str) -> Result<&Block> {
        self.blocks
            .get(block_id)
            .ok_or_else(|| CollabError::NotFound(Missing::Block(block_id.to_string())))
    }

    pub fn contains(&self, block_id: &str) -> bool {
        self.blocks.contains_key(block_id)
    }

    /// Id of the newest version, 0 when nothing was committed yet.
    pub fn latest_version(&self) -> VersionId {
        self.next_version - 1
    }

    pub fn ordered_blocks(&self) -> Vec<&Block> {
        let mut blocks: Vec<&Block> = self.blocks.values().collect();
        structure::sort_blocks(&mut blocks);
        blocks
    }

    pub fn ordered_ids(&self) -> Vec<BlockId> {
        self.ordered_blocks()
            .into_iter()
            .map(|b| b.block_id.clone())
            .collect()
    }

    /// Commit new content for a block the caller holds the lock on.
    pub fn commit(
        &mut self,
        locks: &LockManager,
        block_id: &str,
        content: &str,
        metadata: &BlockMetadata,
        who: &Participant,
    ) -> Result<Version> {
        self.block(block_id)?;
        if !locks.is_held_by(block_id, who.session_id) {
            return Err(CollabError::NotLockHolder {
                block_id: block_id.to_string(),
            });
        }
        self.record(block_id, content, metadata, who)
    }

    /// Append a version and update the live block, without a lock check.
    fn record(
        &mut self,
        block_id: &str,
        content: &str,
        metadata: &BlockMetadata,
        who: &Participant,
    ) -> Result<Version> {
        let mut block = self.block(block_id)?.clone();
        block.content = content.to_string();
        block.apply_metadata(metadata);

        let version = Version {
            document_id: self.document.document_id,
            version_id: self.next_version,
            block_id: block.block_id.clone(),
            content: block.content.clone(),
            metadata: block.metadata(),
            changed_by: who.display_name.clone(),
            timestamp: now_millis(),
        };
        self.store.commit_version(&version, &block)?;

        self.next_version += 1;
        self.document.updated_at = version.timestamp;
        self.blocks.insert(block.block_id.clone(), block);
        log::info!(
            "Committed version {} of {} block {block_id} by '{}'",
            version.version_id,
            self.document.document_id,
            who.display_name
        );
        Ok(version)
    }

    /// Insert a new block (or table group) after `after`.
    pub fn add_block(&mut self, block_type: BlockType, after: Option<&str>) -> Result<AddedBlocks> {
        let mut group = structure::new_block_group(self.document.document_id, block_type)?;
        if let Some(anchor) = after.filter(|id| !self.contains(id)) {
            log::warn!(
                "Anchor block {anchor} not in document {}, appending at end",
                self.document.document_id
            );
        }
        let plan = structure::plan_insertion(self.blocks.values(), after, group.len());
        for (block, order) in group.iter_mut().zip(&plan.orders) {
            block.order = *order;
        }
        self.apply_reorder_and_insert(&plan.reordered, &group)?;
        log::info!(
            "Added {block_type} ({} blocks) to document {}",
            group.len(),
            self.document.document_id
        );
        Ok(AddedBlocks {
            added: group,
            reordered: plan.reordered,
        })
    }

    fn apply_reorder_and_insert(&mut self, reordered: &[BlockOrder], added: &[Block]) -> Result<()> {
        let mut writes: Vec<Block> = reordered
            .iter()
            .filter_map(|r| {
                self.blocks.get(&r.block_id).map(|b| Block {
                    order: r.order,
                    ..b.clone()
                })
            })
            .collect();
        writes.extend_from_slice(added);
        self.store.put_blocks(self.document.document_id, &writes)?;
        for block in writes {
            self.blocks.insert(block.block_id.clone(), block);
        }
        Ok(())
    }

    /// Ids that deleting `block_id` would remove.
    pub fn removal_set(&self, block_id: &str) -> Result<Vec<BlockId>> {
        let target = self.block(block_id)?;
        Ok(structure::removal_set(self.blocks.values(), target))
    }

    pub fn remove_blocks(&mut self, block_ids: &[BlockId]) -> Result<()> {
        self.store.delete_blocks(self.document.document_id, block_ids)?;
        for id in block_ids {
            self.blocks.remove(id);
        }
        log::info!(
            "Removed {} blocks from document {}",
            block_ids.len(),
            self.document.document_id
        );
        Ok(())
    }

    fn table_block(&self, table_id: &str) -> Result<&Block> {
        let table = self.block(table_id)?;
        if table.block_type != BlockType::Table {
            return Err(CollabError::InvalidRequest(format!("{table_id} is not a table")));
        }
        Ok(table)
    }

    fn options_block_of(&self, table_id: &str) -> Result<&Block> {
        self.blocks
            .values()
            .filter(|b| b.block_type == BlockType::TableOptions)
            .filter(|b| b.parent_block_id.as_deref() == Some(table_id))
            .min_by_key(|b| b.order)
            .ok_or_else(|| CollabError::NotFound(Missing::Block(structure::options_block_id(table_id))))
    }

    /// Replace a table's options. Needs no lock, but is refused while another
    /// session holds the table or its options block.
    pub fn update_table_options(
        &mut self,
        locks: &LockManager,
        table_id: &str,
        options_json: &str,
        who: &Participant,
    ) -> Result<Version> {
        self.table_block(table_id)?;
        let options_id = self.options_block_of(table_id)?.block_id.clone();
        if let Err(e) = serde_json::from_str::<serde_json::Value>(options_json) {
            return Err(CollabError::InvalidRequest(format!("options_json: {e}")));
        }
        for id in [table_id, options_id.as_str()] {
            if let Some(lock) = locks.holder(id).filter(|l| l.holder != who.session_id) {
                return Err(CollabError::BlockLocked {
                    block_id: id.to_string(),
                    holder: lock.holder_name.clone(),
                });
            }
        }
        self.record(&options_id, options_json, &BlockMetadata::default(), who)
    }

    /// Insert a row of empty cells into a table.
    pub fn add_table_row(&mut self, table_id: &str, after_row: Option<u32>) -> Result<AddedRow> {
        self.table_block(table_id)?;
        let plan = structure::plan_row_insertion(
            self.document.document_id,
            table_id,
            self.blocks.values(),
            after_row,
        );
        let mut cells = plan.cells;
        let slots = structure::plan_insertion(self.blocks.values(), Some(table_id), cells.len());
        for (cell, order) in cells.iter_mut().zip(&slots.orders) {
            cell.order = *order;
        }

        let mut writes: Vec<Block> = plan
            .shifted
            .iter()
            .filter_map(|s| {
                self.blocks.get(&s.block_id).map(|b| Block {
                    row_index: Some(s.row_index),
                    ..b.clone()
                })
            })
            .collect();
        for moved in &slots.reordered {
            match writes.iter_mut().find(|b| b.block_id == moved.block_id) {
                Some(block) => block.order = moved.order,
                None => {
                    if let Some(b) = self.blocks.get(&moved.block_id) {
                        writes.push(Block {
                            order: moved.order,
                            ..b.clone()
                        });
                    }
                }
            }
        }
        writes.extend(cells.iter().cloned());

        self.store.put_blocks(self.document.document_id, &writes)?;
        for block in writes {
            self.blocks.insert(block.block_id.clone(), block);
        }
        log::info!(
            "Inserted row {} into table {table_id} of document {}",
            plan.row_index,
            self.document.document_id
        );
        Ok(AddedRow {
            row_index: plan.row_index,
            added: cells,
            shifted: plan.shifted,
        })
    }

    /// Version summaries, newest first.
    pub fn history(&self) -> Result<Vec<VersionSummary>> {
        let versions = self.store.list_versions(self.document.document_id)?;
        Ok(versions.iter().rev().map(Version::summary).collect())
    }

    pub fn version(&self, version_id: VersionId) -> Result<Version> {
        self.store
            .get_version(self.document.document_id, version_id)?
            .ok_or(CollabError::NotFound(Missing::Version(version_id)))
    }

    pub fn table(&self, table_id: &str) -> Result<TableGrid> {
        self.table_block(table_id)?;
        Ok(structure::assemble_table(table_id, self.blocks.values()))
    }

    pub fn to_template(&self) -> Template {
        structure::to_template(self.blocks.values())
    }
}
