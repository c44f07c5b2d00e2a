//! Domain types shared by the server, the storage backends and the client.
//!
//! ```text
//! Document ──┬── Block (text | heading | hr)
//!            ├── Block (table) ──┬── Block (table-options)   parent_block_id = table
//!            │                   └── Block (table-cell)×N    parent_block_id = table, row/col
//!            └── Version×N   (one record per committed block edit)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use uuid::Uuid;

pub type DocumentId = Uuid;
pub type SessionId = Uuid;
pub type BlockId = String;
pub type VersionId = u64;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Kind of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockType {
    Text,
    Heading,
    TableCell,
    TableOptions,
    Table,
    Hr,
}

impl BlockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Text => "text",
            BlockType::Heading => "heading",
            BlockType::TableCell => "table-cell",
            BlockType::TableOptions => "table-options",
            BlockType::Table => "table",
            BlockType::Hr => "hr",
        }
    }

    /// Blocks that only exist as part of a table.
    pub fn is_table_part(&self) -> bool {
        matches!(self, BlockType::TableCell | BlockType::TableOptions)
    }

    /// Blocks whose content a user authors directly.
    pub fn is_authored(&self) -> bool {
        matches!(self, BlockType::Text | BlockType::Heading | BlockType::TableCell)
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(BlockType::Text),
            "heading" => Ok(BlockType::Heading),
            "table-cell" => Ok(BlockType::TableCell),
            "table-options" => Ok(BlockType::TableOptions),
            "table" => Ok(BlockType::Table),
            "hr" => Ok(BlockType::Hr),
            other => Err(format!("unknown block type '{other}'")),
        }
    }
}

/// A single addressable piece of document content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub block_id: BlockId,
    pub document_id: DocumentId,
    pub block_type: BlockType,
    /// Opaque rendered fragment.
    pub content: String,
    /// Relative position; not necessarily contiguous.
    pub order: i64,
    #[serde(default)]
    pub style_classes: String,
    #[serde(default)]
    pub level: Option<u8>,
    #[serde(default)]
    pub alt_text: Option<String>,
    #[serde(default)]
    pub row_index: Option<u32>,
    #[serde(default)]
    pub col_index: Option<u32>,
    #[serde(default)]
    pub parent_block_id: Option<BlockId>,
}

impl Block {
    pub fn new(
        document_id: DocumentId,
        block_id: impl Into<BlockId>,
        block_type: BlockType,
        content: impl Into<String>,
        order: i64,
    ) -> Self {
        Self {
            block_id: block_id.into(),
            document_id,
            block_type,
            content: content.into(),
            order,
            style_classes: String::new(),
            level: None,
            alt_text: None,
            row_index: None,
            col_index: None,
            parent_block_id: None,
        }
    }

    /// A table cell at `(row, col)` of `table_id`.
    pub fn cell(
        document_id: DocumentId,
        table_id: &str,
        row: u32,
        col: u32,
        content: impl Into<String>,
        order: i64,
    ) -> Self {
        let mut block = Self::new(
            document_id,
            Uuid::new_v4().to_string(),
            BlockType::TableCell,
            content,
            order,
        );
        block.row_index = Some(row);
        block.col_index = Some(col);
        block.parent_block_id = Some(table_id.to_string());
        block
    }

    /// Full metadata snapshot of this block.
    pub fn metadata(&self) -> BlockMetadata {
        BlockMetadata {
            block_type: Some(self.block_type),
            style_classes: Some(self.style_classes.clone()),
            level: self.level,
            alt_text: self.alt_text.clone(),
            row_index: self.row_index,
            col_index: self.col_index,
            parent_block_id: self.parent_block_id.clone(),
        }
    }

    /// Overlay the fields present in `metadata`.
    ///
    /// Structural fields (type, parent, row, col) are only honoured for
    /// authored blocks that stay authored; a table's shape changes through
    /// the structure operations, not through commits.
    pub fn apply_metadata(&mut self, metadata: &BlockMetadata) {
        if let Some(style) = &metadata.style_classes {
            self.style_classes = style.clone();
        }
        if metadata.level.is_some() {
            self.level = metadata.level;
        }
        if metadata.alt_text.is_some() {
            self.alt_text = metadata.alt_text.clone();
        }
        if let Some(block_type) = metadata.block_type {
            let convertible = |t: BlockType| matches!(t, BlockType::Text | BlockType::Heading);
            if convertible(self.block_type) && convertible(block_type) {
                self.block_type = block_type;
                if block_type == BlockType::Heading && self.level.is_none() {
                    self.level = Some(2);
                }
            }
        }
    }
}

/// Partial block metadata carried by updates; absent fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockMetadata {
    pub block_type: Option<BlockType>,
    pub style_classes: Option<String>,
    pub level: Option<u8>,
    pub alt_text: Option<String>,
    pub row_index: Option<u32>,
    pub col_index: Option<u32>,
    pub parent_block_id: Option<BlockId>,
}

/// Document header. Block order lives on the blocks themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub document_id: DocumentId,
    pub title: String,
    /// Milliseconds since epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

impl Document {
    pub fn new(title: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            document_id: Uuid::new_v4(),
            title: title.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Immutable record of one committed block edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub document_id: DocumentId,
    pub version_id: VersionId,
    pub block_id: BlockId,
    pub content: String,
    pub metadata: BlockMetadata,
    pub changed_by: String,
    pub timestamp: u64,
}

impl Version {
    pub fn summary(&self) -> VersionSummary {
        VersionSummary {
            version_id: self.version_id,
            block_id: self.block_id.clone(),
            changed_by: self.changed_by.clone(),
            timestamp: self.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub version_id: VersionId,
    pub block_id: BlockId,
    pub changed_by: String,
    pub timestamp: u64,
}

/// A session as seen by a document: who is asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub session_id: SessionId,
    pub display_name: String,
}

impl Participant {
    pub fn new(session_id: SessionId, display_name: impl Into<String>) -> Self {
        Self {
            session_id,
            display_name: display_name.into(),
        }
    }
}

/// New position of a block whose order was rewritten by an insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockOrder {
    pub block_id: BlockId,
    pub order: i64,
}

/// New row index of a cell moved down by a row insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellShift {
    pub block_id: BlockId,
    pub row_index: u32,
}

/// One item of a document template.
///
/// Plain blocks use `content`/`style_classes`/`level`/`alt_text`; a table item
/// carries `options` (the table-options value) and `rows` of cell content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateBlock {
    pub block_type: BlockType,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub style_classes: String,
    #[serde(default)]
    pub level: Option<u8>,
    #[serde(default)]
    pub alt_text: Option<String>,
    #[serde(default)]
    pub options: Option<serde_json::Value>,
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
}

impl TemplateBlock {
    pub fn new(block_type: BlockType, content: impl Into<String>) -> Self {
        Self {
            block_type,
            content: content.into(),
            style_classes: String::new(),
            level: None,
            alt_text: None,
            options: None,
            rows: Vec::new(),
        }
    }
}

pub type Template = Vec<TemplateBlock>;
