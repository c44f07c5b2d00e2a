//! Block structure: ordering, table shape and templates.
//!
//! Everything here is a pure function over blocks. The document room decides
//! when to call them and persists the results.
//!
//! A table is stored flat:
//! ```text
//!   table            block_id = T
//!   table-options    parent = T     content = {"columns": ["150px", "auto"]}
//!   table-cell       parent = T     row 0, col 0
//!   table-cell       parent = T     row 0, col 1
//!   …
//! ```
//! and reassembled on demand by [`assemble_table`].

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{CollabError, Result};
use crate::model::{Block, BlockId, BlockOrder, BlockType, CellShift, DocumentId, Template, TemplateBlock};

/// Spacing between consecutive block orders when there is room to choose.
pub const ORDER_STEP: i64 = 1024;

/// Narrowest column a table renders with, in pixels.
pub const MIN_COLUMN_WIDTH: u32 = 40;

pub const DEFAULT_TABLE_ROWS: u32 = 2;
pub const DEFAULT_TABLE_COLS: u32 = 2;
pub const DEFAULT_TABLE_OPTIONS: &str = r#"{"columns":["150px","150px"]}"#;

/// Id of the options block belonging to `table_id`.
pub fn options_block_id(table_id: &str) -> BlockId {
    format!("options_{table_id}")
}

/// Sort blocks by `(order, block_id)`.
pub fn sort_blocks(blocks: &mut [&Block]) {
    blocks.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.block_id.cmp(&b.block_id)));
}

/// The block that owns `block`'s position: its table for table parts, itself otherwise.
fn group_root(block: &Block) -> &str {
    match (&block.parent_block_id, block.block_type.is_table_part()) {
        (Some(parent), true) => parent.as_str(),
        _ => block.block_id.as_str(),
    }
}

fn in_group(block: &Block, root: &str) -> bool {
    block.block_id == root || block.parent_block_id.as_deref() == Some(root)
}

/// Orders for a run of new blocks plus any neighbors that had to move.
#[derive(Debug, Clone, PartialEq)]
pub struct Insertion {
    pub orders: Vec<i64>,
    pub reordered: Vec<BlockOrder>,
}

/// Plan `count` consecutive slots after `after`.
///
/// `after` may name any block; a table or one of its parts resolves to the end
/// of the whole table group. `None` or an unknown id appends at the end.
/// New orders are interpolated into the gap when it is wide enough, otherwise
/// following blocks are pushed down.
pub fn plan_insertion<'a>(
    blocks: impl IntoIterator<Item = &'a Block>,
    after: Option<&str>,
    count: usize,
) -> Insertion {
    let mut sorted: Vec<&Block> = blocks.into_iter().collect();
    sort_blocks(&mut sorted);
    let count_i = count as i64;

    let anchor = after
        .and_then(|id| sorted.iter().find(|b| b.block_id == id))
        .map(|b| group_root(b).to_string());
    let position = anchor
        .as_deref()
        .and_then(|root| sorted.iter().rposition(|b| in_group(b, root)));

    let append = |last: Option<i64>| {
        let base = last.map_or(0, |o| o + ORDER_STEP);
        Insertion {
            orders: (0..count_i).map(|k| base + k * ORDER_STEP).collect(),
            reordered: Vec::new(),
        }
    };

    let Some(index) = position else {
        return append(sorted.last().map(|b| b.order));
    };
    let prev = sorted[index].order;
    let rest = &sorted[index + 1..];
    let Some(next) = rest.first() else {
        return append(Some(prev));
    };

    let gap = next.order - prev;
    if gap > count_i {
        let step = gap / (count_i + 1);
        return Insertion {
            orders: (1..=count_i).map(|k| prev + k * step).collect(),
            reordered: Vec::new(),
        };
    }

    let orders: Vec<i64> = (1..=count_i).map(|k| prev + k * ORDER_STEP).collect();
    let mut cursor = orders.last().copied().unwrap_or(prev);
    let mut reordered = Vec::new();
    for block in rest {
        if block.order > cursor {
            break;
        }
        cursor += ORDER_STEP;
        reordered.push(BlockOrder {
            block_id: block.block_id.clone(),
            order: cursor,
        });
    }
    Insertion { orders, reordered }
}

/// Blocks created by `add_block` for `block_type`, with orders left at zero.
///
/// A table yields the table block, its options block and a 2×2 grid of empty
/// cells, in that order.
pub fn new_block_group(document_id: DocumentId, block_type: BlockType) -> Result<Vec<Block>> {
    if block_type.is_table_part() {
        return Err(CollabError::InvalidRequest(format!(
            "{block_type} blocks are created with their table"
        )));
    }

    let mut block = Block::new(
        document_id,
        Uuid::new_v4().to_string(),
        block_type,
        format!("New {block_type}"),
        0,
    );
    block.style_classes = format!("default-{block_type}");
    if block_type == BlockType::Heading {
        block.level = Some(2);
    }
    if block_type != BlockType::Table {
        return Ok(vec![block]);
    }

    let table_id = block.block_id.clone();
    let mut group = vec![block, options_block(document_id, &table_id, DEFAULT_TABLE_OPTIONS)];
    for row in 0..DEFAULT_TABLE_ROWS {
        for col in 0..DEFAULT_TABLE_COLS {
            group.push(Block::cell(document_id, &table_id, row, col, "", 0));
        }
    }
    Ok(group)
}

fn options_block(document_id: DocumentId, table_id: &str, content: &str) -> Block {
    let mut block = Block::new(
        document_id,
        options_block_id(table_id),
        BlockType::TableOptions,
        content,
        0,
    );
    block.parent_block_id = Some(table_id.to_string());
    block
}

/// Ids removed when deleting `block_id`: the block itself, plus every block
/// parented to it unless it is a table part.
pub fn removal_set<'a>(blocks: impl IntoIterator<Item = &'a Block>, target: &Block) -> Vec<BlockId> {
    let mut ids = vec![target.block_id.clone()];
    if !target.block_type.is_table_part() {
        let mut children: Vec<BlockId> = blocks
            .into_iter()
            .filter(|b| b.block_id != target.block_id)
            .filter(|b| b.parent_block_id.as_deref() == Some(target.block_id.as_str()))
            .map(|b| b.block_id.clone())
            .collect();
        children.sort();
        ids.extend(children);
    }
    ids
}

/// A new table row: where it goes, which cells move down, and the new cells.
#[derive(Debug, Clone, PartialEq)]
pub struct RowInsertion {
    pub row_index: u32,
    pub shifted: Vec<CellShift>,
    /// Empty cells with orders left at zero.
    pub cells: Vec<Block>,
}

/// Plan a row of empty cells after `after_row`, or at the bottom when `None`
/// or past the last row.
pub fn plan_row_insertion<'a>(
    document_id: DocumentId,
    table_id: &str,
    blocks: impl IntoIterator<Item = &'a Block>,
    after_row: Option<u32>,
) -> RowInsertion {
    let cells: Vec<&Block> = blocks
        .into_iter()
        .filter(|b| b.block_type == BlockType::TableCell)
        .filter(|b| b.parent_block_id.as_deref() == Some(table_id))
        .collect();

    let row_count = cells
        .iter()
        .filter_map(|c| c.row_index)
        .max()
        .map_or(0, |r| r + 1);
    let col_count = cells
        .iter()
        .filter_map(|c| c.col_index)
        .max()
        .map_or(DEFAULT_TABLE_COLS, |c| c + 1);

    let row_index = match after_row {
        Some(row) if row < row_count => row + 1,
        _ => row_count,
    };

    let mut shifted: Vec<CellShift> = cells
        .iter()
        .filter_map(|c| match c.row_index {
            Some(row) if row >= row_index => Some(CellShift {
                block_id: c.block_id.clone(),
                row_index: row + 1,
            }),
            _ => None,
        })
        .collect();
    shifted.sort_by(|a, b| a.block_id.cmp(&b.block_id));

    let cells = (0..col_count)
        .map(|col| Block::cell(document_id, table_id, row_index, col, "", 0))
        .collect();
    RowInsertion {
        row_index,
        shifted,
        cells,
    }
}

/// Width of one rendered column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnWidth {
    Px(u32),
    Auto,
}

impl fmt::Display for ColumnWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnWidth::Px(px) => write!(f, "{px}px"),
            ColumnWidth::Auto => f.write_str("auto"),
        }
    }
}

fn parse_width(value: &Value) -> ColumnWidth {
    let px = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            s.strip_suffix("px").unwrap_or(s).trim().parse::<f64>().ok()
        }
        _ => None,
    };
    match px {
        Some(px) if px.is_finite() && px >= 0.0 => {
            ColumnWidth::Px((px.round() as u32).max(MIN_COLUMN_WIDTH))
        }
        _ => {
            log::warn!("Malformed column width {value}, using auto");
            ColumnWidth::Auto
        }
    }
}

/// Column widths for `columns` columns from a table-options payload.
///
/// Accepts `{"columns": [...]}` or a bare array. Entries are `"NNpx"` or
/// numbers and are clamped to [`MIN_COLUMN_WIDTH`]; anything else, missing
/// entries, and unparseable options all become `Auto`.
pub fn parse_column_widths(options: &str, columns: usize) -> Vec<ColumnWidth> {
    let parsed: Option<Value> = if options.trim().is_empty() {
        None
    } else {
        match serde_json::from_str(options) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("Malformed table options ({e}), using auto widths");
                None
            }
        }
    };
    let list: &[Value] = match &parsed {
        Some(Value::Array(items)) => items.as_slice(),
        Some(Value::Object(map)) => match map.get("columns") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        _ => &[],
    };
    (0..columns)
        .map(|i| list.get(i).map_or(ColumnWidth::Auto, parse_width))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum GridCell {
    Cell(Block),
    /// Gap in the stored grid, rendered as an empty cell.
    Placeholder { row: u32, col: u32 },
}

impl GridCell {
    pub fn content(&self) -> &str {
        match self {
            GridCell::Cell(block) => &block.content,
            GridCell::Placeholder { .. } => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableGrid {
    pub table_id: BlockId,
    pub rows: Vec<Vec<GridCell>>,
    pub column_widths: Vec<ColumnWidth>,
    /// Raw content of the options block, if there is one.
    pub options: Option<String>,
}

impl TableGrid {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.column_widths.len()
    }

    pub fn placeholders(&self) -> usize {
        self.rows
            .iter()
            .flatten()
            .filter(|c| matches!(c, GridCell::Placeholder { .. }))
            .count()
    }
}

/// Rebuild the table `table_id` from the flat blocks of a document.
///
/// The grid spans rows `0..=max_row` and columns `0..=max_col`; missing
/// positions become placeholders. Cells without indices are skipped, and of
/// two cells at the same position the lower-ordered one wins.
pub fn assemble_table<'a>(table_id: &str, blocks: impl IntoIterator<Item = &'a Block>) -> TableGrid {
    let mut cells: BTreeMap<(u32, u32), &Block> = BTreeMap::new();
    let mut options: Option<&Block> = None;

    for block in blocks {
        if block.parent_block_id.as_deref() != Some(table_id) {
            continue;
        }
        match block.block_type {
            BlockType::TableOptions => {
                if options.map_or(true, |o| block.order < o.order) {
                    options = Some(block);
                }
            }
            BlockType::TableCell => {
                let (Some(row), Some(col)) = (block.row_index, block.col_index) else {
                    log::warn!("Cell {} of table {table_id} has no position", block.block_id);
                    continue;
                };
                if let Some(existing) = cells.get(&(row, col)).filter(|e| e.order <= block.order) {
                    log::warn!(
                        "Duplicate cell ({row},{col}) in table {table_id}: keeping {}",
                        existing.block_id
                    );
                    continue;
                }
                cells.insert((row, col), block);
            }
            _ => {}
        }
    }

    let row_count = cells.keys().map(|(r, _)| r + 1).max().unwrap_or(0);
    let col_count = cells.keys().map(|(_, c)| c + 1).max().unwrap_or(0);

    let rows: Vec<Vec<GridCell>> = (0..row_count)
        .map(|row| {
            (0..col_count)
                .map(|col| match cells.get(&(row, col)) {
                    Some(block) => GridCell::Cell((*block).clone()),
                    None => GridCell::Placeholder { row, col },
                })
                .collect()
        })
        .collect();

    let grid = TableGrid {
        table_id: table_id.to_string(),
        column_widths: parse_column_widths(
            options.map_or("", |o| o.content.as_str()),
            col_count as usize,
        ),
        options: options.map(|o| o.content.clone()),
        rows,
    };
    if grid.placeholders() > 0 {
        log::warn!(
            "Table {table_id} is missing {} cells, filled with placeholders",
            grid.placeholders()
        );
    }
    grid
}

/// Remove markup from an HTML fragment, leaving its text.
pub fn strip_tags(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}

/// Plain-text rows of a table.
pub fn table_text(grid: &TableGrid) -> Vec<Vec<String>> {
    grid.rows
        .iter()
        .map(|row| row.iter().map(|cell| strip_tags(cell.content())).collect())
        .collect()
}

/// Expand a template into the blocks of a new document, in order.
pub fn expand_template(document_id: DocumentId, template: &Template) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut next_order = 0i64;
    let mut push = |blocks: &mut Vec<Block>, mut block: Block| {
        block.order = next_order;
        next_order += ORDER_STEP;
        blocks.push(block);
    };

    for item in template {
        if item.block_type.is_table_part() {
            log::warn!("Template item of type {} outside a table, skipped", item.block_type);
            continue;
        }
        let mut block = Block::new(
            document_id,
            Uuid::new_v4().to_string(),
            item.block_type,
            item.content.clone(),
            0,
        );
        block.style_classes = item.style_classes.clone();
        block.level = item.level.or((item.block_type == BlockType::Heading).then_some(2));
        block.alt_text = item.alt_text.clone();

        if item.block_type != BlockType::Table {
            push(&mut blocks, block);
            continue;
        }

        let table_id = block.block_id.clone();
        let options = item
            .options
            .as_ref()
            .map(Value::to_string)
            .unwrap_or_else(|| DEFAULT_TABLE_OPTIONS.to_string());
        push(&mut blocks, block);
        push(&mut blocks, options_block(document_id, &table_id, &options));

        let rows: Vec<Vec<String>> = if item.rows.is_empty() {
            vec![vec![String::new(); DEFAULT_TABLE_COLS as usize]; DEFAULT_TABLE_ROWS as usize]
        } else {
            item.rows.clone()
        };
        for (r, row) in rows.iter().enumerate() {
            for (c, content) in row.iter().enumerate() {
                push(
                    &mut blocks,
                    Block::cell(document_id, &table_id, r as u32, c as u32, content.clone(), 0),
                );
            }
        }
    }
    blocks
}

/// Fold a document's blocks back into a template.
///
/// Tables are regrouped through [`assemble_table`]; gaps become empty strings.
pub fn to_template<'a>(blocks: impl IntoIterator<Item = &'a Block>) -> Template {
    let all: Vec<&Block> = blocks.into_iter().collect();
    let mut sorted = all.clone();
    sort_blocks(&mut sorted);

    let mut template = Vec::new();
    for block in sorted {
        if block.block_type.is_table_part() {
            continue;
        }
        let mut item = TemplateBlock::new(block.block_type, block.content.clone());
        item.style_classes = block.style_classes.clone();
        item.level = block.level;
        item.alt_text = block.alt_text.clone();

        if block.block_type == BlockType::Table {
            let grid = assemble_table(&block.block_id, all.iter().copied());
            item.content = String::new();
            item.options = grid
                .options
                .as_deref()
                .and_then(|o| serde_json::from_str(o).ok());
            item.rows = grid
                .rows
                .iter()
                .map(|row| row.iter().map(|c| c.content().to_string()).collect())
                .collect();
        }
        template.push(item);
    }
    template
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> DocumentId {
        Uuid::nil()
    }

    fn text(id: &str, order: i64) -> Block {
        Block::new(doc(), id, BlockType::Text, id, order)
    }

    #[test]
    fn test_insert_between_interpolates() {
        let blocks = vec![text("a", 0), text("b", 1024)];
        let plan = plan_insertion(&blocks, Some("a"), 1);
        assert_eq!(plan.orders, vec![512]);
        assert!(plan.reordered.is_empty());
    }

    #[test]
    fn test_insert_without_room_shifts_followers() {
        let blocks = vec![text("a", 0), text("b", 1), text("c", 2), text("d", 5000)];
        let plan = plan_insertion(&blocks, Some("a"), 2);
        assert_eq!(plan.orders, vec![1024, 2048]);
        assert_eq!(
            plan.reordered,
            vec![
                BlockOrder { block_id: "b".into(), order: 3072 },
                BlockOrder { block_id: "c".into(), order: 4096 },
            ]
        );
    }

    #[test]
    fn test_insert_unknown_anchor_appends() {
        let blocks = vec![text("a", 0), text("b", 1024)];
        assert_eq!(plan_insertion(&blocks, Some("zzz"), 1).orders, vec![2048]);
        assert_eq!(plan_insertion(&blocks, None, 1).orders, vec![2048]);
        assert_eq!(plan_insertion(&[], None, 2).orders, vec![0, 1024]);
    }

    #[test]
    fn test_insert_after_table_skips_its_cells() {
        let mut group = new_block_group(doc(), BlockType::Table).unwrap();
        for (i, block) in group.iter_mut().enumerate() {
            block.order = i as i64 * 10;
        }
        let table_id = group[0].block_id.clone();
        let cell_id = group[3].block_id.clone();
        group.push(text("after", 1000));

        let plan = plan_insertion(&group, Some(&table_id), 1);
        assert!(plan.orders[0] > 50 && plan.orders[0] < 1000);
        assert_eq!(plan_insertion(&group, Some(&cell_id), 1), plan);
    }

    #[test]
    fn test_new_table_group_shape() {
        let group = new_block_group(doc(), BlockType::Table).unwrap();
        assert_eq!(group.len(), 6);
        let table = &group[0];
        assert_eq!(table.block_type, BlockType::Table);
        assert_eq!(group[1].block_id, options_block_id(&table.block_id));
        assert_eq!(group[1].content, DEFAULT_TABLE_OPTIONS);

        let positions: Vec<_> = group[2..]
            .iter()
            .map(|c| {
                assert_eq!(c.parent_block_id.as_deref(), Some(table.block_id.as_str()));
                (c.row_index.unwrap(), c.col_index.unwrap())
            })
            .collect();
        assert_eq!(positions, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
    }

    #[test]
    fn test_new_block_defaults() {
        let heading = new_block_group(doc(), BlockType::Heading).unwrap().remove(0);
        assert_eq!(heading.content, "New heading");
        assert_eq!(heading.style_classes, "default-heading");
        assert_eq!(heading.level, Some(2));
        assert!(new_block_group(doc(), BlockType::TableCell).is_err());
    }

    #[test]
    fn test_removal_cascades_from_table_only() {
        let group = new_block_group(doc(), BlockType::Table).unwrap();
        let ids = removal_set(&group, &group[0]);
        assert_eq!(ids.len(), 6);
        assert_eq!(ids[0], group[0].block_id);

        let cell_only = removal_set(&group, &group[2]);
        assert_eq!(cell_only, vec![group[2].block_id.clone()]);
    }

    #[test]
    fn test_row_insertion_shifts_lower_rows() {
        let group = new_block_group(doc(), BlockType::Table).unwrap();
        let table_id = group[0].block_id.clone();
        let plan = plan_row_insertion(doc(), &table_id, &group, Some(0));
        assert_eq!(plan.row_index, 1);
        assert_eq!(plan.cells.len(), 2);
        assert!(plan.cells.iter().all(|c| c.row_index == Some(1) && c.content.is_empty()));
        assert_eq!(plan.shifted.len(), 2);
        assert!(plan.shifted.iter().all(|s| s.row_index == 2));

        let bottom = plan_row_insertion(doc(), &table_id, &group, None);
        assert_eq!(bottom.row_index, 2);
        assert!(bottom.shifted.is_empty());
    }

    #[test]
    fn test_column_widths() {
        let widths = parse_column_widths(r#"{"columns":["150px", 12, "wide", 99.6]}"#, 5);
        assert_eq!(
            widths,
            vec![
                ColumnWidth::Px(150),
                ColumnWidth::Px(MIN_COLUMN_WIDTH),
                ColumnWidth::Auto,
                ColumnWidth::Px(100),
                ColumnWidth::Auto,
            ]
        );
        assert_eq!(parse_column_widths(r#"["80px"]"#, 1), vec![ColumnWidth::Px(80)]);
        assert_eq!(parse_column_widths("{oops", 2), vec![ColumnWidth::Auto; 2]);
        assert_eq!(ColumnWidth::Px(80).to_string(), "80px");
    }

    #[test]
    fn test_assemble_fills_gaps() {
        let table = "t1";
        let mut blocks = vec![
            Block::cell(doc(), table, 0, 0, "a", 1),
            Block::cell(doc(), table, 1, 2, "f", 2),
            Block::cell(doc(), "other", 0, 0, "x", 3),
        ];
        let mut no_pos = Block::cell(doc(), table, 0, 1, "?", 4);
        no_pos.col_index = None;
        blocks.push(no_pos);

        let grid = assemble_table(table, &blocks);
        assert_eq!(grid.row_count(), 2);
        assert_eq!(grid.column_count(), 3);
        assert_eq!(grid.placeholders(), 4);
        assert_eq!(grid.rows[0][0].content(), "a");
        assert_eq!(grid.rows[0][1], GridCell::Placeholder { row: 0, col: 1 });
        assert_eq!(grid.rows[1][2].content(), "f");
        assert_eq!(grid.column_widths, vec![ColumnWidth::Auto; 3]);
    }

    #[test]
    fn test_strip_tags_and_table_text() {
        assert_eq!(strip_tags("<p>Fish &amp; <b>chips</b></p>"), "Fish & chips");
        let blocks = vec![
            Block::cell(doc(), "t", 0, 0, "<i>x</i>", 0),
            Block::cell(doc(), "t", 0, 1, "y&nbsp;", 1),
        ];
        let grid = assemble_table("t", &blocks);
        assert_eq!(table_text(&grid), vec![vec!["x".to_string(), "y".to_string()]]);
    }

    #[test]
    fn test_template_expand_and_fold() {
        let mut table = TemplateBlock::new(BlockType::Table, "");
        table.options = Some(serde_json::json!({"columns": ["90px", "auto", "auto"]}));
        table.rows = vec![
            vec!["a".into(), "b".into(), "c".into()],
            vec!["d".into(), "e".into(), "f".into()],
        ];
        let template = vec![TemplateBlock::new(BlockType::Heading, "Agenda"), table];

        let blocks = expand_template(doc(), &template);
        assert_eq!(blocks.len(), 1 + 1 + 1 + 6);
        assert_eq!(blocks[0].level, Some(2));
        assert!(blocks.windows(2).all(|w| w[0].order < w[1].order));

        let folded = to_template(&blocks);
        assert_eq!(folded.len(), 2);
        assert_eq!(folded[0].content, "Agenda");
        assert_eq!(folded[1].rows, template[1].rows);
        assert_eq!(folded[1].options, template[1].options);
    }
}
