//! RocksDB-backed store.
//!
//! Column families:
//! - `documents` — document headers, keyed by the 16 id bytes (bincode)
//! - `blocks`    — live blocks, keyed `<doc_id:16><block_id utf-8>` (bincode)
//! - `versions`  — version records, keyed `<doc_id:16><version:8 BE>` (LZ4 + bincode)
//! - `templates` — templates, keyed by name (JSON, since items carry free-form values)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

use super::{DocumentStore, StoreError, StoredDocument, TemplateStore, VersionStore};
use crate::model::{now_millis, Block, BlockId, Document, DocumentId, Template, Version, VersionId};

const CF_DOCUMENTS: &str = "documents";
const CF_BLOCKS: &str = "blocks";
const CF_VERSIONS: &str = "versions";
const CF_TEMPLATES: &str = "templates";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_BLOCKS, CF_VERSIONS, CF_TEMPLATES];

/// Length of the document id prefix on block and version keys.
const DOC_PREFIX_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory.
    pub path: PathBuf,
    /// Block cache size in bytes, shared by all column families.
    pub block_cache_size: usize,
    pub bloom_filter_bits: i32,
    /// fsync every write.
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family.
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("folio_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches rooted at `path`.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open (or create) the database and its column families.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened RocksDB store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_TEMPLATES => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64 / (1024 * 1024));
            }
            CF_BLOCKS | CF_VERSIONS => {
                // Prefix-scanned by document id.
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(
                    DOC_PREFIX_LEN,
                ));
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn load_header(&self, document_id: DocumentId) -> Result<Option<Document>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, document_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Values of every key under `document_id` in a prefixed column family.
    fn scan_prefix(
        &self,
        cf_name: &str,
        document_id: DocumentId,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let cf = self.cf(cf_name)?;
        let prefix = document_id.as_bytes();
        let mut values = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() < DOC_PREFIX_LEN || &key[..DOC_PREFIX_LEN] != prefix {
                break;
            }
            values.push(value.to_vec());
        }
        Ok(values)
    }
}

fn block_key(document_id: DocumentId, block_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(DOC_PREFIX_LEN + block_id.len());
    key.extend_from_slice(document_id.as_bytes());
    key.extend_from_slice(block_id.as_bytes());
    key
}

fn version_key(document_id: DocumentId, version_id: VersionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(DOC_PREFIX_LEN + 8);
    key.extend_from_slice(document_id.as_bytes());
    key.extend_from_slice(&version_id.to_be_bytes());
    key
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}

fn encode_version(version: &Version) -> Result<Vec<u8>, StoreError> {
    Ok(lz4_flex::compress_prepend_size(&encode(version)?))
}

fn decode_version(bytes: &[u8]) -> Result<Version, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    decode(&raw)
}

impl DocumentStore for RocksStore {
    fn get_document(&self, document_id: DocumentId) -> Result<Option<StoredDocument>, StoreError> {
        let Some(document) = self.load_header(document_id)? else {
            return Ok(None);
        };
        let blocks = self
            .scan_prefix(CF_BLOCKS, document_id)?
            .iter()
            .map(|bytes| decode::<Block>(bytes))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(StoredDocument { document, blocks }))
    }

    fn create_document(&self, document: &Document, blocks: &[Block]) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_blocks = self.cf(CF_BLOCKS)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, document.document_id.as_bytes(), encode(document)?);
        for block in blocks {
            batch.put_cf(
                cf_blocks,
                block_key(document.document_id, &block.block_id),
                encode(block)?,
            );
        }
        self.write(batch)
    }

    fn list_documents(&self) -> Result<Vec<Document>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut documents = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            documents.push(decode::<Document>(&value)?);
        }
        documents.sort_by_key(|d| (d.created_at, d.document_id));
        Ok(documents)
    }

    fn put_blocks(&self, document_id: DocumentId, blocks: &[Block]) -> Result<(), StoreError> {
        let mut document = self
            .load_header(document_id)?
            .ok_or_else(|| StoreError::NotFound(format!("document {document_id}")))?;
        document.updated_at = now_millis();

        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_blocks = self.cf(CF_BLOCKS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, document_id.as_bytes(), encode(&document)?);
        for block in blocks {
            batch.put_cf(cf_blocks, block_key(document_id, &block.block_id), encode(block)?);
        }
        self.write(batch)
    }

    fn delete_blocks(
        &self,
        document_id: DocumentId,
        block_ids: &[BlockId],
    ) -> Result<(), StoreError> {
        let cf_blocks = self.cf(CF_BLOCKS)?;
        let mut batch = WriteBatch::default();
        for id in block_ids {
            batch.delete_cf(cf_blocks, block_key(document_id, id));
        }
        if let Some(mut document) = self.load_header(document_id)? {
            document.updated_at = now_millis();
            batch.put_cf(self.cf(CF_DOCUMENTS)?, document_id.as_bytes(), encode(&document)?);
        }
        self.write(batch)
    }
}

impl VersionStore for RocksStore {
    fn append_version(&self, version: &Version) -> Result<(), StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(
            cf,
            version_key(version.document_id, version.version_id),
            encode_version(version)?,
        );
        self.write(batch)
    }

    fn commit_version(&self, version: &Version, block: &Block) -> Result<(), StoreError> {
        let document_id = version.document_id;
        let mut document = self
            .load_header(document_id)?
            .ok_or_else(|| StoreError::NotFound(format!("document {document_id}")))?;
        document.updated_at = version.timestamp;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_VERSIONS)?,
            version_key(document_id, version.version_id),
            encode_version(version)?,
        );
        batch.put_cf(
            self.cf(CF_BLOCKS)?,
            block_key(document_id, &block.block_id),
            encode(block)?,
        );
        batch.put_cf(self.cf(CF_DOCUMENTS)?, document_id.as_bytes(), encode(&document)?);
        self.write(batch)
    }

    fn list_versions(&self, document_id: DocumentId) -> Result<Vec<Version>, StoreError> {
        // Big-endian keys iterate in version order.
        self.scan_prefix(CF_VERSIONS, document_id)?
            .iter()
            .map(|bytes| decode_version(bytes))
            .collect()
    }

    fn get_version(
        &self,
        document_id: DocumentId,
        version_id: VersionId,
    ) -> Result<Option<Version>, StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        match self.db.get_cf(cf, version_key(document_id, version_id))? {
            Some(bytes) => Ok(Some(decode_version(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl TemplateStore for RocksStore {
    fn save_template(&self, name: &str, template: &Template) -> Result<(), StoreError> {
        let cf = self.cf(CF_TEMPLATES)?;
        let json = serde_json::to_vec(template)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, name.as_bytes(), json);
        self.write(batch)
    }

    fn get_template(&self, name: &str) -> Result<Option<Template>, StoreError> {
        let cf = self.cf(CF_TEMPLATES)?;
        match self.db.get_cf(cf, name.as_bytes())? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::DeserializationError(e.to_string())),
            None => Ok(None),
        }
    }

    fn list_templates(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_TEMPLATES)?;
        let mut names = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            names.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(names)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
