//! RocksDB backend.
//!
//! Keys (default column family):
//! - `document`: LZ4-compressed JSON of the whole [`Document`]
//! - `metadata`: bincode [`StoreMetadata`] (sizes, write count, timestamp)
//!
//! Both keys are written in one `WriteBatch`, so readers never see a
//! document without its matching metadata or a half-written value.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rocksdb::{DBCompressionType, Options, WriteBatch, WriteOptions, DB};
use serde::{Deserialize, Serialize};

use super::{DocumentStore, StoreError};
use crate::model::{Document, PayloadMode};

const KEY_DOCUMENT: &[u8] = b"document";
const KEY_METADATA: &[u8] = b"metadata";

#[derive(Debug, Clone)]
pub struct RocksStoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// fsync every write (default: true, one write per save)
    pub sync_writes: bool,
    /// Max open files for RocksDB
    pub max_open_files: i32,
}

impl RocksStoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_writes: true,
            max_open_files: 64,
        }
    }
}

/// Bookkeeping written alongside every document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMetadata {
    /// Successful writes since the database was created
    pub writes: u64,
    /// Uncompressed JSON size in bytes
    pub document_size: u64,
    /// Stored (compressed) size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch of the last write
    pub updated_at: u64,
}

impl StoreMetadata {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub struct RocksStore {
    db: DB,
    config: RocksStoreConfig,
    mode: PayloadMode,
}

impl RocksStore {
    /// Open or create the database at `config.path`.
    pub fn open(config: RocksStoreConfig, mode: PayloadMode) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(config.max_open_files);
        opts.set_keep_log_file_num(5);
        // Values are already LZ4 framed
        opts.set_compression_type(DBCompressionType::None);

        let db = DB::open(&opts, &config.path)?;
        Ok(Self { db, config, mode })
    }

    pub fn metadata(&self) -> Result<StoreMetadata, StoreError> {
        match self.db.get(KEY_METADATA)? {
            Some(bytes) => StoreMetadata::decode(&bytes),
            None => Ok(StoreMetadata::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

impl DocumentStore for RocksStore {
    fn read(&self) -> Result<Document, StoreError> {
        let Some(compressed) = self.db.get(KEY_DOCUMENT)? else {
            return Ok(Document::empty(self.mode));
        };
        let json = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    fn write(&self, doc: &Document) -> Result<(), StoreError> {
        let json = serde_json::to_vec(doc).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&json);

        let mut meta = self.metadata()?;
        meta.writes += 1;
        meta.document_size = json.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let mut batch = WriteBatch::default();
        batch.put(KEY_DOCUMENT, &compressed);
        batch.put(KEY_METADATA, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}
