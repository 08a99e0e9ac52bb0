//! Single-slot persistence for the roster [`Document`].
//!
//! ```text
//! ┌─────────────┐   read / write   ┌───────────────────────────┐
//! │  SyncHub    │ ───────────────► │ dyn DocumentStore         │
//! └─────────────┘                  │  ├── MemoryStore          │
//!                                  │  ├── FileStore  (JSON)    │
//!                                  │  └── RocksStore (LZ4)     │
//!                                  └───────────────────────────┘
//! ```
//!
//! Every backend is a latest-value register: no history, no versions. A
//! failed write leaves the previous document readable.

pub mod file;
#[cfg(feature = "rocksdb")]
pub mod rocks;

use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::config::{StoreBackend, StoreSettings};
use crate::model::{Document, PayloadMode};

pub use file::FileStore;
#[cfg(feature = "rocksdb")]
pub use rocks::{RocksStore, RocksStoreConfig, StoreMetadata};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("backend `{0}` is not compiled into this build")]
    Unavailable(&'static str),
}

/// Durable home of the one synchronized document.
///
/// `read` must observe the most recent successful `write` made through the
/// same store. `write` is all-or-nothing.
pub trait DocumentStore: Send + Sync {
    /// The stored document, or [`Document::empty`] before the first write.
    fn read(&self) -> Result<Document, StoreError>;

    fn write(&self, doc: &Document) -> Result<(), StoreError>;
}

/// In-process store. Nothing survives a restart.
pub struct MemoryStore {
    slot: RwLock<Option<Document>>,
    mode: PayloadMode,
}

impl MemoryStore {
    pub fn new(mode: PayloadMode) -> Self {
        Self {
            slot: RwLock::new(None),
            mode,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(PayloadMode::Plain)
    }
}

impl DocumentStore for MemoryStore {
    fn read(&self) -> Result<Document, StoreError> {
        let slot = self.slot.read().map_err(|_| StoreError::Poisoned)?;
        Ok(slot.clone().unwrap_or_else(|| Document::empty(self.mode)))
    }

    fn write(&self, doc: &Document) -> Result<(), StoreError> {
        let mut slot = self.slot.write().map_err(|_| StoreError::Poisoned)?;
        *slot = Some(doc.clone());
        Ok(())
    }
}

/// Open the backend named by `settings`.
pub fn open_store(
    settings: &StoreSettings,
    mode: PayloadMode,
) -> Result<Arc<dyn DocumentStore>, StoreError> {
    let store: Arc<dyn DocumentStore> = match settings.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new(mode)),
        StoreBackend::File => Arc::new(FileStore::open(&settings.path, mode)?),
        #[cfg(feature = "rocksdb")]
        StoreBackend::RocksDb => Arc::new(RocksStore::open(
            RocksStoreConfig::new(&settings.path),
            mode,
        )?),
        #[cfg(not(feature = "rocksdb"))]
        StoreBackend::RocksDb => return Err(StoreError::Unavailable("rocksdb")),
    };
    log::info!(
        "Opened {:?} document store at {}",
        settings.backend,
        settings.path.display()
    );
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttendanceRecord, Payload};

    #[test]
    fn test_memory_store_empty_then_write() {
        let store = MemoryStore::default();
        assert_eq!(store.read().unwrap(), Document::default());

        let mut doc = Document::default();
        doc.roster = Payload::Plain(vec![AttendanceRecord::new("E1", "Alice")]);
        store.write(&doc).unwrap();
        assert_eq!(store.read().unwrap(), doc);
    }

    #[test]
    fn test_memory_store_sealed_default() {
        let store = MemoryStore::new(PayloadMode::Sealed);
        assert_eq!(store.read().unwrap().roster, Payload::Sealed(String::new()));
    }

    #[test]
    fn test_open_store_memory_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let memory = StoreSettings {
            backend: StoreBackend::Memory,
            path: dir.path().join("unused"),
        };
        assert!(open_store(&memory, PayloadMode::Plain).is_ok());

        let file = StoreSettings {
            backend: StoreBackend::File,
            path: dir.path().join("data.json"),
        };
        let store = open_store(&file, PayloadMode::Plain).unwrap();
        assert_eq!(store.read().unwrap(), Document::default());
    }
}
