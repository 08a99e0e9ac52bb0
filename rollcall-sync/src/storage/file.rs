//! JSON file backend.
//!
//! Writes go to a temporary file in the same directory, are fsynced, then
//! renamed over the target, so a crash mid-write leaves the old file intact.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::NamedTempFile;

use super::{DocumentStore, StoreError};
use crate::model::{Document, PayloadMode};

pub struct FileStore {
    path: PathBuf,
    mode: PayloadMode,
    /// Serializes writers so two renames cannot interleave.
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open (but do not create) the data file, creating its directory.
    pub fn open(path: impl Into<PathBuf>, mode: PayloadMode) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        Ok(Self {
            path,
            mode,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }
}

impl DocumentStore for FileStore {
    fn read(&self) -> Result<Document, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Document::empty(self.mode));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&raw).map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    fn write(&self, doc: &Document) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(doc)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut tmp = NamedTempFile::new_in(self.dir())?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }
}
