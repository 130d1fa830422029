//! Persistence backends
//!
//! A backend persists entries and their metadata; it knows nothing about
//! freshness or synchronization. Writes for a single key are serialized by
//! the backend (single writer per process).

use bytes::Bytes;
use cloudgossip_core::{EntryMetadata, StoreEntry};
use parking_lot::RwLock;
use sled::Db;
use std::collections::HashMap;
use std::path::Path;

use crate::error::StoreError;

/// Storage contract consumed by [`Store`](crate::store::Store).
pub trait PersistenceBackend: Send + Sync {
    /// Persist an entry, overwriting any previous entry under the same key.
    fn write(&self, entry: &StoreEntry) -> Result<(), StoreError>;

    /// Overwrite the metadata of an existing entry.
    fn write_metadata(&self, key: &str, meta: &EntryMetadata) -> Result<(), StoreError>;

    fn read(&self, key: &str) -> Result<Option<StoreEntry>, StoreError>;

    fn read_metadata(&self, key: &str) -> Result<Option<EntryMetadata>, StoreError>;

    /// Keys with a modification timestamp strictly greater than `since_ms`,
    /// or all keys when `since_ms` is `None`.
    fn list(&self, since_ms: Option<u64>) -> Result<Vec<String>, StoreError>;

    fn contains(&self, key: &str) -> Result<bool, StoreError>;
}

/// Volatile in-memory backend.
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, StoreEntry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceBackend for MemoryBackend {
    fn write(&self, entry: &StoreEntry) -> Result<(), StoreError> {
        self.entries
            .write()
            .insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    fn write_metadata(&self, key: &str, meta: &EntryMetadata) -> Result<(), StoreError> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| StoreError::MissingKey(key.to_string()))?;
        entry.metadata = meta.clone();
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<StoreEntry>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn read_metadata(&self, key: &str) -> Result<Option<EntryMetadata>, StoreError> {
        Ok(self.entries.read().get(key).map(|e| e.metadata.clone()))
    }

    fn list(&self, since_ms: Option<u64>) -> Result<Vec<String>, StoreError> {
        Ok(self
            .entries
            .read()
            .values()
            .filter(|e| since_ms.map_or(true, |t| e.metadata.modified_ms > t))
            .map(|e| e.key.clone())
            .collect())
    }

    fn contains(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.read().contains_key(key))
    }
}

/// Durable backend over sled, one tree for content and one for metadata.
pub struct SledBackend {
    _db: Db,
    content: sled::Tree,
    metadata: sled::Tree,
}

impl SledBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let content = db.open_tree("content")?;
        let metadata = db.open_tree("metadata")?;
        Ok(Self {
            _db: db,
            content,
            metadata,
        })
    }
}

impl PersistenceBackend for SledBackend {
    fn write(&self, entry: &StoreEntry) -> Result<(), StoreError> {
        let meta = postcard::to_allocvec(&entry.metadata)?;
        self.content
            .insert(entry.key.as_bytes(), entry.content.as_ref())?;
        self.metadata.insert(entry.key.as_bytes(), meta)?;
        Ok(())
    }

    fn write_metadata(&self, key: &str, meta: &EntryMetadata) -> Result<(), StoreError> {
        if !self.metadata.contains_key(key.as_bytes())? {
            return Err(StoreError::MissingKey(key.to_string()));
        }
        let bytes = postcard::to_allocvec(meta)?;
        self.metadata.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<StoreEntry>, StoreError> {
        let meta = match self.read_metadata(key)? {
            Some(meta) => meta,
            None => return Ok(None),
        };
        let content = match self.content.get(key.as_bytes())? {
            Some(bytes) => Bytes::copy_from_slice(&bytes),
            None => return Ok(None),
        };
        Ok(Some(StoreEntry::new(key, meta, content)))
    }

    fn read_metadata(&self, key: &str) -> Result<Option<EntryMetadata>, StoreError> {
        match self.metadata.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn list(&self, since_ms: Option<u64>) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for item in self.metadata.iter() {
            let (key, value) = item?;
            let meta: EntryMetadata = postcard::from_bytes(&value)?;
            if since_ms.map_or(true, |t| meta.modified_ms > t) {
                keys.push(String::from_utf8_lossy(&key).into_owned());
            }
        }
        Ok(keys)
    }

    fn contains(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.metadata.contains_key(key.as_bytes())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn entry(key: &str, content: &'static [u8]) -> StoreEntry {
        let content = Bytes::from_static(content);
        StoreEntry::new(
            key,
            EntryMetadata::for_content(&content, "text/plain", HashMap::new()),
            content,
        )
    }

    #[test]
    fn memory_roundtrip() {
        let backend = MemoryBackend::new();
        backend.write(&entry("a", b"one")).unwrap();

        assert!(backend.contains("a").unwrap());
        let read = backend.read("a").unwrap().unwrap();
        assert_eq!(read.content.as_ref(), b"one");
        assert!(backend.read("missing").unwrap().is_none());
    }

    #[test]
    fn metadata_update_requires_existing_key() {
        let backend = MemoryBackend::new();
        let e = entry("a", b"one");
        assert!(matches!(
            backend.write_metadata("a", &e.metadata),
            Err(StoreError::MissingKey(_))
        ));
    }

    #[test]
    fn list_filters_strictly_newer() {
        let backend = MemoryBackend::new();
        let mut old = entry("old", b"1");
        old.metadata.modified_ms = 100;
        let mut new = entry("new", b"2");
        new.metadata.modified_ms = 200;
        backend.write(&old).unwrap();
        backend.write(&new).unwrap();

        let all = backend.list(None).unwrap();
        assert_eq!(all.len(), 2);
        let recent = backend.list(Some(100)).unwrap();
        assert_eq!(recent, vec!["new".to_string()]);
    }

    #[test]
    fn sled_persists_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let backend = SledBackend::open(dir.path()).unwrap();
            backend.write(&entry("k", b"durable")).unwrap();
        }
        let backend = SledBackend::open(dir.path()).unwrap();
        let read = backend.read("k").unwrap().unwrap();
        assert_eq!(read.content.as_ref(), b"durable");
        assert_eq!(read.metadata, backend.read_metadata("k").unwrap().unwrap());
    }
}
