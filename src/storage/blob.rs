//! Blob store for uploaded database files.
//!
//! A blob is the raw bytes of one database file, keyed by the SHA-256 of
//! those bytes. Blobs are write-once: storing bytes that are already present
//! is a no-op that still returns the digest. Deduplication is by full content
//! digest, so two different files of the same length never share an entry.

use tracing::{debug, warn};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::objects::ObjectArea;
use crate::storage::types::{BlobId, Digest};

/// Content-addressed storage for raw database bytes.
#[derive(Debug, Clone)]
pub struct BlobStore {
    area: ObjectArea,
}

impl BlobStore {
    pub(crate) fn new(area: ObjectArea) -> Self {
        Self { area }
    }

    /// compute the id a blob would be stored under
    pub fn id_for(bytes: &[u8]) -> BlobId {
        BlobId::new(Digest::of(bytes))
    }

    /// store bytes, returning their digest
    pub fn put(&self, bytes: &[u8]) -> StorageResult<BlobId> {
        let id = Self::id_for(bytes);
        let written = self.area.write(&id.digest(), bytes)?;

        if written {
            debug!(blob = %id, size = bytes.len(), "stored blob");
        } else {
            debug!(blob = %id, "blob already present");
        }
        Ok(id)
    }

    /// check if a blob is present
    pub fn exists(&self, id: BlobId) -> StorageResult<bool> {
        self.area.contains(&id.digest())
    }

    /// read a blob's content, re-checking its digest
    pub fn get(&self, id: BlobId) -> StorageResult<Vec<u8>> {
        let bytes = self
            .area
            .read(&id.digest())?
            .ok_or(StorageError::BlobNotFound(id))?;

        if Self::id_for(&bytes) != id {
            warn!(blob = %id, "blob content does not match its digest");
            return Err(StorageError::corrupted(id, "blob content does not match its digest"));
        }
        Ok(bytes)
    }

    /// number of stored blobs
    pub fn count(&self) -> StorageResult<usize> {
        self.area.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::objects::ObjectKind;
    use tempfile::TempDir;

    fn setup() -> (TempDir, BlobStore) {
        let dir = TempDir::new().unwrap();
        let tmp = dir.path().join("tmp");
        std::fs::create_dir_all(&tmp).unwrap();
        let area = ObjectArea::open(ObjectKind::Blob, &dir.path().join("objects"), &tmp).unwrap();
        (dir, BlobStore::new(area))
    }

    #[test]
    fn test_put_and_get() {
        let (_dir, store) = setup();
        let id = store.put(b"SQLite format 3\0").unwrap();

        assert!(store.exists(id).unwrap());
        assert_eq!(store.get(id).unwrap(), b"SQLite format 3\0");
    }

    #[test]
    fn test_same_bytes_same_digest() {
        let (_dir, store) = setup();
        let a = store.put(b"0123456789").unwrap();
        let b = store.put(b"0123456789").unwrap();

        assert_eq!(a, b);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_equal_length_different_content() {
        let (_dir, store) = setup();
        let a = store.put(b"aaaaaaaaaa").unwrap();
        let b = store.put(b"bbbbbbbbbb").unwrap();

        assert_ne!(a, b);
        assert_eq!(store.count().unwrap(), 2);
        assert_eq!(store.get(a).unwrap(), b"aaaaaaaaaa");
        assert_eq!(store.get(b).unwrap(), b"bbbbbbbbbb");
    }

    #[test]
    fn test_missing_blob() {
        let (_dir, store) = setup();
        let id = BlobStore::id_for(b"never stored");

        assert!(!store.exists(id).unwrap());
        assert!(matches!(store.get(id), Err(StorageError::BlobNotFound(_))));
    }

    #[test]
    fn test_empty_blob() {
        let (_dir, store) = setup();
        let id = store.put(b"").unwrap();
        assert!(store.get(id).unwrap().is_empty());
    }

    #[test]
    fn test_put_surfaces_io_errors() {
        let (dir, store) = setup();
        let id = BlobStore::id_for(b"0123456789");
        let hex = id.digest().to_hex();
        std::fs::write(dir.path().join("objects/blobs").join(&hex[..2]), b"junk").unwrap();

        let err = store.exists(id).unwrap_err();
        assert_eq!(err.kind(), crate::storage::ErrorKind::Internal);

        let err = store.put(b"0123456789").unwrap_err();
        assert_eq!(err.kind(), crate::storage::ErrorKind::Internal);
    }
}
