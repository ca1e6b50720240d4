//! Content-addressable storage with deduplication and reference counts

use crate::blob::{BlobBackend, MemoryBlobs};
use crate::error::{StoreError, StoreResult};
use atm_state::ContentHash;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Content-addressed blob store
///
/// - `put` is idempotent: identical bytes yield the identical digest and are
///   stored at most once, so concurrent puts of the same bytes are safe.
/// - Blobs are never mutated after write.
/// - Retained blobs are reference counted; the last `release` deletes them.
///   Retain/release for one digest are serialized on that digest's map shard.
#[derive(Debug)]
pub struct ContentStore {
    backend: Arc<dyn BlobBackend>,
    refs: DashMap<ContentHash, u64>,
}

impl ContentStore {
    /// Store over an explicit backend
    #[must_use]
    pub fn new(backend: Arc<dyn BlobBackend>) -> Self {
        Self {
            backend,
            refs: DashMap::new(),
        }
    }

    /// In-memory store
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBlobs::new()))
    }

    /// Store bytes and return their digest
    ///
    /// # Errors
    /// Returns error on backend I/O failure
    pub fn put(&self, bytes: &[u8]) -> StoreResult<ContentHash> {
        let digest = ContentHash::compute(bytes);
        if self.backend.write(&digest, bytes)? {
            tracing::trace!(digest = %digest.short(), len = bytes.len(), "blob written");
        }
        Ok(digest)
    }

    /// Store bytes and take one reference on the blob
    ///
    /// # Errors
    /// Returns error on backend I/O failure
    pub fn put_retained(&self, bytes: &[u8]) -> StoreResult<ContentHash> {
        let digest = ContentHash::compute(bytes);
        let mut count = self.refs.entry(digest).or_insert(0);
        self.backend.write(&digest, bytes)?;
        *count += 1;
        Ok(digest)
    }

    /// Read a blob, verifying it still hashes to its address
    ///
    /// # Errors
    /// Returns [`StoreError::BlobNotFound`] if absent or collected, and
    /// [`StoreError::CorruptBlob`] if the bytes do not match the digest
    pub fn get(&self, digest: &ContentHash) -> StoreResult<Vec<u8>> {
        let bytes = self
            .backend
            .read(digest)?
            .ok_or(StoreError::BlobNotFound(*digest))?;
        let actual = ContentHash::compute(&bytes);
        if actual != *digest {
            tracing::error!(expected = %digest, actual = %actual, "blob content does not match its address");
            return Err(StoreError::corrupt(*digest, format!("content hashes to {actual}")));
        }
        Ok(bytes)
    }

    /// Whether a blob is present
    ///
    /// # Errors
    /// Returns error on backend I/O failure
    pub fn contains(&self, digest: &ContentHash) -> StoreResult<bool> {
        self.backend.contains(digest)
    }

    /// Take a reference on a digest (used when rebuilding counts on open)
    pub fn retain(&self, digest: &ContentHash) {
        *self.refs.entry(*digest).or_insert(0) += 1;
    }

    /// Drop a reference; deletes the blob when the count reaches zero.
    ///
    /// Returns `true` if the blob was deleted.
    ///
    /// # Errors
    /// Returns error on backend I/O failure
    pub fn release(&self, digest: &ContentHash) -> StoreResult<bool> {
        match self.refs.entry(*digest) {
            Entry::Occupied(mut entry) => {
                let count = entry.get_mut();
                *count = count.saturating_sub(1);
                if *count > 0 {
                    return Ok(false);
                }
                let deleted = self.backend.delete(digest)?;
                entry.remove();
                if deleted {
                    tracing::trace!(digest = %digest.short(), "blob released and deleted");
                }
                Ok(deleted)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    /// Current reference count
    #[must_use]
    pub fn ref_count(&self, digest: &ContentHash) -> u64 {
        self.refs.get(digest).map_or(0, |c| *c)
    }

    /// Number of stored blobs
    ///
    /// # Errors
    /// Returns error on backend I/O failure
    pub fn blob_count(&self) -> StoreResult<usize> {
        self.backend.count()
    }
}

impl Default for ContentStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_is_idempotent() {
        let store = ContentStore::in_memory();
        let a = store.put(b"same bytes").unwrap();
        let b = store.put(b"same bytes").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.blob_count().unwrap(), 1);
        assert_eq!(store.get(&a).unwrap(), b"same bytes");
    }

    #[test]
    fn get_missing_is_not_found() {
        let store = ContentStore::in_memory();
        let err = store.get(&ContentHash::compute(b"absent")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn last_release_deletes() {
        let store = ContentStore::in_memory();
        let d = store.put_retained(b"shared").unwrap();
        store.put_retained(b"shared").unwrap();
        assert_eq!(store.ref_count(&d), 2);

        assert!(!store.release(&d).unwrap());
        assert!(store.contains(&d).unwrap());
        assert!(store.release(&d).unwrap());
        assert!(!store.contains(&d).unwrap());
        assert_eq!(store.ref_count(&d), 0);
    }

    #[test]
    fn release_of_unretained_is_noop() {
        let store = ContentStore::in_memory();
        let d = store.put(b"loose").unwrap();
        assert!(!store.release(&d).unwrap());
        assert!(store.contains(&d).unwrap());
    }

    #[test]
    fn corrupted_backend_bytes_are_detected() {
        let backend = Arc::new(MemoryBlobs::new());
        let store = ContentStore::new(backend.clone());
        let digest = ContentHash::compute(b"original");
        backend.write(&digest, b"tampered").unwrap();
        let err = store.get(&digest).unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn concurrent_puts_store_one_blob() {
        let store = Arc::new(ContentStore::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.put_retained(b"contended").unwrap())
            })
            .collect();
        let digests: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(digests.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.blob_count().unwrap(), 1);
        assert_eq!(store.ref_count(&digests[0]), 8);
    }
}
