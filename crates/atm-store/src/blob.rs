//! Blob backends
//!
//! A [`BlobBackend`] stores opaque bytes under a digest chosen by the caller.
//! It does not hash; [`ContentStore`](crate::ContentStore) owns addressing
//! and integrity checks.

use crate::error::{StoreError, StoreResult};
use atm_state::ContentHash;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Debug;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Frame tag for uncompressed blob files
const FRAME_RAW: u8 = 0;
/// Frame tag for gzip blob files
const FRAME_GZIP: u8 = 1;

/// Storage tier for blobs
///
/// Writes must be atomic: a reader sees either the whole blob or nothing.
pub trait BlobBackend: Send + Sync + Debug {
    /// Store bytes; returns `false` if the digest was already present
    ///
    /// # Errors
    /// Returns error on I/O failure
    fn write(&self, digest: &ContentHash, bytes: &[u8]) -> StoreResult<bool>;

    /// Read bytes, `None` if absent
    ///
    /// # Errors
    /// Returns error on I/O failure
    fn read(&self, digest: &ContentHash) -> StoreResult<Option<Vec<u8>>>;

    /// Whether the digest is present
    ///
    /// # Errors
    /// Returns error on I/O failure
    fn contains(&self, digest: &ContentHash) -> StoreResult<bool>;

    /// Delete bytes; returns `false` if absent
    ///
    /// # Errors
    /// Returns error on I/O failure
    fn delete(&self, digest: &ContentHash) -> StoreResult<bool>;

    /// Number of stored blobs
    ///
    /// # Errors
    /// Returns error on I/O failure
    fn count(&self) -> StoreResult<usize>;
}

/// In-process backend
#[derive(Debug, Default)]
pub struct MemoryBlobs {
    blobs: RwLock<HashMap<ContentHash, Arc<[u8]>>>,
}

impl MemoryBlobs {
    /// Empty backend
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total stored bytes
    #[must_use]
    pub fn byte_count(&self) -> usize {
        self.blobs.read().values().map(|b| b.len()).sum()
    }
}

impl BlobBackend for MemoryBlobs {
    fn write(&self, digest: &ContentHash, bytes: &[u8]) -> StoreResult<bool> {
        let mut blobs = self.blobs.write();
        if blobs.contains_key(digest) {
            return Ok(false);
        }
        blobs.insert(*digest, Arc::from(bytes));
        Ok(true)
    }

    fn read(&self, digest: &ContentHash) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.blobs.read().get(digest).map(|b| b.to_vec()))
    }

    fn contains(&self, digest: &ContentHash) -> StoreResult<bool> {
        Ok(self.blobs.read().contains_key(digest))
    }

    fn delete(&self, digest: &ContentHash) -> StoreResult<bool> {
        Ok(self.blobs.write().remove(digest).is_some())
    }

    fn count(&self) -> StoreResult<usize> {
        Ok(self.blobs.read().len())
    }
}

/// One file per blob under `<root>/blobs`, optionally gzip-compressed.
///
/// Files are framed with a one-byte tag so a store reopened with a different
/// compression setting still reads old blobs.
#[derive(Debug)]
pub struct FsBlobs {
    dir: PathBuf,
    compress: bool,
}

impl FsBlobs {
    /// Open (creating if needed) the blob directory
    ///
    /// # Errors
    /// Returns error if the directory cannot be created
    pub fn open(dir: impl Into<PathBuf>, compress: bool) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(Self { dir, compress })
    }

    /// Blob directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, digest: &ContentHash) -> PathBuf {
        self.dir.join(format!("{digest}.blob"))
    }

    fn encode(&self, path: &Path, bytes: &[u8]) -> StoreResult<Vec<u8>> {
        if !self.compress {
            let mut framed = Vec::with_capacity(bytes.len() + 1);
            framed.push(FRAME_RAW);
            framed.extend_from_slice(bytes);
            return Ok(framed);
        }
        let mut encoder = GzEncoder::new(vec![FRAME_GZIP], Compression::default());
        encoder.write_all(bytes).map_err(|e| StoreError::io(path, e))?;
        encoder.finish().map_err(|e| StoreError::io(path, e))
    }

    fn decode(digest: &ContentHash, framed: &[u8]) -> StoreResult<Vec<u8>> {
        match framed.split_first() {
            Some((&FRAME_RAW, body)) => Ok(body.to_vec()),
            Some((&FRAME_GZIP, body)) => {
                let mut out = Vec::new();
                GzDecoder::new(body)
                    .read_to_end(&mut out)
                    .map_err(|e| StoreError::corrupt(*digest, e))?;
                Ok(out)
            }
            Some((tag, _)) => Err(StoreError::corrupt(*digest, format!("unknown frame tag {tag}"))),
            None => Err(StoreError::corrupt(*digest, "empty blob file")),
        }
    }
}

impl BlobBackend for FsBlobs {
    fn write(&self, digest: &ContentHash, bytes: &[u8]) -> StoreResult<bool> {
        let path = self.path_for(digest);
        if path.exists() {
            return Ok(false);
        }
        let framed = self.encode(&path, bytes)?;

        // Unique temp name, then rename: concurrent writers of the same digest
        // both succeed and the final file is complete either way.
        let tmp = self
            .dir
            .join(format!("{digest}.{}.tmp", ulid::Ulid::new()));
        let mut file = fs::File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
        file.write_all(&framed).map_err(|e| StoreError::io(&tmp, e))?;
        file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
        drop(file);
        fs::rename(&tmp, &path).map_err(|e| StoreError::io(&path, e))?;
        Ok(true)
    }

    fn read(&self, digest: &ContentHash) -> StoreResult<Option<Vec<u8>>> {
        let path = self.path_for(digest);
        match fs::read(&path) {
            Ok(framed) => Self::decode(digest, &framed).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    fn contains(&self, digest: &ContentHash) -> StoreResult<bool> {
        Ok(self.path_for(digest).exists())
    }

    fn delete(&self, digest: &ContentHash) -> StoreResult<bool> {
        let path = self.path_for(digest);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    fn count(&self) -> StoreResult<usize> {
        let entries = fs::read_dir(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        let mut count = 0;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.dir, e))?;
            if entry.path().extension().is_some_and(|ext| ext == "blob") {
                count += 1;
            }
        }
        Ok(count)
    }
}
