//! Error types for the store
//!
//! I/O and integrity failures are fatal to a run; `NotFound` is fatal only
//! when a required ancestor is missing during reconstruction.

use atm_state::{ContentHash, HashError, RunId, SnapshotId, StateError};
use std::path::PathBuf;

/// Errors raised by the content and snapshot stores
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Disk or transport failure
    #[error("storage io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reconstructed state does not hash to the recorded digest
    #[error("integrity failure for snapshot {snapshot}: expected {expected}, got {actual}")]
    HashMismatch {
        snapshot: SnapshotId,
        expected: ContentHash,
        actual: ContentHash,
    },

    /// Blob bytes do not hash to their address, or do not decode
    #[error("corrupt blob {digest}: {reason}")]
    CorruptBlob { digest: ContentHash, reason: String },

    /// Index journal cannot be replayed
    #[error("corrupt index at line {line}: {reason}")]
    CorruptIndex { line: usize, reason: String },

    /// Delta snapshot whose parent chain never reaches a full snapshot
    #[error("snapshot {0} has no full ancestor")]
    BrokenChain(SnapshotId),

    /// Blob absent or collected
    #[error("blob not found: {0}")]
    BlobNotFound(ContentHash),

    /// Snapshot absent or collected
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(SnapshotId),

    /// Run has no snapshots
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    /// Snapshot belongs to a different run
    #[error("snapshot {snapshot} does not belong to run {run}")]
    ForeignSnapshot { snapshot: SnapshotId, run: RunId },

    /// State model error
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Digest computation failed
    #[error("digest error: {0}")]
    Hash(#[from] HashError),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(digest: ContentHash, reason: impl ToString) -> Self {
        Self::CorruptBlob {
            digest,
            reason: reason.to_string(),
        }
    }

    /// Missing blob, snapshot or run
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::BlobNotFound(_) | Self::SnapshotNotFound(_) | Self::RunNotFound(_)
        )
    }

    /// Integrity violation; never repaired silently
    #[inline]
    #[must_use]
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::HashMismatch { .. }
                | Self::CorruptBlob { .. }
                | Self::CorruptIndex { .. }
                | Self::BrokenChain(_)
        )
    }
}

/// Result alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;
