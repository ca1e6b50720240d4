//! Memoization errors

use atm_store::StoreError;
use std::sync::Arc;

/// Errors from [`MemoizationCache`](crate::MemoizationCache).
///
/// Cloneable because concurrent callers waiting on the same computation all
/// receive the one failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// The tool computation failed; nothing was cached
    #[error("tool computation failed: {0:#}")]
    Compute(Arc<anyhow::Error>),

    /// Output could not be stored or read back
    #[error("content store failure: {0}")]
    Store(Arc<StoreError>),
}

impl CacheError {
    /// The underlying tool error, if the computation failed
    #[must_use]
    pub fn compute_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Compute(e) => Some(e),
            Self::Store(_) => None,
        }
    }

    /// The underlying store error, if storage failed
    #[must_use]
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Self::Store(e) => Some(e),
            Self::Compute(_) => None,
        }
    }
}

impl From<StoreError> for CacheError {
    fn from(e: StoreError) -> Self {
        Self::Store(Arc::new(e))
    }
}
