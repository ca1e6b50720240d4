//! Tool-call memoization over the content store using moka
//!
//! Keys are [`ContentHash::for_tool_call`] digests of `(tool_name,
//! canonical_input)`; values point at output blobs in the shared
//! [`ContentStore`]. Each entry holds one reference on its output blob, which
//! is released when moka evicts, expires or invalidates the entry.
//!
//! Canonicalization of the input is the caller's job and happens before the
//! key is formed.

use crate::config::MemoConfig;
use crate::error::CacheError;
use atm_state::ContentHash;
use atm_store::ContentStore;
use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::Expiry;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cached value: where the output lives and how long the entry may live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CachedOutput {
    digest: ContentHash,
    ttl: Duration,
}

/// Per-entry lifetime taken from the entry itself
struct PerEntryTtl;

impl Expiry<ContentHash, CachedOutput> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &ContentHash,
        value: &CachedOutput,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Result of a memoized call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Memoized {
    /// Cache key
    pub key: ContentHash,
    /// Digest of the output blob
    pub output_digest: ContentHash,
    /// Served without running the computation
    pub cached: bool,
}

/// Statistics for cache performance monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of entries in cache (approximate)
    pub entry_count: u64,
    /// Calls served from cache
    pub hits: u64,
    /// Calls that ran the computation
    pub misses: u64,
}

/// Concurrency-safe tool input → output cache
///
/// Concurrent callers with the same key share one in-flight computation.
#[derive(Debug, Clone)]
pub struct MemoizationCache {
    inner: Cache<ContentHash, CachedOutput>,
    content: Arc<ContentStore>,
    default_ttl: Duration,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl MemoizationCache {
    /// Create a cache over `content`
    #[must_use]
    pub fn new(content: Arc<ContentStore>, config: &MemoConfig) -> Self {
        let releaser = Arc::clone(&content);
        let inner = Cache::builder()
            .max_capacity(config.max_capacity)
            .expire_after(PerEntryTtl)
            .eviction_listener(move |key: Arc<ContentHash>, value: CachedOutput, cause| {
                if let Err(e) = releaser.release(&value.digest) {
                    tracing::warn!(key = %key.short(), error = %e, "failed to release memoized output");
                } else if cause != RemovalCause::Explicit {
                    tracing::trace!(key = %key.short(), ?cause, "memo entry evicted");
                }
            })
            .build();
        Self {
            inner,
            content,
            default_ttl: config.default_ttl(),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Return the memoized output digest, running `compute` at most once per
    /// key among concurrent callers.
    ///
    /// An expired entry, or one whose blob has disappeared, is a miss. A
    /// failed computation is not cached.
    ///
    /// # Errors
    /// Returns [`CacheError::Compute`] if `compute` fails and
    /// [`CacheError::Store`] if the output cannot be stored
    pub async fn get_or_compute<F, Fut>(
        &self,
        tool_name: &str,
        canonical_input: &[u8],
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<Memoized, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Vec<u8>>>,
    {
        let key = ContentHash::for_tool_call(tool_name, canonical_input);
        self.drop_if_dangling(&key).await;

        let ttl = ttl.unwrap_or(self.default_ttl);
        let ran = AtomicBool::new(false);
        let init = async {
            ran.store(true, Ordering::Relaxed);
            let output = compute()
                .await
                .map_err(|e| CacheError::Compute(Arc::new(e)))?;
            let digest = self.content.put_retained(&output)?;
            tracing::debug!(tool = tool_name, key = %key.short(), output = %digest.short(), "tool output memoized");
            Ok::<_, CacheError>(CachedOutput { digest, ttl })
        };

        let entry = self
            .inner
            .try_get_with(key, init)
            .await
            .map_err(|e| (*e).clone())?;

        let cached = !ran.load(Ordering::Relaxed);
        if cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Memoized {
            key,
            output_digest: entry.digest,
            cached,
        })
    }

    /// Invalidate an entry whose output blob is gone
    async fn drop_if_dangling(&self, key: &ContentHash) {
        let Some(entry) = self.inner.get(key).await else {
            return;
        };
        match self.content.contains(&entry.digest) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(key = %key.short(), "memoized output missing, recomputing");
                self.inner.invalidate(key).await;
            }
            Err(e) => {
                tracing::warn!(key = %key.short(), error = %e, "memoized output unreadable, recomputing");
                self.inner.invalidate(key).await;
            }
        }
    }

    /// Cached output digest without computing
    pub async fn lookup(&self, tool_name: &str, canonical_input: &[u8]) -> Option<ContentHash> {
        let key = ContentHash::for_tool_call(tool_name, canonical_input);
        self.inner.get(&key).await.map(|e| e.digest)
    }

    /// Read an output blob
    ///
    /// # Errors
    /// Returns [`CacheError::Store`] if the blob is missing or corrupt
    pub fn fetch(&self, output_digest: &ContentHash) -> Result<Vec<u8>, CacheError> {
        Ok(self.content.get(output_digest)?)
    }

    /// Drop one entry
    pub async fn invalidate(&self, tool_name: &str, canonical_input: &[u8]) {
        let key = ContentHash::for_tool_call(tool_name, canonical_input);
        self.inner.invalidate(&key).await;
    }

    /// Drop every entry
    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    /// Apply pending evictions and expirations now
    pub async fn run_pending_tasks(&self) {
        self.inner.run_pending_tasks().await;
    }

    /// Shared content store
    #[must_use]
    pub fn content(&self) -> &Arc<ContentStore> {
        &self.content
    }

    /// Get cache statistics
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.inner.entry_count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
