//! ATM Memoization Cache
//!
//! Concurrency-safe memoization of deterministic tool calls. Outputs live in
//! the shared content store; the cache maps `(tool, canonical input)` to the
//! output digest and guarantees at most one in-flight computation per key.
//!
//! # Example
//!
//! ```rust,ignore
//! use atm_memo::{MemoConfig, MemoizationCache};
//!
//! let cache = MemoizationCache::new(content, &MemoConfig::default());
//! let out = cache
//!     .get_or_compute("geocode", b"seattle, wa", None, || async { geocode("seattle, wa").await })
//!     .await?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod cache;
mod config;
mod error;

pub use cache::{CacheStats, MemoizationCache, Memoized};
pub use config::MemoConfig;
pub use error::CacheError;
