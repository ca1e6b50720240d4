//! ATM Snapshot Store
//!
//! Content-addressed blob storage and the parent-linked snapshot tree built
//! on it.
//!
//! # Core Concepts
//!
//! - [`ContentStore`]: blobs addressed by digest, deduplicated, reference counted
//! - [`SnapshotStore`]: snapshot tree per run with full/delta encoding,
//!   milestones, heads, a durable JSON-lines index and timeline queries
//! - [`GcPolicy`] / [`spawn_gc`]: background collection of unreachable
//!   snapshots that never touches milestones, heads or their ancestors
//!
//! # Example
//!
//! ```rust,ignore
//! use atm_store::{SnapshotStore, StoreConfig};
//!
//! let store = SnapshotStore::open("/var/lib/atm", StoreConfig::default())?;
//! let root = store.snapshot(run_id, &state, None)?;
//! let next = store.snapshot(run_id, &next_state, Some(root))?;
//! assert_eq!(store.reconstruct(next)?, next_state);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod blob;
mod config;
mod content;
mod error;
mod gc;
mod index;
mod record;
mod snapshot;

pub use blob::{BlobBackend, FsBlobs, MemoryBlobs};
pub use config::{GcPolicy, StoreConfig};
pub use content::ContentStore;
pub use error::{StoreError, StoreResult};
pub use gc::{spawn_gc, GcHandle, GcReport};
pub use record::{ReplayHandles, SnapshotEncoding, SnapshotRecord, StoreStats};
pub use snapshot::{SnapshotStore, BLOB_DIR, INDEX_FILE};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
