//! Parent-linked snapshot store
//!
//! Snapshots form a tree per run. A snapshot is stored in full when it is a
//! run root, a milestone, or when its delta chain would exceed
//! [`StoreConfig::max_delta_depth`]; otherwise it is a [`StateDelta`] against
//! its parent's reconstructed state.
//!
//! Writes are serialized by one store-wide lock and journaled before they are
//! applied to the in-memory index, so readers never observe a snapshot whose
//! blob or index entry is incomplete. Reads take the index lock only long
//! enough to copy what they need.

use crate::blob::FsBlobs;
use crate::config::StoreConfig;
use crate::content::ContentStore;
use crate::error::{StoreError, StoreResult};
use crate::index::{IndexEvent, IndexLog, IndexState};
use crate::record::{ReplayHandles, SnapshotEncoding, SnapshotRecord, StoreStats};
use atm_state::{
    AgentState, ContentHash, DeltaError, Fact, RunId, SnapshotId, StateDelta, ToolCallRecord,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::Arc;
use ulid::Ulid;

/// Journal file name under the store root
pub const INDEX_FILE: &str = "index.jsonl";
/// Blob directory name under the store root
pub const BLOB_DIR: &str = "blobs";

/// Versioned store of agent states
#[derive(Debug)]
pub struct SnapshotStore {
    content: Arc<ContentStore>,
    pub(crate) index: RwLock<IndexState>,
    log: Option<IndexLog>,
    pub(crate) write_lock: Mutex<()>,
    config: StoreConfig,
}

impl SnapshotStore {
    /// Volatile store with its own in-memory content store
    #[must_use]
    pub fn in_memory(config: StoreConfig) -> Self {
        Self::with_content(Arc::new(ContentStore::in_memory()), config)
    }

    /// Volatile index over a shared content store
    #[must_use]
    pub fn with_content(content: Arc<ContentStore>, config: StoreConfig) -> Self {
        Self {
            content,
            index: RwLock::new(IndexState::default()),
            log: None,
            write_lock: Mutex::new(()),
            config,
        }
    }

    /// Durable store rooted at `root` (`blobs/` plus `index.jsonl`).
    ///
    /// Replays the journal and rebuilds blob reference counts.
    ///
    /// # Errors
    /// Returns error if the directory cannot be created or the journal is
    /// corrupt before its final line
    pub fn open(root: impl AsRef<Path>, config: StoreConfig) -> StoreResult<Self> {
        let root = root.as_ref();
        let blobs = FsBlobs::open(root.join(BLOB_DIR), config.compress_blobs)?;
        let content = Arc::new(ContentStore::new(Arc::new(blobs)));
        let (log, events) = IndexLog::open(root.join(INDEX_FILE))?;

        let mut index = IndexState::default();
        for event in events {
            index.apply(event);
        }
        for record in index.records.values() {
            content.retain(&record.encoding.blob());
        }
        for call in index.ledger.values().flatten() {
            content.retain(&call.output_digest);
        }

        tracing::info!(
            path = %log.path().display(),
            snapshots = index.records.len(),
            runs = index.by_run.len(),
            "snapshot index replayed"
        );

        Ok(Self {
            content,
            index: RwLock::new(index),
            log: Some(log),
            write_lock: Mutex::new(()),
            config,
        })
    }

    /// Underlying content store
    #[must_use]
    pub fn content(&self) -> &Arc<ContentStore> {
        &self.content
    }

    /// Store configuration
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Journal then apply. Callers hold `write_lock`.
    pub(crate) fn commit(&self, event: IndexEvent) -> StoreResult<()> {
        if let Some(log) = &self.log {
            log.append(&event)?;
        }
        self.index.write().apply(event);
        Ok(())
    }

    /// Persist `state` as a child of `parent` (or as a run root) and move the
    /// run's head to it.
    ///
    /// # Errors
    /// Returns [`StoreError::SnapshotNotFound`] if `parent` is unknown,
    /// [`StoreError::ForeignSnapshot`] if it belongs to another run, or an
    /// I/O or integrity error. On error nothing becomes visible.
    pub fn snapshot(
        &self,
        run_id: RunId,
        state: &AgentState,
        parent: Option<SnapshotId>,
    ) -> StoreResult<SnapshotId> {
        let _guard = self.write_lock.lock();
        let state_digest = state.digest()?;

        let (encoding, is_milestone, introduced) = match parent {
            None => {
                let blob = self.content.put_retained(&state.canonical_bytes()?)?;
                (SnapshotEncoding::Full { blob }, true, state.facts.clone())
            }
            Some(parent_id) => {
                let parent_record = self.get_snapshot(parent_id)?;
                if parent_record.run_id != run_id {
                    return Err(StoreError::ForeignSnapshot {
                        snapshot: parent_id,
                        run: run_id,
                    });
                }
                let parent_state = self.reconstruct(parent_id)?;
                let is_milestone = state.adds_knowledge_over(&parent_state);
                let introduced: Vec<Fact> = state
                    .new_facts_since(&parent_state)
                    .into_iter()
                    .cloned()
                    .collect();

                let chain_depth = parent_record.encoding.chain_depth() + 1;
                let encoding = if is_milestone || chain_depth > self.config.max_delta_depth {
                    let blob = self.content.put_retained(&state.canonical_bytes()?)?;
                    SnapshotEncoding::Full { blob }
                } else {
                    let delta = StateDelta::between(&parent_state, state)?;
                    let blob = self
                        .content
                        .put_retained(&ContentHash::canonical_bytes(&delta)?)?;
                    SnapshotEncoding::Delta { blob, chain_depth }
                };
                (encoding, is_milestone, introduced)
            }
        };

        let record = SnapshotRecord {
            id: SnapshotId::new(),
            run_id,
            parent_id: parent,
            state_digest,
            encoding,
            is_milestone,
            created_at: Utc::now(),
            replay: ReplayHandles::capture(state),
        };
        let id = record.id;

        if let Err(e) = self.commit(IndexEvent::Snapshot {
            record,
            facts: introduced,
        }) {
            self.content.release(&encoding.blob())?;
            return Err(e);
        }

        tracing::debug!(
            run_id = %run_id,
            snapshot_id = %id,
            digest = %state_digest.short(),
            encoding = if encoding.is_full() { "full" } else { "delta" },
            milestone = is_milestone,
            "snapshot written"
        );
        Ok(id)
    }

    /// Rebuild the exact state of a snapshot.
    ///
    /// Walks parents back to the nearest full snapshot, then applies deltas
    /// forward, checking every step against the recorded digests.
    ///
    /// # Errors
    /// Returns [`StoreError::SnapshotNotFound`] for a missing snapshot or
    /// ancestor, and [`StoreError::HashMismatch`] or another integrity error
    /// if the stored data does not reproduce the recorded digest
    pub fn reconstruct(&self, id: SnapshotId) -> StoreResult<AgentState> {
        let chain = self.chain_to_full(id)?;
        let Some((base, deltas)) = chain.split_last() else {
            return Err(StoreError::SnapshotNotFound(id));
        };

        let blob = base.encoding.blob();
        let bytes = self.content.get(&blob)?;
        let mut state =
            AgentState::from_canonical_bytes(&bytes).map_err(|e| StoreError::corrupt(blob, e))?;
        let actual = state.digest()?;
        if actual != base.state_digest {
            return Err(hash_mismatch(base, actual));
        }

        for record in deltas.iter().rev() {
            let blob = record.encoding.blob();
            let bytes = self.content.get(&blob)?;
            let delta: StateDelta =
                serde_json::from_slice(&bytes).map_err(|e| StoreError::corrupt(blob, e))?;
            if delta.target_digest != record.state_digest {
                return Err(hash_mismatch(record, delta.target_digest));
            }
            state = delta.apply(&state).map_err(|e| match e {
                DeltaError::BaseMismatch { actual, .. } | DeltaError::TargetMismatch { actual, .. } => {
                    hash_mismatch(record, actual)
                }
                DeltaError::Hash(e) => StoreError::Hash(e),
            })?;
        }
        Ok(state)
    }

    /// Records from `id` back to the nearest full snapshot, copied out under
    /// the read lock
    fn chain_to_full(&self, id: SnapshotId) -> StoreResult<Vec<SnapshotRecord>> {
        let index = self.index.read();
        let mut chain = Vec::new();
        let mut cursor = id;
        loop {
            let record = index
                .records
                .get(&cursor)
                .ok_or(StoreError::SnapshotNotFound(cursor))?;
            chain.push(record.clone());
            if record.encoding.is_full() {
                return Ok(chain);
            }
            match record.parent_id {
                Some(parent) => cursor = parent,
                None => {
                    tracing::error!(snapshot_id = %record.id, "delta snapshot without parent");
                    return Err(StoreError::BrokenChain(record.id));
                }
            }
        }
    }

    /// Point lookup
    ///
    /// # Errors
    /// Returns [`StoreError::SnapshotNotFound`] if absent or collected
    pub fn get_snapshot(&self, id: SnapshotId) -> StoreResult<SnapshotRecord> {
        self.index
            .read()
            .records
            .get(&id)
            .cloned()
            .ok_or(StoreError::SnapshotNotFound(id))
    }

    /// Whether a snapshot is indexed
    #[must_use]
    pub fn contains(&self, id: SnapshotId) -> bool {
        self.index.read().records.contains_key(&id)
    }

    /// A run's snapshots ordered by creation time
    #[must_use]
    pub fn list_run(&self, run_id: RunId) -> Vec<SnapshotRecord> {
        let index = self.index.read();
        index
            .by_run
            .get(&run_id)
            .into_iter()
            .flatten()
            .filter_map(|(_, id)| index.records.get(id).cloned())
            .collect()
    }

    /// A run's snapshots created within `[from, to]`
    #[must_use]
    pub fn list_run_between(
        &self,
        run_id: RunId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<SnapshotRecord> {
        if from > to {
            return Vec::new();
        }
        let index = self.index.read();
        let Some(timeline) = index.by_run.get(&run_id) else {
            return Vec::new();
        };
        let lo = (from, SnapshotId(Ulid(0)));
        let hi = (to, SnapshotId(Ulid(u128::MAX)));
        timeline
            .range(lo..=hi)
            .filter_map(|(_, id)| index.records.get(id).cloned())
            .collect()
    }

    /// Current head of a run
    #[must_use]
    pub fn head(&self, run_id: RunId) -> Option<SnapshotId> {
        self.index.read().heads.get(&run_id).copied()
    }

    /// Most recently created snapshot of a run, whatever the head
    #[must_use]
    pub fn last_snapshot_id(&self, run_id: RunId) -> Option<SnapshotId> {
        self.index
            .read()
            .by_run
            .get(&run_id)
            .and_then(|timeline| timeline.last())
            .map(|(_, id)| *id)
    }

    /// Every run with at least one snapshot
    #[must_use]
    pub fn runs(&self) -> Vec<RunId> {
        let mut runs: Vec<RunId> = self.index.read().by_run.keys().copied().collect();
        runs.sort();
        runs
    }

    /// Move a run's head to one of its snapshots
    ///
    /// # Errors
    /// Returns [`StoreError::SnapshotNotFound`] or
    /// [`StoreError::ForeignSnapshot`]
    pub fn rollback(&self, run_id: RunId, snapshot_id: SnapshotId) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        let record = self.get_snapshot(snapshot_id)?;
        if record.run_id != run_id {
            return Err(StoreError::ForeignSnapshot {
                snapshot: snapshot_id,
                run: run_id,
            });
        }
        let previous = self.head(run_id);
        self.commit(IndexEvent::Head {
            run_id,
            snapshot_id,
        })?;
        tracing::info!(
            run_id = %run_id,
            snapshot_id = %snapshot_id,
            previous = ?previous,
            "head moved"
        );
        Ok(())
    }

    /// Ids from `id` back to the run root
    ///
    /// # Errors
    /// Returns [`StoreError::SnapshotNotFound`] if `id` is unknown
    pub fn ancestors(&self, id: SnapshotId) -> StoreResult<Vec<SnapshotId>> {
        let index = self.index.read();
        let chain: Vec<SnapshotId> = index.chain(id).into_iter().map(|r| r.id).collect();
        if chain.is_empty() {
            return Err(StoreError::SnapshotNotFound(id));
        }
        Ok(chain)
    }

    /// Structural difference between two snapshots; applying it to `a`'s
    /// state yields `b`'s
    ///
    /// # Errors
    /// Returns any reconstruction error
    pub fn diff(&self, a: SnapshotId, b: SnapshotId) -> StoreResult<StateDelta> {
        let base = self.reconstruct(a)?;
        let target = self.reconstruct(b)?;
        Ok(StateDelta::between(&base, &target)?)
    }

    /// Append tool calls to a run's ledger, including calls from branches
    /// that are later rolled back.
    ///
    /// The ledger is permanent, so it keeps every cited output blob alive: it
    /// takes over one reference per call on `output_digest`, which the caller
    /// must already hold (see [`ContentStore::put_retained`]). GC never
    /// removes ledger entries, so these references are never dropped. If the
    /// journal write fails the references are released.
    ///
    /// # Errors
    /// Returns error if the journal write fails
    pub fn record_tool_calls(&self, run_id: RunId, calls: Vec<ToolCallRecord>) -> StoreResult<()> {
        if calls.is_empty() {
            return Ok(());
        }
        let outputs: Vec<ContentHash> = calls.iter().map(|c| c.output_digest).collect();
        let committed = {
            let _guard = self.write_lock.lock();
            self.commit(IndexEvent::ToolCalls { run_id, calls })
        };
        if committed.is_err() {
            for digest in &outputs {
                if let Err(e) = self.content.release(digest) {
                    tracing::warn!(digest = %digest.short(), error = %e, "failed to release unledgered output");
                }
            }
        }
        committed
    }

    /// Every tool call recorded for a run, in order
    #[must_use]
    pub fn tool_ledger(&self, run_id: RunId) -> Vec<ToolCallRecord> {
        self.index
            .read()
            .ledger
            .get(&run_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Facts in the order snapshots introduced them
    #[must_use]
    pub fn facts(&self, run_id: RunId) -> Vec<(SnapshotId, Fact)> {
        self.index
            .read()
            .facts
            .get(&run_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Aggregate counters
    ///
    /// # Errors
    /// Returns error if the blob backend cannot be listed
    pub fn stats(&self) -> StoreResult<StoreStats> {
        let mut stats = {
            let index = self.index.read();
            let mut stats = StoreStats {
                snapshots: index.records.len(),
                runs: index.by_run.len(),
                ..StoreStats::default()
            };
            for record in index.records.values() {
                if record.encoding.is_full() {
                    stats.full += 1;
                } else {
                    stats.deltas += 1;
                }
                if record.is_milestone {
                    stats.milestones += 1;
                }
            }
            stats
        };
        stats.blobs = self.content.blob_count()?;
        Ok(stats)
    }
}

fn hash_mismatch(record: &SnapshotRecord, actual: ContentHash) -> StoreError {
    tracing::error!(
        snapshot_id = %record.id,
        expected = %record.state_digest,
        actual = %actual,
        "reconstructed state does not match its digest"
    );
    StoreError::HashMismatch {
        snapshot: record.id,
        expected: record.state_digest,
        actual,
    }
}
