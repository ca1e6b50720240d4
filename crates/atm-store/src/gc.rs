//! Snapshot garbage collection
//!
//! Reachability is computed on a cloned view of the index, without holding
//! the write lock. The removal is committed under that lock only if the index
//! has not changed since the view was taken; otherwise the sweep is skipped
//! and the next period tries again.
//!
//! Safety: every milestone and every head is kept, and anything kept keeps
//! its entire parent chain.

use crate::config::GcPolicy;
use crate::error::StoreResult;
use crate::index::{IndexEvent, IndexState};
use crate::snapshot::SnapshotStore;
use atm_state::{ContentHash, SnapshotId};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Snapshots in the view
    pub examined: usize,
    /// Snapshots kept
    pub retained: usize,
    /// Snapshots removed
    pub removed: Vec<SnapshotId>,
    /// Blobs whose last reference was dropped
    pub blobs_released: usize,
    /// The index changed under the sweep; nothing was removed
    pub skipped: bool,
}

impl SnapshotStore {
    /// Run one sweep
    ///
    /// # Errors
    /// Returns error if the journal write or a blob delete fails
    pub fn collect_garbage(&self, policy: &GcPolicy, now: DateTime<Utc>) -> StoreResult<GcReport> {
        let view = self.index.read().clone();
        let keep = reachable(&view, policy, now);
        let removed: Vec<SnapshotId> = view
            .records
            .keys()
            .filter(|id| !keep.contains(id))
            .copied()
            .collect();

        let mut report = GcReport {
            examined: view.records.len(),
            retained: keep.len(),
            ..GcReport::default()
        };
        if removed.is_empty() {
            return Ok(report);
        }

        let blobs: Vec<ContentHash> = removed
            .iter()
            .filter_map(|id| view.records.get(id))
            .map(|record| record.encoding.blob())
            .collect();
        {
            let _guard = self.write_lock.lock();
            if self.index.read().generation != view.generation {
                tracing::debug!(generation = view.generation, "index changed during sweep, skipping");
                report.skipped = true;
                return Ok(report);
            }
            self.commit(IndexEvent::Removed {
                ids: removed.clone(),
            })?;
        }

        for blob in &blobs {
            if self.content().release(blob)? {
                report.blobs_released += 1;
            }
        }
        tracing::info!(
            removed = removed.len(),
            retained = report.retained,
            blobs_released = report.blobs_released,
            "gc sweep complete"
        );
        report.removed = removed;
        Ok(report)
    }
}

/// Snapshots the policy keeps, closed under ancestry
fn reachable(view: &IndexState, policy: &GcPolicy, now: DateTime<Utc>) -> HashSet<SnapshotId> {
    let ttl = policy.ttl();
    let expired = |created_at: DateTime<Utc>| {
        policy.sweep_superseded
            || now
                .signed_duration_since(created_at)
                .to_std()
                .unwrap_or_default()
                > ttl
    };

    let anchors = view
        .records
        .values()
        .filter(|r| r.is_milestone || !expired(r.created_at))
        .map(|r| r.id)
        .chain(view.heads.values().copied());

    let mut keep = HashSet::new();
    for anchor in anchors {
        for record in view.chain(anchor) {
            // Everything above an already-kept snapshot is already kept.
            if !keep.insert(record.id) {
                break;
            }
        }
    }
    keep
}

/// Handle to a background sweeper
#[derive(Debug)]
pub struct GcHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl GcHandle {
    /// Stop the sweeper and wait for it to finish
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::warn!(error = %e, "gc task ended abnormally");
        }
    }
}

impl Drop for GcHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Sweep `store` every `policy.interval()` on a tokio task.
///
/// Sweeps run on the blocking pool so snapshot writes and reconstructions are
/// never blocked behind one.
#[must_use]
pub fn spawn_gc(store: Arc<SnapshotStore>, policy: GcPolicy) -> GcHandle {
    let (stop_tx, mut stop_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(policy.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = ticker.tick() => {
                    let store = Arc::clone(&store);
                    let policy = policy.clone();
                    let sweep = tokio::task::spawn_blocking(move || {
                        store.collect_garbage(&policy, Utc::now())
                    });
                    match sweep.await {
                        Ok(Ok(report)) => tracing::debug!(
                            removed = report.removed.len(),
                            skipped = report.skipped,
                            "gc tick"
                        ),
                        Ok(Err(e)) => tracing::warn!(error = %e, "gc sweep failed"),
                        Err(e) => tracing::warn!(error = %e, "gc sweep panicked"),
                    }
                }
            }
        }
        tracing::debug!("gc task stopped");
    });
    GcHandle {
        stop: Some(stop_tx),
        task,
    }
}
