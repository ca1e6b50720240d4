//! Snapshot index records

use atm_state::{AgentState, ContentHash, RunId, SnapshotId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a snapshot's state is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", rename_all = "snake_case")]
pub enum SnapshotEncoding {
    /// Canonical state bytes
    Full {
        /// Blob holding the serialized state
        blob: ContentHash,
    },
    /// Structural delta against the parent's reconstructed state
    Delta {
        /// Blob holding the serialized delta
        blob: ContentHash,
        /// Deltas since the nearest full snapshot, including this one
        chain_depth: u32,
    },
}

impl SnapshotEncoding {
    /// Blob backing the snapshot
    #[inline]
    #[must_use]
    pub fn blob(&self) -> ContentHash {
        match self {
            Self::Full { blob } | Self::Delta { blob, .. } => *blob,
        }
    }

    /// Whether stored in full
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full { .. })
    }

    /// Deltas since the nearest full snapshot (0 for full)
    #[inline]
    #[must_use]
    pub fn chain_depth(&self) -> u32 {
        match self {
            Self::Full { .. } => 0,
            Self::Delta { chain_depth, .. } => *chain_depth,
        }
    }
}

/// Planner settings captured with a snapshot so a replay is reproducible
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayHandles {
    /// Planner seed
    pub seed: u64,
    /// Planner temperature
    pub temperature: f64,
    /// Versioned template/index hashes
    pub template_hashes: BTreeMap<String, ContentHash>,
}

impl ReplayHandles {
    /// Capture from a state's planner configuration
    #[must_use]
    pub fn capture(state: &AgentState) -> Self {
        Self {
            seed: state.planner_cfg.seed,
            temperature: state.planner_cfg.temperature,
            template_hashes: state.planner_cfg.template_hashes.clone(),
        }
    }
}

/// Index entry for one snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Snapshot id
    pub id: SnapshotId,
    /// Owning run
    pub run_id: RunId,
    /// Parent snapshot, `None` for a run root
    pub parent_id: Option<SnapshotId>,
    /// Digest of the canonical state
    pub state_digest: ContentHash,
    /// Full or delta
    pub encoding: SnapshotEncoding,
    /// Added a fact or constraint change over its parent (roots are milestones)
    pub is_milestone: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Replay handles
    pub replay: ReplayHandles,
}

impl SnapshotRecord {
    /// Run root
    #[inline]
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Aggregate store counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Indexed snapshots
    pub snapshots: usize,
    /// Snapshots stored in full
    pub full: usize,
    /// Snapshots stored as deltas
    pub deltas: usize,
    /// Milestone snapshots
    pub milestones: usize,
    /// Runs with at least one snapshot
    pub runs: usize,
    /// Blobs in the content store
    pub blobs: usize,
}
