//! Store configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Snapshot store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Longest delta chain before a snapshot is forced to full encoding
    pub max_delta_depth: u32,
    /// Gzip blob files on disk
    pub compress_blobs: bool,
    /// Garbage collection policy
    pub gc: GcPolicy,
}

impl StoreConfig {
    /// Default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With max delta depth
    #[inline]
    #[must_use]
    pub fn with_max_delta_depth(mut self, depth: u32) -> Self {
        self.max_delta_depth = depth;
        self
    }

    /// With GC policy
    #[inline]
    #[must_use]
    pub fn with_gc(mut self, gc: GcPolicy) -> Self {
        self.gc = gc;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_delta_depth: 8,
            compress_blobs: true,
            gc: GcPolicy::default(),
        }
    }
}

/// Which unreachable snapshots a sweep may remove.
///
/// Milestones, heads and all their ancestors are never removed regardless of
/// policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcPolicy {
    /// Unreachable snapshots older than this are removed
    pub ttl_secs: u64,
    /// Remove unreachable snapshots regardless of age
    pub sweep_superseded: bool,
    /// Period of the background sweeper
    pub interval_secs: u64,
}

impl GcPolicy {
    /// Age threshold
    #[inline]
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Sweep period
    #[inline]
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// Policy that removes every unreachable snapshot
    #[inline]
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            ttl_secs: 0,
            sweep_superseded: true,
            ..Self::default()
        }
    }
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self {
            ttl_secs: 60 * 60,
            sweep_superseded: false,
            interval_secs: 60,
        }
    }
}
