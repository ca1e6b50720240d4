//! Shared services for runs
//!
//! One [`AtmContext`] is shared by every run in a process. Runs on the same
//! context share the snapshot store, the content store underneath it and the
//! memoization cache.

use crate::config::AtmConfig;
use crate::error::AtmResult;
use crate::external::{Executor, Planner, ToolRunner};
use crate::run::Run;
use atm_guard::{ConstraintVerifier, LoopDetector};
use atm_memo::MemoizationCache;
use atm_state::AgentState;
use atm_store::{spawn_gc, GcHandle, SnapshotStore};
use std::path::Path;
use std::sync::Arc;

/// Store, cache, verifier and detector settings shared across runs
#[derive(Debug, Clone)]
pub struct AtmContext {
    store: Arc<SnapshotStore>,
    memo: MemoizationCache,
    verifier: Arc<ConstraintVerifier>,
    detector: LoopDetector,
    config: Arc<AtmConfig>,
}

impl AtmContext {
    /// Context over an existing store
    ///
    /// # Errors
    /// Returns [`AtmError::Config`](crate::AtmError::Config) if `config` is
    /// invalid
    pub fn with_store(store: Arc<SnapshotStore>, config: AtmConfig) -> AtmResult<Self> {
        config.validate()?;
        let memo = MemoizationCache::new(Arc::clone(store.content()), &config.memo);
        Ok(Self {
            store,
            memo,
            verifier: Arc::new(ConstraintVerifier::with_defaults()),
            detector: LoopDetector::new(config.detector.clone()),
            config: Arc::new(config),
        })
    }

    /// Context with in-memory storage
    ///
    /// # Errors
    /// Returns [`AtmError::Config`](crate::AtmError::Config) if `config` is
    /// invalid
    pub fn in_memory(config: AtmConfig) -> AtmResult<Self> {
        let store = SnapshotStore::in_memory(config.store.clone());
        Self::with_store(Arc::new(store), config)
    }

    /// Context with a filesystem store at `root`
    ///
    /// # Errors
    /// Returns a storage error if the store cannot be opened, or a config
    /// error
    pub fn open(root: impl AsRef<Path>, config: AtmConfig) -> AtmResult<Self> {
        config.validate()?;
        let store = SnapshotStore::open(root, config.store.clone())?;
        Self::with_store(Arc::new(store), config)
    }

    /// Replace the verifier (to register custom constraint checks)
    #[must_use]
    pub fn with_verifier(mut self, verifier: ConstraintVerifier) -> Self {
        self.verifier = Arc::new(verifier);
        self
    }

    /// Snapshot store
    #[must_use]
    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    /// Memoization cache
    #[must_use]
    pub fn memo(&self) -> &MemoizationCache {
        &self.memo
    }

    /// Constraint verifier
    #[must_use]
    pub fn verifier(&self) -> &ConstraintVerifier {
        &self.verifier
    }

    /// Loop detector
    #[must_use]
    pub fn detector(&self) -> &LoopDetector {
        &self.detector
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &AtmConfig {
        &self.config
    }

    /// Snapshot `initial` as the root of a new run
    ///
    /// # Errors
    /// Returns a state error if `initial` has unsourced facts, or a storage
    /// error
    pub fn start_run(
        &self,
        initial: AgentState,
        planner: Arc<dyn Planner>,
        executor: Arc<dyn Executor>,
        tools: Arc<dyn ToolRunner>,
    ) -> AtmResult<Run> {
        Run::start(self.clone(), initial, planner, executor, tools)
    }

    /// Start the background sweeper with the configured policy
    #[must_use]
    pub fn spawn_gc(&self) -> GcHandle {
        spawn_gc(Arc::clone(&self.store), self.config.store.gc.clone())
    }
}
