//! Run configuration
//!
//! [`AtmConfig`] aggregates the per-crate settings and is read from TOML.
//! Every section is optional; missing values take their defaults.

use crate::error::{AtmError, AtmResult};
use atm_guard::LoopDetectorConfig;
use atm_memo::MemoConfig;
use atm_store::StoreConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtmConfig {
    /// Snapshot store
    pub store: StoreConfig,
    /// Tool memoization
    pub memo: MemoConfig,
    /// Loop detectors
    pub detector: LoopDetectorConfig,
    /// Recovery controller
    pub recovery: RecoveryConfig,
    /// Step loop
    pub run: RunConfig,
    /// Log output
    pub logging: LoggingConfig,
}

impl AtmConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With store settings
    #[inline]
    #[must_use]
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// With memoization settings
    #[inline]
    #[must_use]
    pub fn with_memo(mut self, memo: MemoConfig) -> Self {
        self.memo = memo;
        self
    }

    /// With detector settings
    #[inline]
    #[must_use]
    pub fn with_detector(mut self, detector: LoopDetectorConfig) -> Self {
        self.detector = detector;
        self
    }

    /// With recovery settings
    #[inline]
    #[must_use]
    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }

    /// With step loop settings
    #[inline]
    #[must_use]
    pub fn with_run(mut self, run: RunConfig) -> Self {
        self.run = run;
        self
    }

    /// Parse and validate a TOML document
    ///
    /// # Errors
    /// Returns [`AtmError::Config`] on a parse or validation failure
    pub fn from_toml_str(input: &str) -> AtmResult<Self> {
        let config: Self = toml::from_str(input).map_err(|e| AtmError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    ///
    /// # Errors
    /// Returns [`AtmError::Config`] if the file cannot be read or is invalid
    pub fn load(path: impl AsRef<Path>) -> AtmResult<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)
            .map_err(|e| AtmError::Config(format!("{}: {e}", path.display())))?;
        let config = Self::from_toml_str(&input)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// Returns [`AtmError::Config`] naming the first invalid value
    pub fn validate(&self) -> AtmResult<()> {
        let invalid = |msg: String| Err(AtmError::Config(msg));

        if self.store.max_delta_depth < 1 {
            return invalid("store.max_delta_depth must be at least 1".into());
        }
        if self.detector.cycle_window < 2 {
            return invalid(format!(
                "detector.cycle_window must be at least 2, got {}",
                self.detector.cycle_window
            ));
        }
        let threshold = self.detector.cycle_similarity_threshold;
        if !(0.0..1.0).contains(&threshold) {
            return invalid(format!(
                "detector.cycle_similarity_threshold must be in [0, 1), got {threshold}"
            ));
        }
        if self.detector.no_progress_calls < 1 {
            return invalid("detector.no_progress_calls must be at least 1".into());
        }
        if !(1..=2).contains(&self.recovery.max_perturbations) {
            return invalid(format!(
                "recovery.max_perturbations must be 1 or 2, got {}",
                self.recovery.max_perturbations
            ));
        }
        if self.recovery.clarification_after_rollbacks < 1 {
            return invalid("recovery.clarification_after_rollbacks must be at least 1".into());
        }
        if self.memo.max_capacity < 1 {
            return invalid("memo.max_capacity must be at least 1".into());
        }
        Ok(())
    }
}

/// Recovery controller settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Consecutive rollbacks after which the run asks the user
    pub clarification_after_rollbacks: u32,
    /// Planner knobs changed per branch
    pub max_perturbations: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            clarification_after_rollbacks: 2,
            max_perturbations: 2,
        }
    }
}

/// Step loop settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Re-snapshot the head after this long without a snapshot
    pub auto_checkpoint_secs: u64,
    /// Memoized tool outputs live this long, `None` uses the cache default
    pub tool_ttl_secs: Option<u64>,
}

impl RunConfig {
    /// Auto-checkpoint interval
    #[inline]
    #[must_use]
    pub fn auto_checkpoint(&self) -> Duration {
        Duration::from_secs(self.auto_checkpoint_secs)
    }

    /// Per-call memo lifetime override
    #[inline]
    #[must_use]
    pub fn tool_ttl(&self) -> Option<Duration> {
        self.tool_ttl_secs.map(Duration::from_secs)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            auto_checkpoint_secs: 60,
            tool_ttl_secs: None,
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    /// Emit JSON lines instead of plain text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}
