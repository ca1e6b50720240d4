//! Loop, stall and error-motif detection
//!
//! [`LoopDetector`] is stateless: every evaluation looks only at the
//! [`RunHistory`] it is handed. The history belongs to one run and is reset
//! when the run starts.

use atm_state::ToolStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

/// Loop detector settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopDetectorConfig {
    /// Window size K for the cycle detector
    pub cycle_window: usize,
    /// The window is a cycle when its mean consecutive similarity exceeds this
    pub cycle_similarity_threshold: f64,
    /// Consecutive calls N without progress
    pub no_progress_calls: usize,
    /// Wall time T without progress
    pub no_progress_secs: u64,
    /// Observations kept per run
    pub history_capacity: usize,
}

impl LoopDetectorConfig {
    /// Wall-time stall threshold
    #[inline]
    #[must_use]
    pub fn no_progress_window(&self) -> Duration {
        Duration::from_secs(self.no_progress_secs)
    }
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            cycle_window: 3,
            cycle_similarity_threshold: 0.9,
            no_progress_calls: 10,
            no_progress_secs: 5 * 60,
            history_capacity: 32,
        }
    }
}

/// One tool call as the detectors see it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Tool name
    pub tool: String,
    /// Outcome
    pub status: ToolStatus,
    /// Normalized tokens of the tool input and output
    pub signature: BTreeSet<String>,
    /// Active goal leaf when the call was made
    pub active_leaf: Option<String>,
    /// Facts the call contributed
    pub new_facts: usize,
    /// Constraint updates the call contributed
    pub constraint_updates: usize,
    /// When the call finished
    pub at: DateTime<Utc>,
}

impl Observation {
    /// Observation of a call with no progress recorded yet
    #[must_use]
    pub fn new(
        tool: impl Into<String>,
        input: &str,
        output: &str,
        status: ToolStatus,
        active_leaf: Option<String>,
        at: DateTime<Utc>,
    ) -> Self {
        let tool = tool.into();
        let mut signature = tokens(input);
        signature.extend(tokens(output));
        signature.insert(format!("tool:{tool}"));
        Self {
            tool,
            status,
            signature,
            active_leaf,
            new_facts: 0,
            constraint_updates: 0,
            at,
        }
    }

    /// With progress counts
    #[must_use]
    pub fn with_progress(mut self, new_facts: usize, constraint_updates: usize) -> Self {
        self.new_facts = new_facts;
        self.constraint_updates = constraint_updates;
        self
    }

    /// Whether the call moved the run forward
    #[inline]
    #[must_use]
    pub fn made_progress(&self) -> bool {
        self.new_facts > 0 || self.constraint_updates > 0
    }

    /// Failure signature (tool name + error class), `None` on success
    #[must_use]
    pub fn failure_signature(&self) -> Option<(&str, &str)> {
        match &self.status {
            ToolStatus::Ok => None,
            ToolStatus::Error { class } => Some((self.tool.as_str(), class.as_str())),
        }
    }
}

/// Lowercased alphanumeric tokens of at least two characters
fn tokens(text: &str) -> BTreeSet<String> {
    let normalized: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect();
    normalized
        .split_whitespace()
        .filter(|t| t.len() >= 2)
        .map(str::to_string)
        .collect()
}

/// Jaccard similarity of two token sets
#[must_use]
pub fn similarity(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

/// Bounded sliding window of a run's recent tool calls
#[derive(Debug, Clone)]
pub struct RunHistory {
    window: VecDeque<Observation>,
    capacity: usize,
}

impl RunHistory {
    /// Empty history keeping at most `capacity` observations
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Record a call, dropping the oldest if full
    pub fn push(&mut self, observation: Observation) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(observation);
    }

    /// Forget everything (run start)
    pub fn clear(&mut self) {
        self.window.clear();
    }

    /// Observations, oldest first
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Observation> + ExactSizeIterator {
        self.window.iter()
    }

    /// Number of observations
    #[must_use]
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// No observations
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Most recent observation
    #[must_use]
    pub fn last(&self) -> Option<&Observation> {
        self.window.back()
    }
}

/// Which detector fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    /// Near-identical calls without the active leaf advancing
    Cycle,
    /// Calls or time without new facts or constraint updates
    NoProgress,
    /// Same failure twice in a row
    ErrorMotif,
}

impl DetectorKind {
    /// Reason code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Cycle => "cycle",
            Self::NoProgress => "no_progress",
            Self::ErrorMotif => "error_motif",
        }
    }
}

/// A fired detector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorTrigger {
    /// Detector
    pub kind: DetectorKind,
    /// Human-readable detail
    pub reason: String,
}

/// Every detector that fired on one evaluation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopReport {
    /// Triggers in detector order
    pub triggers: Vec<DetectorTrigger>,
}

impl LoopReport {
    /// No detector fired
    #[inline]
    #[must_use]
    pub fn is_clear(&self) -> bool {
        self.triggers.is_empty()
    }

    /// Whether a given detector fired
    #[must_use]
    pub fn fired(&self, kind: DetectorKind) -> bool {
        self.triggers.iter().any(|t| t.kind == kind)
    }

    /// Reason lines (`code: detail`)
    #[must_use]
    pub fn reasons(&self) -> Vec<String> {
        self.triggers
            .iter()
            .map(|t| format!("{}: {}", t.kind.code(), t.reason))
            .collect()
    }
}

/// Stateless analyzer over a [`RunHistory`]
#[derive(Debug, Clone, Default)]
pub struct LoopDetector {
    config: LoopDetectorConfig,
}

impl LoopDetector {
    /// Create detector
    #[must_use]
    pub fn new(config: LoopDetectorConfig) -> Self {
        Self { config }
    }

    /// Settings
    #[must_use]
    pub fn config(&self) -> &LoopDetectorConfig {
        &self.config
    }

    /// Fresh history sized for this detector
    #[must_use]
    pub fn history(&self) -> RunHistory {
        let needed = self.config.cycle_window.max(self.config.no_progress_calls);
        RunHistory::new(self.config.history_capacity.max(needed))
    }

    /// Run all three detectors
    #[must_use]
    pub fn evaluate(&self, history: &RunHistory, now: DateTime<Utc>) -> LoopReport {
        let triggers: Vec<DetectorTrigger> = [
            self.cycle(history),
            self.no_progress(history, now),
            Self::error_motif(history),
        ]
        .into_iter()
        .flatten()
        .collect();
        for trigger in &triggers {
            tracing::debug!(detector = trigger.kind.code(), reason = %trigger.reason, "loop detector fired");
        }
        LoopReport { triggers }
    }

    fn cycle(&self, history: &RunHistory) -> Option<DetectorTrigger> {
        let k = self.config.cycle_window;
        if k < 2 || history.len() < k {
            return None;
        }
        let window: Vec<&Observation> = history.iter().rev().take(k).collect();
        let leaf = &window[0].active_leaf;
        if window.iter().any(|o| &o.active_leaf != leaf) {
            return None;
        }
        let total: f64 = window
            .windows(2)
            .map(|pair| similarity(&pair[0].signature, &pair[1].signature))
            .sum();
        let mean = total / (k - 1) as f64;
        (mean > self.config.cycle_similarity_threshold).then(|| DetectorTrigger {
            kind: DetectorKind::Cycle,
            reason: format!(
                "last {k} calls to {} are {:.0}% similar and goal `{}` has not advanced",
                window[0].tool,
                mean * 100.0,
                leaf.as_deref().unwrap_or("<none>")
            ),
        })
    }

    fn no_progress(&self, history: &RunHistory, now: DateTime<Utc>) -> Option<DetectorTrigger> {
        let stalled: Vec<&Observation> = history
            .iter()
            .rev()
            .take_while(|o| !o.made_progress())
            .collect();
        let oldest = stalled.last()?;

        let n = self.config.no_progress_calls;
        if n > 0 && stalled.len() >= n {
            return Some(DetectorTrigger {
                kind: DetectorKind::NoProgress,
                reason: format!("{} consecutive calls produced no new facts", stalled.len()),
            });
        }

        let elapsed = now
            .signed_duration_since(oldest.at)
            .to_std()
            .unwrap_or_default();
        (self.config.no_progress_secs > 0 && elapsed >= self.config.no_progress_window()).then(
            || DetectorTrigger {
                kind: DetectorKind::NoProgress,
                reason: format!("no new facts for {}s", elapsed.as_secs()),
            },
        )
    }

    fn error_motif(history: &RunHistory) -> Option<DetectorTrigger> {
        let mut recent = history.iter().rev();
        let last = recent.next()?.failure_signature()?;
        let previous = recent.next()?.failure_signature()?;
        (last == previous).then(|| DetectorTrigger {
            kind: DetectorKind::ErrorMotif,
            reason: format!("{} failed twice with {}", last.0, last.1),
        })
    }
}
