//! Cache configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Memoization cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoConfig {
    /// Maximum cached entries
    pub max_capacity: u64,
    /// Entry lifetime when a call does not give its own
    pub default_ttl_secs: u64,
}

impl MemoConfig {
    /// Default entry lifetime
    #[inline]
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

impl Default for MemoConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            default_ttl_secs: 24 * 60 * 60,
        }
    }
}
