//! Cache usage figures for settings screens.

use serde::{Deserialize, Serialize};

/// Snapshot of the cache directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Complete media files on disk
    pub entry_count: usize,
    /// Bytes used by media, sidecars and art
    pub total_bytes: u64,
    /// Configured budget; 0 means unbounded
    pub budget_bytes: u64,
    pub transient_count: usize,
    pub active_downloads: usize,
}

impl CacheStats {
    /// Share of the budget in use, or `None` when unbounded.
    pub fn usage_percent(&self) -> Option<f64> {
        if self.budget_bytes == 0 {
            return None;
        }
        Some(self.total_bytes as f64 / self.budget_bytes as f64 * 100.0)
    }

    pub fn is_over_budget(&self) -> bool {
        self.budget_bytes > 0 && self.total_bytes > self.budget_bytes
    }
}
