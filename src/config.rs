//! Engine configuration.
//!
//! One explicit value threaded through construction — no process-wide
//! globals. `Default` carries the production constants; tests override
//! individual fields with struct-update syntax.

use std::time::Duration;

/// Tunables for a document control engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// First retry delay after a lost append race.
    pub retry_initial_backoff: Duration,
    /// Backoff growth per attempt.
    pub retry_backoff_factor: u32,
    /// Total wall-clock budget for one `apply_change` call's retries.
    pub retry_budget: Duration,
    /// Soft cap on cached snapshots per control (head is pinned extra).
    pub snapshot_cache_cap: usize,
    /// Maximum change reads per file transaction.
    pub max_reads_per_tx: usize,
    /// Carets idle longer than this are reaped.
    pub caret_idle_threshold: Duration,
    /// How often the idle reaper wakes.
    pub reaper_interval: Duration,
    /// Format version written at create and required at open.
    pub format_version: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_initial_backoff: Duration::from_millis(50),
            retry_backoff_factor: 5,
            retry_budget: Duration::from_secs(20),
            snapshot_cache_cap: 16,
            max_reads_per_tx: 20,
            caret_idle_threshold: Duration::from_secs(10 * 60),
            reaper_interval: Duration::from_secs(60),
            format_version: "1".to_string(),
        }
    }
}
