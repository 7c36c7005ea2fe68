use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for an item store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemdbConfig {
    /// SQLite page size, applied before the first table is created. Has no
    /// effect on an existing database file.
    pub page_size: u32,
    /// SQLite page cache size in pages.
    pub cache_size: u32,
    pub busy_timeout_ms: u64,
    /// Directory for SQLite temporary files; `None` leaves the engine
    /// default in place.
    pub temp_store_dir: Option<PathBuf>,
    /// How long an idle read-only transaction is kept open so consecutive
    /// read-rollback jobs can stack without a fresh BEGIN.
    pub read_rollback_max_idle_ms: u64,
    /// Delay before a dead connection worker is brought back. In-memory
    /// stores are never reincarnated.
    pub reincarnate_delay_ms: u64,
    /// Route read jobs to a dedicated read-only connection. Ignored for
    /// in-memory stores, which get a single connection.
    pub use_read_connection: bool,
    /// Maximum nesting depth accepted for predicate expressions.
    pub max_predicate_depth: usize,
    /// How many recent per-commit changed-item sets are retained for the
    /// incremental-cache fast path.
    pub recent_changes_window: usize,
    /// Committed writes between maintenance passes before one becomes due.
    pub housekeeping_icn_delta: i64,
    /// Initial wall-clock interval between maintenance passes.
    pub housekeeping_initial_interval_ms: u64,
    /// Multiplier applied to the wall-clock interval after every pass.
    pub housekeeping_backoff: f64,
    pub housekeeping_max_interval_ms: u64,
}

impl Default for ItemdbConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            cache_size: 2000,
            busy_timeout_ms: 5_000,
            temp_store_dir: None,
            read_rollback_max_idle_ms: 500,
            reincarnate_delay_ms: 3_000,
            use_read_connection: true,
            max_predicate_depth: 32,
            recent_changes_window: 64,
            housekeeping_icn_delta: 256,
            housekeeping_initial_interval_ms: 10 * 60 * 1_000,
            housekeeping_backoff: 2.0,
            housekeeping_max_interval_ms: 2 * 60 * 60 * 1_000,
        }
    }
}

impl ItemdbConfig {
    /// Profile for an interactive desktop application: snappy busy
    /// handling, read connection on, default housekeeping cadence.
    pub fn desktop() -> Self {
        Self::default()
    }

    /// Profile for one-shot background tooling (imports, exports): no
    /// second connection, no idle read stacking, eager maintenance.
    pub fn background_tool() -> Self {
        Self {
            use_read_connection: false,
            read_rollback_max_idle_ms: 0,
            housekeeping_icn_delta: 64,
            housekeeping_initial_interval_ms: 60 * 1_000,
            ..Self::default()
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn read_rollback_max_idle(&self) -> Duration {
        Duration::from_millis(self.read_rollback_max_idle_ms)
    }

    pub fn reincarnate_delay(&self) -> Duration {
        Duration::from_millis(self.reincarnate_delay_ms)
    }

    /// Clamp structurally impossible values, warning rather than failing;
    /// a config that parses is always usable.
    pub(crate) fn sanitized(mut self) -> Self {
        if !self.page_size.is_power_of_two() || !(512..=65_536).contains(&self.page_size) {
            tracing::warn!(page_size = self.page_size, "invalid page size, using 4096");
            self.page_size = 4096;
        }
        if self.recent_changes_window == 0 {
            self.recent_changes_window = 1;
        }
        if self.max_predicate_depth == 0 {
            self.max_predicate_depth = 1;
        }
        if self.housekeeping_backoff < 1.0 || !self.housekeeping_backoff.is_finite() {
            tracing::warn!(
                backoff = self.housekeeping_backoff,
                "housekeeping backoff below 1.0, using 1.0"
            );
            self.housekeeping_backoff = 1.0;
        }
        if self.housekeeping_icn_delta < 1 {
            self.housekeeping_icn_delta = 1;
        }
        self
    }
}
