//! Background maintenance passes.
//!
//! A pass runs `ANALYZE` and an incremental vacuum, on a dedicated
//! connection for file stores and on the write connection at
//! housekeeping priority for in-memory ones, so foreground work always
//! goes first. Passes are due when enough commits accumulated since the last
//! one or when enough wall-clock time passed with at least one write;
//! either trigger alone schedules a pass and a pass resets both.
//! Scheduling is off until the embedder opts in, but commits are still
//! counted while disabled so enabling can schedule immediately.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::ItemdbConfig;
use crate::error::DbResult;
use crate::tx::TransactionContext;
use crate::types::Icn;

struct HkState {
    allowed: bool,
    /// A pass job is queued or running; no second one gets scheduled.
    scheduled: bool,
    baseline_icn: Icn,
    last_pass: Instant,
    interval: Duration,
    wrote_since_pass: bool,
}

pub(crate) struct Housekeeping {
    icn_delta: i64,
    backoff: f64,
    max_interval: Duration,
    state: Mutex<HkState>,
    passes: AtomicU64,
}

impl Housekeeping {
    pub(crate) fn new(config: &ItemdbConfig) -> Housekeeping {
        Housekeeping {
            icn_delta: config.housekeeping_icn_delta,
            backoff: config.housekeeping_backoff,
            max_interval: Duration::from_millis(config.housekeeping_max_interval_ms),
            state: Mutex::new(HkState {
                allowed: false,
                scheduled: false,
                baseline_icn: Icn::ZERO,
                last_pass: Instant::now(),
                interval: Duration::from_millis(config.housekeeping_initial_interval_ms),
                wrote_since_pass: false,
            }),
            passes: AtomicU64::new(0),
        }
    }

    fn due(&self, state: &HkState, icn: Icn) -> bool {
        if icn.raw() - state.baseline_icn.raw() >= self.icn_delta {
            return true;
        }
        state.wrote_since_pass && state.last_pass.elapsed() >= state.interval
    }

    /// Called by the write worker after every commit. Returns whether a
    /// pass should be scheduled now.
    pub(crate) fn note_commit(&self, icn: Icn) -> bool {
        let mut state = self.state.lock();
        state.wrote_since_pass = true;
        if !state.allowed || state.scheduled || !self.due(&state, icn) {
            return false;
        }
        state.scheduled = true;
        true
    }

    /// Flips the embedder's opt-in. Returns whether a pass is due right
    /// away, which happens when commits accumulated while disabled.
    pub(crate) fn set_allowed(&self, allowed: bool, icn: Icn) -> bool {
        let mut state = self.state.lock();
        state.allowed = allowed;
        if !allowed || state.scheduled || !self.due(&state, icn) {
            return false;
        }
        state.scheduled = true;
        true
    }

    /// Runs one maintenance pass. On file stores this executes in
    /// autocommit on the housekeeping connection, so each statement
    /// takes and releases the write lock on its own.
    pub(crate) fn run_pass(&self, ctx: &mut TransactionContext<'_>) -> DbResult<()> {
        // Clear the scheduled flag up front so a failing pass does not
        // block the next one from being scheduled.
        {
            let mut state = self.state.lock();
            state.scheduled = false;
        }
        ctx.ensure_alive()?;
        ctx.state.conn.execute_batch("ANALYZE")?;
        if let Err(err) = ctx.state.conn.execute_batch("PRAGMA incremental_vacuum") {
            // Fails on databases not opened with incremental vacuuming;
            // the pass still counts.
            tracing::warn!(error = %err, "incremental vacuum skipped");
        }
        let mut state = self.state.lock();
        // The pass transaction itself touches nothing, so its stamp is
        // one above the last data commit.
        state.baseline_icn = Icn(ctx.icn().raw() - 1);
        state.last_pass = Instant::now();
        state.interval = Duration::from_secs_f64(
            (state.interval.as_secs_f64() * self.backoff)
                .min(self.max_interval.as_secs_f64()),
        );
        state.wrote_since_pass = false;
        drop(state);
        let done = self.passes.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(passes = done, "housekeeping pass finished");
        Ok(())
    }

    /// Passes completed since the store started.
    pub(crate) fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }
}
