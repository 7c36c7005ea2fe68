//! Jobs, handles, and completion plumbing.
//!
//! A submitted closure becomes a [`Job`] whose typed result flows back
//! through a [`Completion`] latch. The worker stages the result before
//! committing; only a successful commit releases it, so a caller never
//! observes `Ok` for work that was rolled back.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{DbError, DbResult};
use crate::types::Priority;

/// Where a completion callback runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecGate {
    /// On the worker thread, right after the job settles. Keep these
    /// short; the queue is blocked while they run.
    Inline,
    /// On a detached thread.
    Detached,
}

/// What a job is allowed to do and how its transaction ends.
///
/// `Read` jobs stack on one rollback-only deferred transaction.
/// `ReadCommit` jobs read the same data but commit, so TEMP schema they
/// build outlives the job. `Write` jobs run under `BEGIN IMMEDIATE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobKind {
    Read,
    ReadCommit,
    Write,
}

/// Result of running a job body, seen by the worker. The typed value
/// already sits staged in the completion; the worker only needs to know
/// whether to commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    Ok,
    Failed,
}

enum Slot<T> {
    Empty,
    Staged(DbResult<T>),
    Done,
}

struct CompletionState<T> {
    slot: Slot<T>,
    result: Option<DbResult<T>>,
    callback: Option<(ExecGate, Box<dyn FnOnce(DbResult<T>) + Send>)>,
}

/// One-shot latch carrying the job result.
pub(crate) struct Completion<T> {
    state: Mutex<CompletionState<T>>,
    cond: Condvar,
}

impl<T: Send + 'static> Completion<T> {
    pub(crate) fn new() -> Arc<Completion<T>> {
        Arc::new(Completion {
            state: Mutex::new(CompletionState {
                slot: Slot::Empty,
                result: None,
                callback: None,
            }),
            cond: Condvar::new(),
        })
    }

    /// Parks the result without releasing it. A later [`seal`] hands it
    /// to the waiter, a later [`fail`] replaces it.
    ///
    /// [`seal`]: Completion::seal
    /// [`fail`]: Completion::fail
    pub(crate) fn stage(&self, result: DbResult<T>) {
        let mut state = self.state.lock();
        if matches!(state.slot, Slot::Empty) {
            state.slot = Slot::Staged(result);
        }
    }

    /// Releases a staged result to waiters and callbacks.
    pub(crate) fn seal(&self) {
        let mut state = self.state.lock();
        let staged = std::mem::replace(&mut state.slot, Slot::Done);
        if let Slot::Staged(result) = staged {
            Self::finish(self, state, result);
        }
    }

    /// Settles with an error, discarding anything staged. Idempotent
    /// once the latch is done.
    pub(crate) fn fail(&self, err: DbError) {
        let mut state = self.state.lock();
        match std::mem::replace(&mut state.slot, Slot::Done) {
            Slot::Done => {
                state.slot = Slot::Done;
            }
            _ => Self::finish(self, state, Err(err)),
        }
    }

    fn finish(
        &self,
        mut state: parking_lot::MutexGuard<'_, CompletionState<T>>,
        result: DbResult<T>,
    ) {
        state.slot = Slot::Done;
        if let Some((gate, callback)) = state.callback.take() {
            drop(state);
            run_callback(gate, callback, result);
        } else {
            state.result = Some(result);
            drop(state);
            self.cond.notify_all();
        }
    }

    fn is_done(&self) -> bool {
        matches!(self.state.lock().slot, Slot::Done)
    }

    fn wait(&self) -> DbResult<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(result) = state.result.take() {
                return result;
            }
            if matches!(state.slot, Slot::Done) {
                // Result already consumed or routed to a callback.
                return Err(DbError::lifecycle("job result already taken"));
            }
            self.cond.wait(&mut state);
        }
    }

    fn wait_deadline(&self, deadline: Instant) -> Option<DbResult<T>> {
        let mut state = self.state.lock();
        loop {
            if let Some(result) = state.result.take() {
                return Some(result);
            }
            if matches!(state.slot, Slot::Done) {
                return Some(Err(DbError::lifecycle("job result already taken")));
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
    }

    fn install_callback(&self, gate: ExecGate, callback: Box<dyn FnOnce(DbResult<T>) + Send>) {
        let mut state = self.state.lock();
        if let Some(result) = state.result.take() {
            state.slot = Slot::Done;
            drop(state);
            run_callback(gate, callback, result);
            return;
        }
        state.callback = Some((gate, callback));
    }
}

fn run_callback<T: Send + 'static>(
    gate: ExecGate,
    callback: Box<dyn FnOnce(DbResult<T>) + Send>,
    result: DbResult<T>,
) {
    match gate {
        ExecGate::Inline => callback(result),
        ExecGate::Detached => {
            std::thread::spawn(move || callback(result));
        }
    }
}

/// Type-erased view the worker uses to settle a job it never ran.
pub(crate) trait JobSink: Send + Sync {
    fn fail(&self, err: DbError);
    fn seal(&self);
}

impl<T: Send + 'static> JobSink for Completion<T> {
    fn fail(&self, err: DbError) {
        Completion::fail(self, err);
    }

    fn seal(&self) {
        Completion::seal(self);
    }
}

pub(crate) type JobBody =
    Box<dyn FnOnce(&mut crate::tx::TransactionContext<'_>) -> JobOutcome + Send>;

/// Shared control block, visible to the handle and the worker.
pub(crate) struct JobControl {
    pub(crate) cancelled: AtomicBool,
    pub(crate) hurried: AtomicBool,
    /// Set when the job body swallowed an error that poisons the whole
    /// connection, so the worker reincarnates even though the error
    /// already went to the caller.
    fatal: AtomicBool,
}

impl JobControl {
    pub(crate) fn new() -> Arc<JobControl> {
        Arc::new(JobControl {
            cancelled: AtomicBool::new(false),
            hurried: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub(crate) fn is_hurried(&self) -> bool {
        self.hurried.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_fatal(&self) {
        self.fatal.store(true, Ordering::Relaxed);
    }

    pub(crate) fn saw_fatal(&self) -> bool {
        self.fatal.load(Ordering::Relaxed)
    }
}

pub(crate) struct Job {
    pub(crate) kind: JobKind,
    pub(crate) priority: Priority,
    pub(crate) seq: u64,
    pub(crate) control: Arc<JobControl>,
    pub(crate) body: JobBody,
    pub(crate) sink: Arc<dyn JobSink>,
}

/// Handle to a submitted job.
///
/// Dropping the handle detaches the job; it still runs. Waiting
/// consumes the handle, as a result is delivered at most once.
pub struct JobHandle<T> {
    pub(crate) completion: Arc<Completion<T>>,
    pub(crate) control: Arc<JobControl>,
    pub(crate) seq: u64,
    pub(crate) queue: std::sync::Weak<super::queue::QueueShared>,
}

impl<T: Send + 'static> JobHandle<T> {
    /// Blocks until the job settles.
    pub fn wait(self) -> DbResult<T> {
        self.completion.wait()
    }

    /// Blocks up to `timeout`; returns the handle back on expiry so the
    /// caller can keep waiting or cancel.
    pub fn wait_timeout(self, timeout: Duration) -> Result<DbResult<T>, JobHandle<T>> {
        match self.completion.wait_deadline(Instant::now() + timeout) {
            Some(result) => Ok(result),
            None => Err(self),
        }
    }

    /// Routes the result to `callback` instead of a waiter. If the job
    /// already settled the callback runs immediately on this thread.
    pub fn on_complete(self, gate: ExecGate, callback: impl FnOnce(DbResult<T>) + Send + 'static) {
        self.completion.install_callback(gate, Box::new(callback));
    }

    /// Asks the engine to abandon the job. Queued jobs settle with a
    /// cancellation error; a running job is interrupted at the next
    /// statement boundary.
    pub fn cancel(&self) {
        self.control.cancelled.store(true, Ordering::Relaxed);
        if let Some(queue) = self.queue.upgrade() {
            queue.job_cancelled(self.seq);
        }
    }

    /// Asks the engine to finish the job soon: queued jobs jump to
    /// interactive priority and cooperative loops inside a running job
    /// cut their work short.
    pub fn hurry(&self) {
        self.control.hurried.store(true, Ordering::Relaxed);
        if let Some(queue) = self.queue.upgrade() {
            queue.job_hurried(self.seq);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.completion.is_done()
    }
}
