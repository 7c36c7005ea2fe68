//! Job queue and worker threads.
//!
//! One worker owns the writable connection and runs write jobs under
//! `BEGIN IMMEDIATE`. A second worker owns an optional read-only
//! connection and serves read jobs from stacked deferred transactions,
//! reusing one SQLite snapshot across consecutive reads until it goes
//! stale or idles out; committing reads get a fresh transaction that
//! ends in COMMIT so TEMP schema they build survives the job. File
//! stores also get a third connection that runs maintenance passes in
//! autocommit, off the main writer. Without a read connection the write
//! worker serves reads too. Selection is by priority, submission order
//! among equals, and a newly arrived job hurries any running job below
//! its priority.

use parking_lot::{Condvar, Mutex};
use rusqlite::InterruptHandle;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::{DbError, DbResult};
use crate::sqlite::job::{Completion, Job, JobBody, JobControl, JobHandle, JobKind, JobOutcome};
use crate::sqlite::schema;
use crate::sqlite::{ConnRole, open_connection};
use crate::store::Engine;
use crate::tx::{ConnState, TransactionContext};
use crate::types::{Icn, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Started,
    Stopping,
    Stopped,
}

struct RunningJob {
    seq: u64,
    priority: Priority,
    control: Arc<JobControl>,
    interrupt: InterruptHandle,
}

struct QueueState {
    phase: Phase,
    queue: Vec<Job>,
    running: Vec<RunningJob>,
}

/// Queue state shared between submitters, handles, and workers.
pub(crate) struct QueueShared {
    state: Mutex<QueueState>,
    cond: Condvar,
    next_seq: AtomicU64,
}

impl QueueShared {
    pub(crate) fn new() -> Arc<QueueShared> {
        Arc::new(QueueShared {
            state: Mutex::new(QueueState {
                phase: Phase::NotStarted,
                queue: Vec::new(),
                running: Vec::new(),
            }),
            cond: Condvar::new(),
            next_seq: AtomicU64::new(1),
        })
    }

    /// Enqueues a job, or settles it with a queue-down error once the
    /// engine is on its way out. Any running job below the newcomer's
    /// priority is hurried so the queue gets to it sooner.
    pub(crate) fn submit(&self, job: Job) {
        {
            let mut state = self.state.lock();
            match state.phase {
                Phase::Stopping | Phase::Stopped => {}
                _ => {
                    let priority = job.priority;
                    state.queue.push(job);
                    for running in &state.running {
                        if running.priority < priority {
                            running.control.hurried.store(true, Ordering::Relaxed);
                        }
                    }
                    self.cond.notify_all();
                    return;
                }
            }
        }
        job.sink.fail(DbError::queue_down("job queue is shut down"));
    }

    /// Cancellation for a job that may still be queued. Queued jobs
    /// settle right here; a running one gets its current statement
    /// interrupted and fails inside the worker.
    pub(crate) fn job_cancelled(&self, seq: u64) {
        let queued = {
            let mut state = self.state.lock();
            match state.queue.iter().position(|job| job.seq == seq) {
                Some(idx) => Some(state.queue.remove(idx)),
                None => {
                    if let Some(running) = state.running.iter().find(|r| r.seq == seq) {
                        running.interrupt.interrupt();
                    }
                    None
                }
            }
        };
        if let Some(job) = queued {
            job.sink.fail(DbError::Cancelled);
        }
    }

    /// Bumps a queued job to interactive priority. A running job already
    /// sees the hurry flag through its control block.
    pub(crate) fn job_hurried(&self, seq: u64) {
        let mut state = self.state.lock();
        if let Some(job) = state.queue.iter_mut().find(|job| job.seq == seq) {
            if !job.priority.is_interactive() {
                job.priority = Priority::FOREGROUND;
            }
            self.cond.notify_all();
        }
    }

    fn request_stop(&self) {
        let drained: Vec<Job> = {
            let mut state = self.state.lock();
            state.phase = Phase::Stopping;
            for running in &state.running {
                running.control.hurried.store(true, Ordering::Relaxed);
            }
            std::mem::take(&mut state.queue)
        };
        self.cond.notify_all();
        for job in drained {
            job.sink.fail(DbError::queue_down("engine stopping"));
        }
    }

    fn register_running(
        &self,
        seq: u64,
        priority: Priority,
        control: &Arc<JobControl>,
        interrupt: InterruptHandle,
    ) {
        self.state.lock().running.push(RunningJob {
            seq,
            priority,
            control: Arc::clone(control),
            interrupt,
        });
    }

    fn unregister_running(&self, seq: u64) {
        self.state.lock().running.retain(|r| r.seq != seq);
    }

    fn stopping(&self) -> bool {
        matches!(self.state.lock().phase, Phase::Stopping | Phase::Stopped)
    }
}

/// Wraps a typed closure into a queue job plus the handle that observes
/// it. The closure's error settles the completion before the worker
/// rolls back, so the staged success value can never leak.
pub(crate) fn package<T, F>(
    shared: &Arc<QueueShared>,
    kind: JobKind,
    priority: Priority,
    f: F,
) -> (Job, JobHandle<T>)
where
    T: Send + 'static,
    F: FnOnce(&mut TransactionContext<'_>) -> DbResult<T> + Send + 'static,
{
    let completion = Completion::new();
    let control = JobControl::new();
    let seq = shared.next_seq.fetch_add(1, Ordering::Relaxed);
    let staging = Arc::clone(&completion);
    let seen = Arc::clone(&control);
    let body: JobBody = Box::new(move |ctx| match f(ctx) {
        Ok(value) => {
            staging.stage(Ok(value));
            JobOutcome::Ok
        }
        Err(err) => {
            if is_fatal(&err) {
                seen.mark_fatal();
            }
            let err = if seen.is_cancelled() { DbError::Cancelled } else { err };
            staging.fail(err);
            JobOutcome::Failed
        }
    });
    let job = Job {
        kind,
        priority,
        seq,
        control: Arc::clone(&control),
        body,
        sink: completion.clone(),
    };
    let handle = JobHandle {
        completion,
        control,
        seq,
        queue: Arc::downgrade(shared),
    };
    (job, handle)
}

/// Errors after which the connection cannot be trusted anymore.
fn is_fatal(err: &DbError) -> bool {
    match err {
        DbError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
            e.code,
            rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
        ),
        _ => false,
    }
}

fn best_index(queue: &[Job], accept: impl Fn(JobKind) -> bool) -> Option<usize> {
    queue
        .iter()
        .enumerate()
        .filter(|(_, job)| accept(job.kind))
        .max_by_key(|(_, job)| (job.priority, std::cmp::Reverse(job.seq)))
        .map(|(idx, _)| idx)
}

/// Owns the worker threads.
pub(crate) struct Scheduler {
    engine: Arc<Engine>,
    shared: Arc<QueueShared>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Scheduler {
    pub(crate) fn new(engine: Arc<Engine>) -> Scheduler {
        Scheduler {
            engine,
            shared: QueueShared::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<QueueShared> {
        &self.shared
    }

    /// Opens the connections and spawns the workers. Jobs submitted
    /// before this sit queued until the workers come up.
    pub(crate) fn start(&self) -> DbResult<()> {
        if self.shared.state.lock().phase != Phase::NotStarted {
            return Err(DbError::lifecycle("engine already started"));
        }
        let engine = &self.engine;
        let write_conn = open_connection(&engine.location, ConnRole::Write, &engine.config)?;
        engine
            .committed
            .store(schema::current_icn(&write_conn)?.raw(), Ordering::SeqCst);
        let use_read = engine.config.use_read_connection && !engine.location.is_memory();
        let read_conn = if use_read {
            Some(open_connection(&engine.location, ConnRole::Read, &engine.config)?)
        } else {
            None
        };
        // File stores get their own maintenance connection so ANALYZE
        // and vacuum passes never queue behind foreground writes.
        let hk_conn = if engine.location.is_memory() {
            None
        } else {
            Some(open_connection(&engine.location, ConnRole::Housekeeping, &engine.config)?)
        };
        {
            let mut state = self.shared.state.lock();
            if state.phase != Phase::NotStarted {
                return Err(DbError::lifecycle("engine already started"));
            }
            state.phase = Phase::Started;
        }
        engine.maintenance.state.lock().phase = Phase::Started;
        let mut workers = self.workers.lock();
        let serve_reads = read_conn.is_none();
        {
            let engine = Arc::clone(engine);
            let shared = Arc::clone(&self.shared);
            workers.push(
                std::thread::Builder::new()
                    .name("itemdb-write".into())
                    .spawn(move || write_worker(engine, shared, write_conn, serve_reads))?,
            );
        }
        if let Some(conn) = read_conn {
            let engine = Arc::clone(engine);
            let shared = Arc::clone(&self.shared);
            workers.push(
                std::thread::Builder::new()
                    .name("itemdb-read".into())
                    .spawn(move || read_worker(engine, shared, conn))?,
            );
        }
        if let Some(conn) = hk_conn {
            let shared = Arc::clone(&engine.maintenance);
            let engine = Arc::clone(engine);
            workers.push(
                std::thread::Builder::new()
                    .name("itemdb-housekeeping".into())
                    .spawn(move || housekeeping_worker(engine, shared, conn))?,
            );
        }
        tracing::info!(read_connection = use_read, "engine started");
        Ok(())
    }

    /// Fails everything still queued, hurries the running jobs, and
    /// joins the workers.
    pub(crate) fn stop(&self) {
        self.shared.request_stop();
        self.engine.maintenance.request_stop();
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.join();
        }
        self.shared.state.lock().phase = Phase::Stopped;
        self.engine.maintenance.state.lock().phase = Phase::Stopped;
        tracing::info!("engine stopped");
    }
}

// ---- write worker ----

fn write_worker(
    engine: Arc<Engine>,
    shared: Arc<QueueShared>,
    conn: rusqlite::Connection,
    serve_reads: bool,
) {
    let mut state = ConnState::new(conn);
    loop {
        let job = {
            let mut qs = shared.state.lock();
            loop {
                if let Some(idx) =
                    best_index(&qs.queue, |kind| kind == JobKind::Write || serve_reads)
                {
                    break Some(qs.queue.remove(idx));
                }
                if qs.phase == Phase::Stopping {
                    break None;
                }
                shared.cond.wait(&mut qs);
            }
        };
        let Some(job) = job else { break };
        let seq = job.seq;
        shared.register_running(seq, job.priority, &job.control, state.conn.get_interrupt_handle());
        let fatal = match job.kind {
            JobKind::Write => run_write_job(&engine, &shared, &mut state, job),
            JobKind::Read | JobKind::ReadCommit => {
                // Single-connection mode: reads borrow the write
                // connection, one snapshot per job.
                let mut local = None;
                let fatal = run_read_job(&engine, &mut state, &mut local, job);
                close_stacked(&mut state, &mut local);
                fatal
            }
        };
        shared.unregister_running(seq);
        if fatal {
            reincarnate(&engine, &shared, &mut state, ConnRole::Write);
        }
    }
}

fn run_write_job(
    engine: &Arc<Engine>,
    shared: &Arc<QueueShared>,
    state: &mut ConnState,
    job: Job,
) -> bool {
    let Job { control, body, sink, .. } = job;
    if control.is_cancelled() {
        sink.fail(DbError::Cancelled);
        return false;
    }
    if let Err(err) = state.conn.execute_batch("BEGIN IMMEDIATE") {
        let err = DbError::from(err);
        let fatal = is_fatal(&err);
        sink.fail(err);
        return fatal;
    }
    match write_tx(engine, shared, state, &control, body) {
        Ok(()) => {
            sink.seal();
            false
        }
        Err(err) => {
            rollback_quietly(&state.conn);
            state.caches.rollback_tx();
            let fatal = is_fatal(&err) || control.saw_fatal();
            if control.is_cancelled() {
                sink.fail(DbError::Cancelled);
            } else {
                sink.fail(err);
            }
            fatal
        }
    }
}

/// Everything between `BEGIN IMMEDIATE` and a successful publish. Any
/// error bubbles to the caller, which rolls back.
fn write_tx(
    engine: &Arc<Engine>,
    shared: &Arc<QueueShared>,
    state: &mut ConnState,
    control: &JobControl,
    body: JobBody,
) -> DbResult<()> {
    let icn = schema::write_icn(&state.conn)?;
    state.tables.refresh(&state.conn)?;
    state.caches.identity.revalidate(Icn(icn.raw() - 1), &engine.ring);
    state.caches.begin_tx();
    let mut ctx = TransactionContext::new(engine, state, control, JobKind::Write, icn);
    match catch_unwind(AssertUnwindSafe(|| body(&mut ctx))) {
        Ok(JobOutcome::Ok) => {}
        // The body settled its own completion before returning.
        Ok(JobOutcome::Failed) => return Err(DbError::lifecycle("write rolled back")),
        Err(_) => {
            tracing::warn!("write job panicked, rolling back");
            return Err(DbError::lifecycle("write job panicked"));
        }
    }
    if ctx.changes().map_or(true, |c| c.is_empty()) {
        // Nothing touched, so the commit does not consume the stamp.
        drop(ctx);
        state.conn.execute_batch("COMMIT")?;
        state.caches.commit_tx(Icn(icn.raw() - 1));
        return Ok(());
    }
    let triggers: Vec<_> = engine.triggers.read().clone();
    for trigger in &triggers {
        let touched = ctx.changes().map(|c| c.touched_sorted()).unwrap_or_default();
        trigger.on_changed(&mut ctx, &touched)?;
    }
    ctx.flush_propagation()?;
    let touched = ctx.changes().map(|c| c.touched_sorted()).unwrap_or_default();
    drop(ctx);
    schema::finish_write(&state.conn, icn, &touched)?;
    state.conn.execute_batch("COMMIT")?;
    state.caches.commit_tx(icn);
    let count = touched.len();
    engine.ring.publish(icn, Arc::new(touched));
    engine.committed.store(icn.raw(), Ordering::SeqCst);
    tracing::debug!(%icn, touched = count, "committed write");
    if engine.live.request_pass() {
        let runner = Arc::clone(engine);
        // Live passes materialize filters; their transaction has to
        // commit or that TEMP schema disappears with the job.
        let (pass, _) =
            package::<(), _>(shared, JobKind::ReadCommit, Priority::FOREGROUND, move |ctx| {
                runner.live.run_pass(ctx)
            });
        shared.submit(pass);
    }
    if engine.housekeeping.note_commit(icn) {
        submit_housekeeping_pass(engine, shared);
    }
    Ok(())
}

/// Routes a maintenance pass to its queue: file stores have a dedicated
/// housekeeping connection, in-memory stores share the single writer.
pub(crate) fn submit_housekeeping_pass(engine: &Arc<Engine>, main: &Arc<QueueShared>) {
    let target = if engine.location.is_memory() { main } else { &engine.maintenance };
    let runner = Arc::clone(engine);
    let (pass, _) = package::<(), _>(target, JobKind::Write, Priority::HOUSEKEEPING, move |ctx| {
        runner.housekeeping.run_pass(ctx)
    });
    target.submit(pass);
}

// ---- read worker ----

struct StackedRead {
    icn: Icn,
    since: Instant,
}

fn read_worker(engine: Arc<Engine>, shared: Arc<QueueShared>, conn: rusqlite::Connection) {
    let idle_max = Duration::from_millis(engine.config.read_rollback_max_idle_ms);
    let mut state = ConnState::new(conn);
    let mut stacked: Option<StackedRead> = None;
    loop {
        enum Wake {
            Job(Job),
            Stop,
            IdleTimeout,
        }
        let wake = {
            let mut qs = shared.state.lock();
            loop {
                if let Some(idx) = best_index(&qs.queue, |kind| {
                    matches!(kind, JobKind::Read | JobKind::ReadCommit)
                }) {
                    break Wake::Job(qs.queue.remove(idx));
                }
                if qs.phase == Phase::Stopping {
                    break Wake::Stop;
                }
                match stacked.as_ref().map(|s| s.since + idle_max) {
                    Some(deadline) => {
                        if shared.cond.wait_until(&mut qs, deadline).timed_out() {
                            break Wake::IdleTimeout;
                        }
                    }
                    None => shared.cond.wait(&mut qs),
                }
            }
        };
        match wake {
            Wake::Job(job) => {
                let seq = job.seq;
                shared.register_running(
                    seq,
                    job.priority,
                    &job.control,
                    state.conn.get_interrupt_handle(),
                );
                let fatal = run_read_job(&engine, &mut state, &mut stacked, job);
                shared.unregister_running(seq);
                if fatal {
                    close_stacked(&mut state, &mut stacked);
                    reincarnate(&engine, &shared, &mut state, ConnRole::Read);
                }
            }
            Wake::Stop => break,
            Wake::IdleTimeout => close_stacked(&mut state, &mut stacked),
        }
    }
    close_stacked(&mut state, &mut stacked);
}

fn run_read_job(
    engine: &Arc<Engine>,
    state: &mut ConnState,
    stacked: &mut Option<StackedRead>,
    job: Job,
) -> bool {
    let Job { kind, control, body, sink, .. } = job;
    if control.is_cancelled() {
        sink.fail(DbError::Cancelled);
        return false;
    }
    if kind == JobKind::ReadCommit {
        // Committing reads never share the rollback stack.
        close_stacked(state, stacked);
    }
    let icn = match ensure_read_tx(engine, state, stacked) {
        Ok(icn) => icn,
        Err(err) => {
            let fatal = is_fatal(&err);
            sink.fail(err);
            return fatal;
        }
    };
    let mut ctx = TransactionContext::new(engine, state, &control, kind, icn);
    let outcome = catch_unwind(AssertUnwindSafe(|| body(&mut ctx)));
    // A body that built or refreshed TEMP filter tables needs COMMIT;
    // rolling back would destroy them while the tree still lists them.
    let commit = ctx.commits_read_tx();
    drop(ctx);
    match outcome {
        Ok(JobOutcome::Ok) if commit => {
            if let Err(err) = commit_stacked(state, stacked) {
                rollback_quietly(&state.conn);
                state.filter = None;
                let fatal = is_fatal(&err);
                sink.fail(err);
                return fatal || control.saw_fatal();
            }
            sink.seal();
        }
        Ok(JobOutcome::Ok) => sink.seal(),
        Ok(JobOutcome::Failed) => {
            if commit {
                // Half-built filter tables roll back with the stack.
                close_stacked(state, stacked);
                state.filter = None;
            }
        }
        Err(_) => {
            tracing::warn!("read job panicked");
            sink.fail(DbError::lifecycle("read job panicked"));
            close_stacked(state, stacked);
            if commit {
                state.filter = None;
            }
        }
    }
    if let Some(s) = stacked.as_mut() {
        s.since = Instant::now();
    }
    control.saw_fatal()
}

/// Reuses the stacked snapshot when it still matches the committed
/// state, otherwise opens a fresh deferred transaction.
fn ensure_read_tx(
    engine: &Engine,
    state: &mut ConnState,
    stacked: &mut Option<StackedRead>,
) -> DbResult<Icn> {
    if let Some(s) = stacked.as_ref() {
        if engine.committed.load(Ordering::SeqCst) > s.icn.raw() {
            close_stacked(state, stacked);
        }
    }
    if let Some(s) = stacked.as_ref() {
        return Ok(s.icn);
    }
    state.conn.execute_batch("BEGIN DEFERRED")?;
    // The snapshot number comes from SQL inside the transaction, so
    // cache validation targets exactly what this snapshot sees.
    let opened = schema::current_icn(&state.conn)
        .and_then(|icn| state.tables.refresh(&state.conn).map(|()| icn));
    let icn = match opened {
        Ok(icn) => icn,
        Err(err) => {
            rollback_quietly(&state.conn);
            return Err(err);
        }
    };
    state.caches.identity.revalidate(icn, &engine.ring);
    *stacked = Some(StackedRead { icn, since: Instant::now() });
    Ok(icn)
}

fn close_stacked(state: &mut ConnState, stacked: &mut Option<StackedRead>) {
    if stacked.take().is_some() {
        rollback_quietly(&state.conn);
    }
}

fn commit_stacked(state: &mut ConnState, stacked: &mut Option<StackedRead>) -> DbResult<()> {
    stacked.take();
    state.conn.execute_batch("COMMIT")?;
    Ok(())
}

fn rollback_quietly(conn: &rusqlite::Connection) {
    if let Err(err) = conn.execute_batch("ROLLBACK") {
        tracing::warn!(%err, "rollback failed");
    }
}

// ---- housekeeping worker ----

fn housekeeping_worker(engine: Arc<Engine>, shared: Arc<QueueShared>, conn: rusqlite::Connection) {
    let mut state = ConnState::new(conn);
    loop {
        let job = {
            let mut qs = shared.state.lock();
            loop {
                if let Some(idx) = best_index(&qs.queue, |_| true) {
                    break Some(qs.queue.remove(idx));
                }
                if qs.phase == Phase::Stopping {
                    break None;
                }
                shared.cond.wait(&mut qs);
            }
        };
        let Some(job) = job else { break };
        let seq = job.seq;
        shared.register_running(seq, job.priority, &job.control, state.conn.get_interrupt_handle());
        let fatal = run_maintenance_job(&engine, &mut state, job);
        shared.unregister_running(seq);
        if fatal {
            reincarnate(&engine, &shared, &mut state, ConnRole::Housekeeping);
        }
    }
}

/// Runs a maintenance body in autocommit, so each statement takes and
/// releases the write lock on its own instead of holding it for a whole
/// pass.
fn run_maintenance_job(engine: &Arc<Engine>, state: &mut ConnState, job: Job) -> bool {
    let Job { control, body, sink, .. } = job;
    if control.is_cancelled() {
        sink.fail(DbError::Cancelled);
        return false;
    }
    if let Err(err) = state.tables.refresh(&state.conn) {
        let fatal = is_fatal(&err);
        sink.fail(err);
        return fatal;
    }
    let icn = Icn(engine.committed.load(Ordering::SeqCst) + 1);
    let mut ctx = TransactionContext::new(engine, state, &control, JobKind::Write, icn);
    let outcome = catch_unwind(AssertUnwindSafe(|| body(&mut ctx)));
    drop(ctx);
    match outcome {
        Ok(JobOutcome::Ok) => sink.seal(),
        Ok(JobOutcome::Failed) => {}
        Err(_) => {
            tracing::warn!("maintenance job panicked");
            sink.fail(DbError::lifecycle("maintenance job panicked"));
        }
    }
    control.saw_fatal()
}

/// Replaces a poisoned connection after a corruption-class error. File
/// databases only; an in-memory store has nothing to reopen.
fn reincarnate(engine: &Engine, shared: &QueueShared, state: &mut ConnState, role: ConnRole) {
    if engine.location.is_memory() {
        // The connection stays, so cached state derived from it cannot
        // be trusted anymore.
        tracing::error!("fatal error on in-memory database, keeping connection");
        state.caches.invalidate_all();
        state.filter = None;
        return;
    }
    tracing::error!(?role, "fatal database error, reopening connection");
    loop {
        if shared.stopping() {
            return;
        }
        std::thread::sleep(Duration::from_millis(engine.config.reincarnate_delay_ms));
        match open_connection(&engine.location, role, &engine.config) {
            Ok(conn) => {
                *state = ConnState::new(conn);
                tracing::info!(?role, "connection reopened");
                return;
            }
            Err(err) => tracing::error!(%err, "reopen failed, retrying"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_job(
        shared: &Arc<QueueShared>,
        kind: JobKind,
        priority: Priority,
    ) -> (Job, JobHandle<()>) {
        package(shared, kind, priority, |_| Ok(()))
    }

    #[test]
    fn selection_prefers_priority_then_submission_order() {
        let shared = QueueShared::new();
        let (a, _ha) = noop_job(&shared, JobKind::Write, Priority::BACKGROUND);
        let (b, _hb) = noop_job(&shared, JobKind::Write, Priority::FOREGROUND);
        let (c, _hc) = noop_job(&shared, JobKind::Write, Priority::FOREGROUND);
        let b_seq = b.seq;
        let a_seq = a.seq;
        shared.submit(a);
        shared.submit(b);
        shared.submit(c);

        let mut qs = shared.state.lock();
        let first = best_index(&qs.queue, |_| true).unwrap();
        assert_eq!(qs.queue[first].seq, b_seq);
        qs.queue.remove(first);
        let second = best_index(&qs.queue, |_| true).unwrap();
        assert_ne!(qs.queue[second].seq, a_seq, "background job must come last");
    }

    #[test]
    fn kind_filter_skips_foreign_jobs() {
        let shared = QueueShared::new();
        let (read, _hr) = noop_job(&shared, JobKind::Read, Priority::FOREGROUND);
        shared.submit(read);
        let qs = shared.state.lock();
        assert!(best_index(&qs.queue, |kind| kind == JobKind::Write).is_none());
        assert!(best_index(&qs.queue, |kind| kind == JobKind::Read).is_some());
    }

    #[test]
    fn submit_after_stop_fails_queue_down() {
        let shared = QueueShared::new();
        shared.request_stop();
        let (job, handle) = noop_job(&shared, JobKind::Write, Priority::FOREGROUND);
        shared.submit(job);
        let err = handle.wait().unwrap_err();
        assert_eq!(err.code().as_str(), "queue_down");
    }

    #[test]
    fn stop_drains_queued_jobs() {
        let shared = QueueShared::new();
        let (job, handle) = noop_job(&shared, JobKind::Write, Priority::FOREGROUND);
        shared.submit(job);
        shared.request_stop();
        assert_eq!(handle.wait().unwrap_err().code().as_str(), "queue_down");
    }

    #[test]
    fn cancel_settles_queued_job() {
        let shared = QueueShared::new();
        let (job, handle) = noop_job(&shared, JobKind::Write, Priority::FOREGROUND);
        shared.submit(job);
        handle.cancel();
        assert!(shared.state.lock().queue.is_empty());
        assert!(handle.wait().unwrap_err().is_cancelled());
    }

    #[test]
    fn hurry_bumps_queued_priority() {
        let shared = QueueShared::new();
        let (job, handle) = noop_job(&shared, JobKind::Write, Priority::HOUSEKEEPING);
        shared.submit(job);
        handle.hurry();
        let qs = shared.state.lock();
        assert!(qs.queue[0].priority.is_interactive());
    }

    #[test]
    fn arrival_above_running_priority_hurries_it() {
        let shared = QueueShared::new();
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let control = JobControl::new();
        shared.register_running(1, Priority::BACKGROUND, &control, conn.get_interrupt_handle());

        let (job, _h) = noop_job(&shared, JobKind::Write, Priority::FOREGROUND);
        shared.submit(job);
        assert!(control.is_hurried());
    }

    #[test]
    fn arrival_at_or_below_running_priority_leaves_it_alone() {
        let shared = QueueShared::new();
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let control = JobControl::new();
        shared.register_running(1, Priority::FOREGROUND, &control, conn.get_interrupt_handle());

        let (equal, _h1) = noop_job(&shared, JobKind::Write, Priority::FOREGROUND);
        shared.submit(equal);
        let (below, _h2) = noop_job(&shared, JobKind::Read, Priority::BACKGROUND);
        shared.submit(below);
        assert!(!control.is_hurried());
    }

    #[test]
    fn fatal_classification_matches_corruption_only() {
        let corrupt = DbError::from(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CORRUPT),
            None,
        ));
        assert!(is_fatal(&corrupt));
        assert!(!is_fatal(&DbError::Cancelled));
        assert!(!is_fatal(&DbError::lifecycle("x")));
    }
}
