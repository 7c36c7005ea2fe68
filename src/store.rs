//! The store facade and the shared engine behind it.
//!
//! [`ItemStore`] is what embedders hold: it owns the scheduler, walks
//! the lifecycle, and exposes job submission, live queries, triggers,
//! and maintenance. The [`Engine`] underneath is the state every worker
//! shares: location, config, registries, the change ring, and the
//! committed high-water mark.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::attr::{AttrHandle, Attribute, AttributeRegistry};
use crate::cache::RecentChanges;
use crate::config::ItemdbConfig;
use crate::error::{DbError, DbResult};
use crate::housekeeping::Housekeeping;
use crate::live::{LiveListener, LiveManager, LiveQueryHandle};
use crate::query::Predicate;
use crate::sqlite::DbLocation;
use crate::sqlite::job::{ExecGate, JobHandle, JobKind};
use crate::sqlite::queue::{QueueShared, Scheduler, package, submit_housekeeping_pass};
use crate::trigger::{TriggerDef, TriggerEntry};
use crate::tx::TransactionContext;
use crate::types::{Icn, ItemId, Priority};
use crate::value::{CodecRegistry, Value, ValueCodec};

/// State shared by the workers, the caches, and the facade.
pub(crate) struct Engine {
    pub(crate) location: DbLocation,
    pub(crate) config: ItemdbConfig,
    pub(crate) attrs: AttributeRegistry,
    pub(crate) codecs: RwLock<CodecRegistry>,
    pub(crate) ring: RecentChanges,
    /// ICN of the latest committed write, for snapshot staleness checks.
    pub(crate) committed: AtomicI64,
    pub(crate) triggers: RwLock<Vec<Arc<TriggerEntry>>>,
    pub(crate) live: LiveManager,
    pub(crate) housekeeping: Housekeeping,
    /// Queue for the housekeeping worker. File stores only; in-memory
    /// stores run maintenance on the main queue.
    pub(crate) maintenance: Arc<QueueShared>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Starting,
    Started,
    Stopped,
    /// Startup failed; the store is unusable and stays that way.
    Failed,
}

struct Migration {
    name: String,
    apply: Box<dyn FnOnce(&mut TransactionContext<'_>) -> DbResult<()> + Send>,
}

/// A schema-less item store over one SQLite database.
///
/// Configure, then [`start`], then submit jobs; [`stop`] drains the
/// queue and joins the workers. A store that failed to start never
/// accepts work.
///
/// [`start`]: ItemStore::start
/// [`stop`]: ItemStore::stop
pub struct ItemStore {
    engine: Arc<Engine>,
    scheduler: Scheduler,
    phase: Mutex<Phase>,
    migrations: Mutex<Vec<Migration>>,
    pending_triggers: Mutex<Vec<Arc<TriggerEntry>>>,
}

impl ItemStore {
    pub fn open(location: DbLocation, config: ItemdbConfig) -> ItemStore {
        let config = config.sanitized();
        let engine = Arc::new(Engine {
            attrs: AttributeRegistry::new(),
            codecs: RwLock::new(CodecRegistry::standard()),
            ring: RecentChanges::new(config.recent_changes_window),
            committed: AtomicI64::new(0),
            triggers: RwLock::new(Vec::new()),
            live: LiveManager::new(),
            housekeeping: Housekeeping::new(&config),
            maintenance: QueueShared::new(),
            location,
            config,
        });
        ItemStore {
            scheduler: Scheduler::new(Arc::clone(&engine)),
            engine,
            phase: Mutex::new(Phase::NotStarted),
            migrations: Mutex::new(Vec::new()),
            pending_triggers: Mutex::new(Vec::new()),
        }
    }

    pub fn in_memory() -> ItemStore {
        ItemStore::open(DbLocation::Memory, ItemdbConfig::default())
    }

    // ---- pre-start configuration ----

    /// Registers an attribute definition. Allowed at any time; handles
    /// stay valid for the life of the store.
    pub fn register_attribute(&self, def: Attribute) -> DbResult<AttrHandle> {
        self.engine.attrs.register(def)
    }

    /// Replaces the codec for the codec's scalar kind. Codecs shape what
    /// is on disk, so they are fixed once the store starts.
    pub fn register_codec(&self, codec: Arc<dyn ValueCodec>) -> DbResult<()> {
        if *self.phase.lock() != Phase::NotStarted {
            return Err(DbError::lifecycle("codecs must be registered before start"));
        }
        self.engine.codecs.write().put(codec);
        Ok(())
    }

    /// Queues a migration to run inside the first write transaction on
    /// start, in registration order. Any failure fails startup.
    pub fn add_migration(
        &self,
        name: impl Into<String>,
        apply: impl FnOnce(&mut TransactionContext<'_>) -> DbResult<()> + Send + 'static,
    ) -> DbResult<()> {
        if *self.phase.lock() != Phase::NotStarted {
            return Err(DbError::lifecycle("migrations must be added before start"));
        }
        self.migrations.lock().push(Migration {
            name: name.into(),
            apply: Box::new(apply),
        });
        Ok(())
    }

    /// Installs a trigger. Before start it is queued and installed with
    /// the migrations; after start it is installed through its own write
    /// job, which this call waits for.
    pub fn register_trigger(&self, def: TriggerDef) -> DbResult<()> {
        let entry = TriggerEntry::from_def(def);
        match *self.phase.lock() {
            Phase::NotStarted => {
                self.pending_triggers.lock().push(entry);
                return Ok(());
            }
            Phase::Started => {}
            _ => return Err(DbError::lifecycle("store is not running")),
        }
        let engine = Arc::clone(&self.engine);
        let installing = Arc::clone(&entry);
        let handle = self.submit_write(Priority::FOREGROUND, move |ctx| {
            installing.install(ctx)?;
            tracing::debug!(trigger = installing.name(), "trigger installed");
            engine.triggers.write().push(Arc::clone(&installing));
            Ok(())
        })?;
        handle.wait()
    }

    // ---- lifecycle ----

    /// Opens the connections, spawns the workers, and runs queued
    /// migrations and trigger installs in one write transaction. A
    /// failure here is terminal for this store.
    pub fn start(&self) -> DbResult<()> {
        {
            let mut phase = self.phase.lock();
            match *phase {
                Phase::NotStarted => *phase = Phase::Starting,
                Phase::Failed => return Err(DbError::lifecycle("store failed to start")),
                _ => return Err(DbError::lifecycle("store already started")),
            }
        }
        if let Err(err) = self.scheduler.start() {
            *self.phase.lock() = Phase::Failed;
            return Err(err);
        }
        let migrations = std::mem::take(&mut *self.migrations.lock());
        let triggers = std::mem::take(&mut *self.pending_triggers.lock());
        if !migrations.is_empty() || !triggers.is_empty() {
            let installing = triggers.clone();
            let (job, handle) = package::<(), _>(
                self.scheduler.shared(),
                JobKind::Write,
                Priority::FOREGROUND,
                move |ctx| {
                    for migration in migrations {
                        let name = migration.name;
                        tracing::info!(migration = %name, "running migration");
                        (migration.apply)(ctx).map_err(|source| DbError::Migration {
                            name,
                            source: Box::new(source),
                        })?;
                    }
                    for trigger in &installing {
                        trigger.install(ctx)?;
                    }
                    Ok(())
                },
            );
            self.scheduler.shared().submit(job);
            if let Err(err) = handle.wait() {
                tracing::error!(error = %err, "startup transaction failed");
                *self.phase.lock() = Phase::Failed;
                self.scheduler.stop();
                return Err(err);
            }
            self.engine.triggers.write().extend(triggers);
        }
        *self.phase.lock() = Phase::Started;
        Ok(())
    }

    /// Fails queued jobs, hurries the running ones, and joins the
    /// workers. Idempotent.
    pub fn stop(&self) {
        {
            let mut phase = self.phase.lock();
            match *phase {
                Phase::Started | Phase::Starting => *phase = Phase::Stopped,
                _ => return,
            }
        }
        self.scheduler.stop();
    }

    fn ensure_started(&self) -> DbResult<()> {
        match *self.phase.lock() {
            Phase::Started => Ok(()),
            Phase::NotStarted | Phase::Starting => {
                Err(DbError::lifecycle("store is not started yet"))
            }
            Phase::Stopped => Err(DbError::lifecycle("store is stopped")),
            Phase::Failed => Err(DbError::lifecycle("store failed to start")),
        }
    }

    // ---- job submission ----

    pub fn submit_read<T, F>(&self, priority: Priority, f: F) -> DbResult<JobHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut TransactionContext<'_>) -> DbResult<T> + Send + 'static,
    {
        self.ensure_started()?;
        let (job, handle) = package(self.scheduler.shared(), JobKind::Read, priority, f);
        self.scheduler.shared().submit(job);
        Ok(handle)
    }

    pub fn submit_write<T, F>(&self, priority: Priority, f: F) -> DbResult<JobHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut TransactionContext<'_>) -> DbResult<T> + Send + 'static,
    {
        self.ensure_started()?;
        let (job, handle) = package(self.scheduler.shared(), JobKind::Write, priority, f);
        self.scheduler.shared().submit(job);
        Ok(handle)
    }

    /// Runs a read job at foreground priority and waits for it.
    pub fn read<T, F>(&self, f: F) -> DbResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut TransactionContext<'_>) -> DbResult<T> + Send + 'static,
    {
        self.submit_read(Priority::FOREGROUND, f)?.wait()
    }

    /// Runs a write job at foreground priority and waits for it.
    pub fn write<T, F>(&self, f: F) -> DbResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut TransactionContext<'_>) -> DbResult<T> + Send + 'static,
    {
        self.submit_write(Priority::FOREGROUND, f)?.wait()
    }

    // ---- live queries ----

    /// Subscribes a listener to a predicate's result set. The listener
    /// gets a snapshot first, then one notification per refresh pass for
    /// as long as the returned handle lives.
    pub fn subscribe(
        &self,
        predicate: Predicate,
        gate: ExecGate,
        listener: Arc<dyn LiveListener>,
    ) -> DbResult<LiveQueryHandle> {
        self.ensure_started()?;
        let handle = self.engine.live.subscribe(&self.engine, predicate, gate, listener)?;
        if self.engine.live.request_pass() {
            let runner = Arc::clone(&self.engine);
            // The pass may materialize filters, so its transaction must
            // commit for the TEMP tables to survive.
            let (job, _) = package::<(), _>(
                self.scheduler.shared(),
                JobKind::ReadCommit,
                Priority::FOREGROUND,
                move |ctx| runner.live.run_pass(ctx),
            );
            self.scheduler.shared().submit(job);
        }
        Ok(handle)
    }

    // ---- maintenance ----

    /// Opts maintenance passes in or out. Commits are counted even while
    /// disabled, so enabling with a backlog schedules a pass right away.
    pub fn set_housekeeping_allowed(&self, allowed: bool) -> DbResult<()> {
        self.ensure_started()?;
        let icn = self.current_icn();
        if self.engine.housekeeping.set_allowed(allowed, icn) {
            submit_housekeeping_pass(&self.engine, self.scheduler.shared());
        }
        Ok(())
    }

    /// Maintenance passes completed since start.
    pub fn housekeeping_passes(&self) -> u64 {
        self.engine.housekeeping.passes()
    }

    // ---- convenience ----

    /// ICN of the latest committed write.
    pub fn current_icn(&self) -> Icn {
        Icn(self.engine.committed.load(Ordering::SeqCst))
    }

    /// Looks up the item backing an identified object, if it was ever
    /// materialized.
    pub fn find_materialized(&self, id: impl Into<String>) -> DbResult<Option<ItemId>> {
        let id = id.into();
        self.read(move |ctx| ctx.resolve(&id))
    }

    /// Exports every item with every registered attribute's values, as
    /// one consistent snapshot. Attributes never written are omitted.
    pub fn dump(&self) -> DbResult<StoreDump> {
        self.read(|ctx| {
            let icn = ctx.icn();
            let items = ctx.query(&Predicate::All)?;
            let mut dump: Vec<ItemDump> = items
                .iter()
                .map(|&item| ItemDump { item, values: Vec::new() })
                .collect();
            for n in 0..ctx.engine.attrs.len() {
                let handle = AttrHandle(n as u32);
                let Some(def) = ctx.engine.attrs.definition(handle) else { continue };
                let columns = ctx.load_attribute(handle, &items)?;
                for (slot, values) in dump.iter_mut().zip(columns) {
                    if !values.is_empty() {
                        slot.values.push((def.id.clone(), values));
                    }
                }
            }
            dump.retain(|slot| !slot.values.is_empty());
            Ok(StoreDump { icn, items: dump })
        })
    }
}

impl Drop for ItemStore {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Snapshot export of the whole store.
#[derive(Debug, Clone)]
pub struct StoreDump {
    pub icn: Icn,
    pub items: Vec<ItemDump>,
}

/// One item's attribute values, keyed by attribute id.
#[derive(Debug, Clone)]
pub struct ItemDump {
    pub item: ItemId,
    pub values: Vec<(String, Vec<Value>)>,
}
