//! Transaction contexts.
//!
//! A [`TransactionContext`] is the only way job closures touch the
//! database. It is built by the worker around its own connection for
//! the duration of one job and reclaimed afterwards, so references to
//! it cannot outlive the transaction. Reads see one SQLite snapshot;
//! writes additionally journal every touched item and run change
//! propagation before the commit stamp.

pub(crate) mod changes;

use rusqlite::params;
use std::sync::Arc;

use crate::attr::adapter::{AttributeAdapter, StorageCtx, bind_value};
use crate::attr::tables::{self, TableCache};
use crate::attr::{
    AttrInfo, Attribute, IdentifiedObject, SYS_COMPOSITION, SYS_ID, SYS_ID_ITEM, SYS_KIND,
    SYS_PROPAGATING,
};
use crate::cache::attr_defs::AttrDefCache;
use crate::cache::identity::IdentityCache;
use crate::cache::value_index::ValueIndexCache;
use crate::error::{DbError, DbResult};
use crate::filter::FilterTree;
use crate::query::Predicate;
use crate::sqlite::job::{JobControl, JobKind};
use crate::sqlite::schema;
use crate::sqlite::select::SqlBuilder;
use crate::store::Engine;
use crate::types::{Icn, ItemId, ItemSet};
use crate::value::Value;

use changes::ChangeSet;

/// Caches owned by one connection, kept coherent by the worker across
/// transactions.
pub(crate) struct CacheSet {
    pub(crate) identity: IdentityCache,
    pub(crate) values: ValueIndexCache,
    pub(crate) defs: AttrDefCache,
}

impl CacheSet {
    pub(crate) fn new() -> CacheSet {
        CacheSet {
            identity: IdentityCache::new(),
            values: ValueIndexCache::new(),
            defs: AttrDefCache::new(),
        }
    }

    pub(crate) fn begin_tx(&mut self) {
        self.identity.begin_tx();
        self.values.begin_tx();
        self.defs.begin_tx();
    }

    pub(crate) fn commit_tx(&mut self, stamped: Icn) {
        self.identity.commit_tx(stamped);
        self.values.commit_tx(stamped);
        self.defs.commit_tx(stamped);
    }

    pub(crate) fn rollback_tx(&mut self) {
        self.identity.rollback_tx();
        self.values.rollback_tx();
        self.defs.rollback_tx();
    }

    pub(crate) fn invalidate_all(&mut self) {
        self.identity.invalidate_all();
        self.values.invalidate_all();
        self.defs.invalidate_all();
    }
}

/// Everything one worker owns around its connection.
pub(crate) struct ConnState {
    pub(crate) conn: rusqlite::Connection,
    pub(crate) tables: TableCache,
    pub(crate) caches: CacheSet,
    pub(crate) filter: Option<FilterTree>,
    /// Highest item id handed out by this process, zero until seeded.
    pub(crate) next_item_hint: i64,
}

impl ConnState {
    pub(crate) fn new(conn: rusqlite::Connection) -> ConnState {
        ConnState {
            conn,
            tables: TableCache::new(),
            caches: CacheSet::new(),
            filter: None,
            next_item_hint: 0,
        }
    }
}

/// Scoped capability for one transaction. Job closures receive an
/// exclusive reference and everything on it checks the transaction is
/// still the right kind and still wanted.
pub struct TransactionContext<'a> {
    pub(crate) engine: &'a Engine,
    pub(crate) state: &'a mut ConnState,
    control: &'a JobControl,
    kind: JobKind,
    icn: Icn,
    changes: Option<ChangeSet>,
    values_synced: bool,
    /// A read body wrote TEMP schema (filter tables); its transaction
    /// must commit instead of rolling back or that work vanishes.
    temp_writes: bool,
}

impl<'a> TransactionContext<'a> {
    pub(crate) fn new(
        engine: &'a Engine,
        state: &'a mut ConnState,
        control: &'a JobControl,
        kind: JobKind,
        icn: Icn,
    ) -> TransactionContext<'a> {
        let changes = match kind {
            JobKind::Write => Some(ChangeSet::new()),
            JobKind::Read | JobKind::ReadCommit => None,
        };
        TransactionContext {
            engine,
            state,
            control,
            kind,
            icn,
            changes,
            values_synced: false,
            temp_writes: false,
        }
    }

    /// The change number this transaction reads at; for writes, the
    /// number the commit will stamp.
    pub fn icn(&self) -> Icn {
        self.icn
    }

    pub fn is_write(&self) -> bool {
        self.kind == JobKind::Write
    }

    /// Fails once the job was cancelled. Long loops should call this
    /// between steps so cancellation takes effect mid-job.
    pub fn ensure_alive(&self) -> DbResult<()> {
        if self.control.is_cancelled() {
            return Err(DbError::Cancelled);
        }
        Ok(())
    }

    /// Whether someone asked this job to wrap up early. Cooperative:
    /// bulk work should stop at the next clean point.
    pub fn hurried(&self) -> bool {
        self.control.is_hurried()
    }

    fn require_write(&self) -> DbResult<()> {
        if self.kind != JobKind::Write {
            return Err(DbError::lifecycle("write operation inside a read job"));
        }
        Ok(())
    }

    /// Marks that this transaction changed TEMP schema the connection
    /// keeps across jobs.
    pub(crate) fn note_temp_write(&mut self) {
        self.temp_writes = true;
    }

    /// Whether the worker must end this read transaction with COMMIT.
    pub(crate) fn commits_read_tx(&self) -> bool {
        matches!(self.kind, JobKind::ReadCommit) || self.temp_writes
    }

    // ---- identified objects ----

    /// Resolves a string id to its backing item without materializing.
    pub fn resolve(&mut self, id: &str) -> DbResult<Option<ItemId>> {
        if let Some(cached) = self.state.caches.identity.get(id) {
            return Ok(cached);
        }
        let sys_id = self.engine.attrs.require(SYS_ID)?;
        let Some(table) = self.state.tables.lookup(&self.state.conn, &sys_id.table)? else {
            return Ok(None);
        };
        let sql = format!(
            "SELECT item FROM \"{table}\" WHERE attr = ?1 AND value = ?2 ORDER BY item LIMIT 1"
        );
        let mut stmt = self.state.conn.prepare_cached(&sql)?;
        let mut rows = stmt.query(params![SYS_ID_ITEM.raw(), id])?;
        match rows.next()? {
            Some(row) => {
                let item = ItemId(row.get(0)?);
                drop(rows);
                self.state.caches.identity.record(id.to_owned(), item);
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    /// Resolves an identified object, creating and initializing its
    /// backing item on first use.
    pub fn materialize(&mut self, object: &IdentifiedObject) -> DbResult<ItemId> {
        self.require_write()?;
        if let Some(item) = self.resolve(object.id())? {
            return Ok(item);
        }
        let item = self.next_item()?;
        self.write_value(item, SYS_ID, Some(&Value::Str(object.id().to_owned())))?;
        // Repeated entries for one collection attribute accumulate into a
        // single write.
        let mut grouped: Vec<(crate::attr::AttrHandle, Vec<Value>)> = Vec::new();
        for (attr, value) in object.init_values() {
            match grouped.iter_mut().find(|(known, _)| known == attr) {
                Some((_, values)) => values.push(value.clone()),
                None => grouped.push((*attr, vec![value.clone()])),
            }
        }
        for (attr, values) in grouped {
            self.write_values(item, attr, &values)?;
        }
        tracing::debug!(id = %object.id(), %item, "materialized identified object");
        Ok(item)
    }

    /// Allocates a fresh item id. The item counts as changed so it gets
    /// stamped at commit even if nothing is written to it.
    pub fn next_item(&mut self) -> DbResult<ItemId> {
        self.require_write()?;
        if self.state.next_item_hint == 0 {
            let stamped = schema::max_stamped_item(&self.state.conn)?;
            self.state.next_item_hint = stamped.max(crate::attr::LAST_RESERVED_ITEM);
        }
        self.state.next_item_hint += 1;
        let item = ItemId(self.state.next_item_hint);
        self.touch(item);
        Ok(item)
    }

    // ---- attribute access ----

    pub(crate) fn attr_item(&mut self, info: &Arc<AttrInfo>, create: bool) -> DbResult<Option<ItemId>> {
        if let Some(fixed) = info.fixed_item {
            return Ok(Some(fixed));
        }
        if let Some(item) = self.resolve(&info.def.id)? {
            return Ok(Some(item));
        }
        if !create {
            return Ok(None);
        }
        let object = info
            .identity_init()
            .into_iter()
            .fold(IdentifiedObject::new(info.def.id.clone()), |obj, (attr, value)| {
                obj.with(attr, value)
            });
        Ok(Some(self.materialize(&object)?))
    }

    /// Reads a scalar attribute. Collection attributes must go through
    /// [`read_values`].
    ///
    /// [`read_values`]: TransactionContext::read_values
    pub fn read_value(&mut self, item: ItemId, attr: crate::attr::AttrHandle) -> DbResult<Option<Value>> {
        let info = self.engine.attrs.require(attr)?;
        if info.def.composition != crate::value::Composition::Scalar {
            return Err(DbError::Validation(format!(
                "attribute {} is a {}, read it with read_values",
                info.def.id, info.def.composition
            )));
        }
        let mut values = self.read_values(item, attr)?;
        Ok(values.pop())
    }

    /// Reads every stored value of an attribute for one item. Empty and
    /// never-written are indistinguishable.
    pub fn read_values(&mut self, item: ItemId, attr: crate::attr::AttrHandle) -> DbResult<Vec<Value>> {
        let info = self.engine.attrs.require(attr)?;
        let Some(attr_item) = self.attr_item(&info, false)? else {
            return Ok(Vec::new());
        };
        let adapter = AttributeAdapter::for_info(info);
        let codecs = self.engine.codecs.read();
        let mut cx = StorageCtx {
            conn: &self.state.conn,
            tables: &mut self.state.tables,
            codecs: &codecs,
        };
        adapter.read(&mut cx, attr_item, item)
    }

    /// Writes a scalar attribute; `None` removes it. Returns whether
    /// the stored value changed.
    pub fn write_value(
        &mut self,
        item: ItemId,
        attr: crate::attr::AttrHandle,
        value: Option<&Value>,
    ) -> DbResult<bool> {
        let info = self.engine.attrs.require(attr)?;
        if info.def.composition != crate::value::Composition::Scalar {
            return Err(DbError::Validation(format!(
                "attribute {} is a {}, write it with write_values",
                info.def.id, info.def.composition
            )));
        }
        match value {
            Some(value) => self.write_values(item, attr, std::slice::from_ref(value)),
            None => self.write_values(item, attr, &[]),
        }
    }

    /// Replaces the stored values of an attribute for one item. Returns
    /// whether anything changed; unchanged writes leave the item
    /// untouched.
    pub fn write_values(
        &mut self,
        item: ItemId,
        attr: crate::attr::AttrHandle,
        values: &[Value],
    ) -> DbResult<bool> {
        self.require_write()?;
        if !item.is_valid() {
            return Err(DbError::Validation(format!("cannot write to item {item}")));
        }
        let info = self.engine.attrs.require(attr)?;
        let create = !values.is_empty();
        let Some(attr_item) = self.attr_item(&info, create)? else {
            // Removing values from an attribute that never stored any.
            return Ok(false);
        };
        let changed = {
            let adapter = AttributeAdapter::for_info(info.clone());
            let codecs = self.engine.codecs.read();
            let mut cx = StorageCtx {
                conn: &self.state.conn,
                tables: &mut self.state.tables,
                codecs: &codecs,
            };
            adapter.write(&mut cx, attr_item, item, values)?
        };
        if changed {
            self.touch(item);
            self.state.caches.values.attr_written(attr);
            if attr == SYS_ID {
                match values.first() {
                    Some(Value::Str(id)) => {
                        self.state.caches.identity.record(id.clone(), item);
                    }
                    _ => self.state.caches.identity.drop_items(&[item]),
                }
            }
            // Any of the definition attributes changing makes the cached
            // definition for this item stale.
            if matches!(attr, SYS_ID | SYS_KIND | SYS_COMPOSITION | SYS_PROPAGATING) {
                self.state.caches.defs.drop_item(item);
            }
        }
        Ok(changed)
    }

    /// Bulk columnar read of one attribute across many items, aligned
    /// with the input order.
    pub fn load_attribute(
        &mut self,
        attr: crate::attr::AttrHandle,
        items: &[ItemId],
    ) -> DbResult<Vec<Vec<Value>>> {
        let info = self.engine.attrs.require(attr)?;
        let Some(attr_item) = self.attr_item(&info, false)? else {
            return Ok(vec![Vec::new(); items.len()]);
        };
        let adapter = AttributeAdapter::for_info(info);
        let codecs = self.engine.codecs.read();
        let mut cx = StorageCtx {
            conn: &self.state.conn,
            tables: &mut self.state.tables,
            codecs: &codecs,
        };
        adapter.load_many(&mut cx, attr_item, items)
    }

    /// Deletes every attribute row of an item, in every registered
    /// table. References held by other items are left dangling.
    pub fn clear_item(&mut self, item: ItemId) -> DbResult<bool> {
        self.require_write()?;
        let stored_id = self.read_value(item, SYS_ID)?;
        let mut removed = 0usize;
        for physical in tables::registered_physicals(&self.state.conn)? {
            let sql = format!("DELETE FROM \"{physical}\" WHERE item = ?1");
            removed += self.state.conn.prepare_cached(&sql)?.execute([item.raw()])?;
        }
        if removed == 0 {
            return Ok(false);
        }
        self.touch(item);
        if let Some(Value::Str(id)) = stored_id {
            self.state.caches.identity.record_cleared(id);
        } else {
            self.state.caches.identity.drop_items(&[item]);
        }
        self.state.caches.defs.drop_item(item);
        // Any cached value list may have held this item.
        for n in 0..self.engine.attrs.len() {
            self.state.caches.values.attr_written(crate::attr::AttrHandle(n as u32));
        }
        tracing::debug!(%item, rows = removed, "cleared item");
        Ok(true)
    }

    /// Reads back the attribute definition stored on `item`, if the item
    /// backs a materialized attribute. Resolved definitions are cached on
    /// the connection and dropped when the item changes.
    pub fn attribute_definition(&mut self, item: ItemId) -> DbResult<Option<Arc<Attribute>>> {
        let floor = self.icn_floor();
        self.state.caches.defs.revalidate(floor, &self.engine.ring);
        if let Some(hit) = self.state.caches.defs.get(item) {
            return Ok(Some(hit));
        }
        let Some(Value::Str(id)) = self.read_value(item, SYS_ID)? else {
            return Ok(None);
        };
        let kind_tag = self.read_value(item, SYS_KIND)?;
        let comp_tag = self.read_value(item, SYS_COMPOSITION)?;
        let (Some(Value::Int(kind_tag)), Some(Value::Int(comp_tag))) = (kind_tag, comp_tag) else {
            return Ok(None);
        };
        let (Some(kind), Some(composition)) = (
            u8::try_from(kind_tag).ok().and_then(crate::value::ScalarKind::from_tag),
            u8::try_from(comp_tag).ok().and_then(crate::value::Composition::from_tag),
        ) else {
            // Stored tags this build does not understand; the attribute
            // came from a newer schema. Treat it as not a definition.
            tracing::warn!(%item, kind_tag, comp_tag, "unreadable attribute definition tags");
            return Ok(None);
        };
        let propagating = matches!(self.read_value(item, SYS_PROPAGATING)?, Some(Value::Bool(true)));
        let def = Arc::new(Attribute { id, kind, composition, propagating });
        self.state.caches.defs.record(item, def.clone());
        Ok(Some(def))
    }

    // ---- change tracking ----

    pub(crate) fn touch(&mut self, item: ItemId) {
        if let Some(changes) = &mut self.changes {
            changes.touch(item);
        }
    }

    pub(crate) fn changes(&self) -> Option<&ChangeSet> {
        self.changes.as_ref()
    }

    /// Items changed strictly after `since`, up to this transaction's
    /// change number. Served from the recent-changes ring when it still
    /// covers the span.
    pub fn changed_since(&mut self, since: Icn) -> DbResult<Vec<ItemId>> {
        if let Some(from_ring) = self.engine.ring.span(since, self.icn_floor()) {
            return Ok(from_ring);
        }
        schema::changed_since(&self.state.conn, since)
    }

    /// The latest committed ICN visible to this transaction. For writes
    /// that is one below the stamp being prepared.
    fn icn_floor(&self) -> Icn {
        match self.kind {
            JobKind::Read | JobKind::ReadCommit => self.icn,
            JobKind::Write => Icn(self.icn.raw() - 1),
        }
    }

    /// Runs the propagation loop: items referenced through propagating
    /// attributes by touched items count as changed too, transitively.
    pub(crate) fn flush_propagation(&mut self) -> DbResult<()> {
        const MAX_PASSES: u32 = 32;
        let propagating = self.engine.attrs.propagating();
        let mut pass = 0u32;
        loop {
            let pending = match &mut self.changes {
                Some(changes) => {
                    let pending = changes.pending();
                    changes.mark_flushed(&pending);
                    pending
                }
                None => return Ok(()),
            };
            if pending.is_empty() {
                return Ok(());
            }
            pass += 1;
            if pass > MAX_PASSES {
                tracing::warn!(pass, "propagation did not settle, stopping");
                return Ok(());
            }
            for info in &propagating {
                let Some(attr_item) = self.attr_item(info, false)? else {
                    continue;
                };
                let Some(table) = self.state.tables.lookup(&self.state.conn, &info.table)?
                else {
                    continue;
                };
                let mut b = SqlBuilder::new(format!(
                    "SELECT DISTINCT value FROM \"{table}\" WHERE attr = "
                ));
                b.bind(attr_item.raw());
                b.push(" AND ");
                b.bind_items("item", &pending);
                let targets = b.query_items(&self.state.conn)?;
                for target in targets {
                    self.touch(target);
                }
            }
        }
    }

    // ---- value lookups ----

    /// Items currently holding `value` in `attr`, ascending. Collection
    /// attributes match on membership. Results are cached and validated
    /// by ICN on later calls.
    pub fn items_with_value(
        &mut self,
        attr: crate::attr::AttrHandle,
        value: &Value,
    ) -> DbResult<Arc<Vec<ItemId>>> {
        let info = self.engine.attrs.require(attr)?;
        let Some(attr_item) = self.attr_item(&info, false)? else {
            return Ok(Arc::new(Vec::new()));
        };
        self.sync_value_cache()?;
        if let Some(hit) = self.state.caches.values.get(attr, value) {
            return Ok(hit);
        }
        let rows = self.query_value_rows(&info, attr_item, value, None)?;
        let rows = Arc::new(rows);
        self.state.caches.values.record(attr, value.clone(), rows.clone());
        Ok(rows)
    }

    /// One revalidation per job; later lookups hit [`CacheCore::plan`]'s
    /// fresh path for free.
    fn sync_value_cache(&mut self) -> DbResult<()> {
        if self.values_synced {
            return Ok(());
        }
        let target = self.icn_floor();
        let engine = self.engine;
        let ConnState { conn, tables, caches, .. } = &mut *self.state;
        caches.values.revalidate(target, &engine.ring, |attr, value, changed| {
            let Some(info) = engine.attrs.get(attr) else {
                return Ok(Vec::new());
            };
            let attr_item = match info.fixed_item {
                Some(fixed) => fixed,
                // User attributes reaching this probe were cached, so
                // they resolved before; re-resolve through SQL.
                None => {
                    let sys_id = engine.attrs.require(SYS_ID)?;
                    let Some(table) = tables.lookup(conn, &sys_id.table)? else {
                        return Ok(Vec::new());
                    };
                    let sql = format!(
                        "SELECT item FROM \"{table}\" WHERE attr = ?1 AND value = ?2 LIMIT 1"
                    );
                    let mut stmt = conn.prepare_cached(&sql)?;
                    let found: Option<i64> = stmt
                        .query_row(params![SYS_ID_ITEM.raw(), info.def.id.as_str()], |row| {
                            row.get(0)
                        })
                        .map(Some)
                        .or_else(|e| match e {
                            rusqlite::Error::QueryReturnedNoRows => Ok(None),
                            other => Err(other),
                        })?;
                    match found {
                        Some(item) => ItemId(item),
                        None => return Ok(Vec::new()),
                    }
                }
            };
            let Some(table) = tables.lookup(conn, &info.table)? else {
                return Ok(Vec::new());
            };
            let codecs = engine.codecs.read();
            let bound = bind_value(&codecs, &info, value)?;
            let mut b = SqlBuilder::new(format!(
                "SELECT DISTINCT item FROM \"{table}\" WHERE attr = "
            ));
            b.bind(attr_item.raw());
            b.push(" AND value = ");
            b.bind(bound);
            b.push(" AND ");
            b.bind_items("item", changed);
            b.push(" ORDER BY item");
            b.query_items(conn)
        })?;
        self.values_synced = true;
        Ok(())
    }

    /// Direct SQL for a value lookup, optionally restricted to a subset
    /// of items.
    pub(crate) fn query_value_rows(
        &mut self,
        info: &Arc<AttrInfo>,
        attr_item: ItemId,
        value: &Value,
        within: Option<&[ItemId]>,
    ) -> DbResult<Vec<ItemId>> {
        let Some(table) = self.state.tables.lookup(&self.state.conn, &info.table)? else {
            return Ok(Vec::new());
        };
        let codecs = self.engine.codecs.read();
        let bound = bind_value(&codecs, info, value)?;
        drop(codecs);
        let mut b = SqlBuilder::new(format!(
            "SELECT DISTINCT item FROM \"{table}\" WHERE attr = "
        ));
        b.bind(attr_item.raw());
        b.push(" AND value = ");
        b.bind(bound);
        if let Some(items) = within {
            b.push(" AND ");
            b.bind_items("item", items);
        }
        b.push(" ORDER BY item");
        b.query_items(&self.state.conn)
    }

    // ---- queries ----

    /// Runs a predicate query, returning matching items ascending.
    pub fn query(&mut self, predicate: &Predicate) -> DbResult<Vec<ItemId>> {
        match crate::query::execute(self, predicate)? {
            ItemSet::All => self.all_items(),
            ItemSet::Sorted(items) => Ok(items),
        }
    }

    /// Runs a predicate query through the connection's filter-sharing
    /// tree, materializing or revalidating result tables so repeated and
    /// overlapping filters reuse each other's work. Write transactions
    /// fall back to a direct query: their filter tables would go stale
    /// mid-transaction.
    pub fn filter_items(&mut self, predicate: &Predicate) -> DbResult<Vec<ItemId>> {
        if self.is_write() {
            return self.query(predicate);
        }
        // The tree borrows the whole context while it runs, so it steps
        // out of the connection state for the duration of the call.
        let mut tree = self
            .state
            .filter
            .take()
            .unwrap_or_else(FilterTree::new);
        let result = tree.query(self, predicate);
        self.state.filter = Some(tree);
        result
    }

    /// The chain of filters `predicate` was folded under, outermost
    /// first and the filter itself last. Each entry is the full
    /// predicate that filter represents.
    pub fn filter_ancestry(&mut self, predicate: &Predicate) -> DbResult<Vec<Predicate>> {
        let mut tree = self
            .state
            .filter
            .take()
            .unwrap_or_else(FilterTree::new);
        let result = tree.ancestry(self, predicate);
        self.state.filter = Some(tree);
        result
    }

    /// Every item that currently holds any attribute row.
    pub(crate) fn all_items(&mut self) -> DbResult<Vec<ItemId>> {
        let mut all: Vec<ItemId> = Vec::new();
        for physical in tables::registered_physicals(&self.state.conn)? {
            let sql = format!("SELECT DISTINCT item FROM \"{physical}\"");
            let mut stmt = self.state.conn.prepare_cached(&sql)?;
            let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
            let mut chunk = Vec::new();
            for row in rows {
                chunk.push(ItemId(row?));
            }
            chunk.sort_unstable();
            all = crate::types::union_sorted(&all, &chunk);
        }
        Ok(all)
    }
}
