//! Persistent bootstrap schema.
//!
//! Three fixed tables back everything else:
//!
//! * `_globals(id, value)` holds single-cell engine state addressed by
//!   negative well-known ids.
//! * `_items(item, icn)` records the last change number stamped on each
//!   item that was ever touched by a write.
//! * `_tables(name, version, physical)` maps logical table names to the
//!   physical SQLite tables that currently hold them.

use rand::Rng;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params};
use std::rc::Rc;

use crate::error::DbResult;
use crate::types::{Icn, ItemId};

/// Database incarnation number, re-rolled when a database file is created.
pub(crate) const GLOBAL_DIN: i64 = -1;
/// The ICN the next successful write transaction will be stamped with.
pub(crate) const GLOBAL_NEXT_ICN: i64 = -2;
/// Table-cache invalidation stamp, bumped whenever `_tables` changes.
pub(crate) const GLOBAL_TCID: i64 = -3;

const BOOTSTRAP_SQL: &str = "\
CREATE TABLE IF NOT EXISTS _globals (
  id INTEGER NOT NULL PRIMARY KEY,
  value INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS _items (
  item INTEGER NOT NULL PRIMARY KEY,
  icn INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS _items_icn ON _items (icn);
CREATE TABLE IF NOT EXISTS _tables (
  table_id INTEGER NOT NULL PRIMARY KEY,
  name TEXT NOT NULL,
  version INTEGER NOT NULL,
  physical TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS _tables_name ON _tables (name, version);
";

/// Creates the bootstrap tables and repairs the global counters.
///
/// Runs inside its own write transaction on a fresh connection, both on
/// first start and after reincarnation.
pub(crate) fn bootstrap(conn: &Connection) -> DbResult<()> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let out = bootstrap_in_tx(conn);
    match out {
        Ok(()) => conn.execute_batch("COMMIT")?,
        Err(_) => {
            let _ = conn.execute_batch("ROLLBACK");
        }
    }
    out
}

fn bootstrap_in_tx(conn: &Connection) -> DbResult<()> {
    conn.execute_batch(BOOTSTRAP_SQL)?;
    if global_get(conn, GLOBAL_DIN)?.is_none() {
        let din: i64 = rand::thread_rng().gen_range(1..i64::MAX);
        global_set(conn, GLOBAL_DIN, din)?;
        tracing::debug!(din, "assigned database incarnation");
    }
    repair_next_icn(conn)?;
    if global_get(conn, GLOBAL_TCID)?.is_none() {
        global_set(conn, GLOBAL_TCID, initial_tcid())?;
    }
    Ok(())
}

/// `NEXT_ICN` must stay strictly above every stamp in `_items`, even if a
/// crash lost the counter update. Repairs it upward, never downward.
fn repair_next_icn(conn: &Connection) -> DbResult<()> {
    let stamped_max: i64 = conn.query_row(
        "SELECT COALESCE(MAX(icn), 0) FROM _items",
        [],
        |row| row.get(0),
    )?;
    let floor = stamped_max + 1;
    match global_get(conn, GLOBAL_NEXT_ICN)? {
        Some(next) if next >= floor => Ok(()),
        Some(next) => {
            tracing::warn!(next, floor, "next change number below stamped maximum, repairing");
            global_set(conn, GLOBAL_NEXT_ICN, floor)
        }
        None => global_set(conn, GLOBAL_NEXT_ICN, floor),
    }
}

pub(crate) fn global_get(conn: &Connection, id: i64) -> DbResult<Option<i64>> {
    let mut stmt = conn.prepare_cached("SELECT value FROM _globals WHERE id = ?1")?;
    Ok(stmt.query_row([id], |row| row.get(0)).optional()?)
}

pub(crate) fn global_set(conn: &Connection, id: i64, value: i64) -> DbResult<()> {
    let mut stmt =
        conn.prepare_cached("INSERT OR REPLACE INTO _globals (id, value) VALUES (?1, ?2)")?;
    stmt.execute(params![id, value])?;
    Ok(())
}

/// The ICN of the latest committed write, `Icn::ZERO` for a fresh database.
pub(crate) fn current_icn(conn: &Connection) -> DbResult<Icn> {
    match global_get(conn, GLOBAL_NEXT_ICN)? {
        Some(next) => Ok(Icn(next - 1)),
        None => Ok(Icn::ZERO),
    }
}

/// Reserves the next ICN for a write transaction without advancing it.
/// The advance happens in [`finish_write`] so aborted writes leave no gap.
pub(crate) fn write_icn(conn: &Connection) -> DbResult<Icn> {
    Ok(Icn(global_get(conn, GLOBAL_NEXT_ICN)?.unwrap_or(1)))
}

/// Stamps every touched item with `icn` and advances `NEXT_ICN` past it.
pub(crate) fn finish_write(conn: &Connection, icn: Icn, touched: &[ItemId]) -> DbResult<()> {
    if !touched.is_empty() {
        stamp_items(conn, icn, touched)?;
    }
    global_set(conn, GLOBAL_NEXT_ICN, icn.raw() + 1)
}

/// Bulk ICN stamp through the carray-style rowset rather than a statement
/// per item.
pub(crate) fn stamp_items(conn: &Connection, icn: Icn, items: &[ItemId]) -> DbResult<()> {
    if items.len() <= 4 {
        let mut stmt = conn
            .prepare_cached("INSERT OR REPLACE INTO _items (item, icn) VALUES (?1, ?2)")?;
        for item in items {
            stmt.execute(params![item.raw(), icn.raw()])?;
        }
        return Ok(());
    }
    let values: Vec<SqlValue> = items.iter().map(|i| SqlValue::Integer(i.raw())).collect();
    let mut stmt = conn.prepare_cached(
        "INSERT OR REPLACE INTO _items (item, icn) SELECT value, ?1 FROM rarray(?2)",
    )?;
    stmt.execute(params![icn.raw(), Rc::new(values)])?;
    Ok(())
}

/// Items stamped strictly after `since`, ascending by item id.
pub(crate) fn changed_since(conn: &Connection, since: Icn) -> DbResult<Vec<ItemId>> {
    let mut stmt =
        conn.prepare_cached("SELECT item FROM _items WHERE icn > ?1 ORDER BY item")?;
    let rows = stmt.query_map([since.raw()], |row| row.get::<_, i64>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(ItemId(row?));
    }
    Ok(out)
}

/// Largest item id ever stamped, used to seed item allocation.
pub(crate) fn max_stamped_item(conn: &Connection) -> DbResult<i64> {
    Ok(conn.query_row("SELECT COALESCE(MAX(item), 0) FROM _items", [], |row| {
        row.get(0)
    })?)
}

pub(crate) fn read_tcid(conn: &Connection) -> DbResult<i64> {
    Ok(global_get(conn, GLOBAL_TCID)?.unwrap_or(0))
}

/// Advances the table-cache stamp: a sequence number in the high half and
/// the wall-clock second in the low half, so stamps from different
/// incarnations never collide.
pub(crate) fn bump_tcid(conn: &Connection) -> DbResult<i64> {
    let old = read_tcid(conn)?;
    let seq = (old >> 32).wrapping_add(1) & 0x7fff_ffff;
    let stamp = (seq << 32) | (unix_time() & 0xffff_ffff);
    global_set(conn, GLOBAL_TCID, stamp)?;
    Ok(stamp)
}

fn initial_tcid() -> i64 {
    (1 << 32) | (unix_time() & 0xffff_ffff)
}

fn unix_time() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
