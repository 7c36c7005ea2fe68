//! Logical-to-physical table mapping.
//!
//! Attribute rows live in shared tables keyed by scalar kind and
//! composition, one physical SQLite table per logical name and version.
//! The `_tables` registry records the mapping; every connection keeps a
//! cache of it validated against the TCID global, so a registration made
//! by one connection invalidates the others lazily.

use rand::Rng;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{DbError, DbResult};
use crate::sqlite::schema;
use crate::value::{Composition, ScalarKind};

/// Bumped when the physical layout of attribute tables changes shape.
pub(crate) const TABLE_VERSION: i32 = 1;

const NAME_RETRIES: u32 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct TableDecl {
    pub logical: String,
    pub version: i32,
    pub columns: Vec<ColumnDecl>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ColumnDecl {
    pub name: &'static str,
    pub sql_type: &'static str,
    pub pk: bool,
}

impl TableDecl {
    /// The shared table holding every attribute of this kind and
    /// composition, discriminated by the `attr` column.
    pub(crate) fn for_attribute(kind: ScalarKind, composition: Composition) -> TableDecl {
        let logical = match composition {
            Composition::Scalar => format!("attr:{kind}"),
            Composition::Set => format!("attr:{kind}:set"),
            Composition::List => format!("attr:{kind}:list"),
        };
        let value_type = value_affinity(kind);
        let mut columns = vec![
            ColumnDecl { name: "attr", sql_type: "INTEGER", pk: true },
            ColumnDecl { name: "item", sql_type: "INTEGER", pk: true },
        ];
        match composition {
            Composition::Scalar => {
                columns.push(ColumnDecl { name: "value", sql_type: value_type, pk: false });
            }
            Composition::Set => {
                columns.push(ColumnDecl { name: "value", sql_type: value_type, pk: true });
            }
            Composition::List => {
                columns.push(ColumnDecl { name: "position", sql_type: "INTEGER", pk: true });
                columns.push(ColumnDecl { name: "value", sql_type: value_type, pk: false });
            }
        }
        TableDecl { logical, version: TABLE_VERSION, columns }
    }

    fn create_sql(&self, physical: &str) -> String {
        let mut cols = String::new();
        let mut pk = String::new();
        for col in &self.columns {
            if !cols.is_empty() {
                cols.push_str(", ");
            }
            cols.push_str(&format!("{} {} NOT NULL", col.name, col.sql_type));
            if col.pk {
                if !pk.is_empty() {
                    pk.push_str(", ");
                }
                pk.push_str(col.name);
            }
        }
        format!("CREATE TABLE \"{physical}\" ({cols}, PRIMARY KEY ({pk}))")
    }

    fn index_sql(&self, physical: &str) -> String {
        format!("CREATE INDEX IF NOT EXISTS \"{physical}_av\" ON \"{physical}\" (attr, value)")
    }
}

fn value_affinity(kind: ScalarKind) -> &'static str {
    match kind {
        ScalarKind::Str | ScalarKind::Decimal => "TEXT",
        ScalarKind::Int | ScalarKind::Bool | ScalarKind::Timestamp | ScalarKind::Ref => "INTEGER",
        ScalarKind::Bytes | ScalarKind::ValueMap => "BLOB",
    }
}

/// Derives the preferred physical name: colon-separated pieces reversed
/// so the most specific piece leads, non-alphanumerics dropped, version
/// suffixed. `attr:str:set` v1 becomes `set_str_attr_v1`.
pub(crate) fn preferred_physical(logical: &str, version: i32) -> String {
    let mut pieces: Vec<String> = logical
        .split(':')
        .map(|piece| {
            piece
                .chars()
                .filter(char::is_ascii_alphanumeric)
                .map(|c| c.to_ascii_lowercase())
                .collect::<String>()
        })
        .filter(|piece| !piece.is_empty())
        .collect();
    pieces.reverse();
    let mut name = pieces.join("_");
    if !name.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        name.insert(0, 't');
    }
    name.push_str(&format!("_v{version}"));
    name
}

fn name_in_use(conn: &Connection, name: &str) -> DbResult<bool> {
    let in_master: bool = conn
        .prepare_cached(
            "SELECT 1 FROM sqlite_master WHERE type IN ('table', 'index') AND name = ?1",
        )?
        .query_row([name], |_| Ok(()))
        .optional()?
        .is_some();
    if in_master {
        return Ok(true);
    }
    let registered: bool = conn
        .prepare_cached("SELECT 1 FROM _tables WHERE physical = ?1")?
        .query_row([name], |_| Ok(()))
        .optional()?
        .is_some();
    Ok(registered)
}

/// Per-connection view of the `_tables` registry.
///
/// Entries are loaded on demand and dropped wholesale when the TCID
/// stamp moves. Structure validation runs at most once per physical
/// table per connection.
pub(crate) struct TableCache {
    tcid: i64,
    physical: HashMap<(String, i32), Arc<str>>,
    validated: HashSet<Arc<str>>,
}

impl TableCache {
    pub(crate) fn new() -> TableCache {
        TableCache { tcid: 0, physical: HashMap::new(), validated: HashSet::new() }
    }

    /// Drops cached mappings if another connection changed the registry.
    pub(crate) fn refresh(&mut self, conn: &Connection) -> DbResult<()> {
        let tcid = schema::read_tcid(conn)?;
        if tcid != self.tcid {
            if self.tcid != 0 {
                tracing::debug!(
                    old = self.tcid,
                    new = tcid,
                    "table registry stamp moved, dropping cached mappings"
                );
            }
            self.physical.clear();
            self.validated.clear();
            self.tcid = tcid;
        }
        Ok(())
    }

    /// Physical table for a logical declaration, `None` when nothing was
    /// ever registered under that name. Read paths treat `None` as an
    /// empty table.
    pub(crate) fn lookup(
        &mut self,
        conn: &Connection,
        decl: &TableDecl,
    ) -> DbResult<Option<Arc<str>>> {
        let key = (decl.logical.clone(), decl.version);
        if let Some(hit) = self.physical.get(&key) {
            return Ok(Some(hit.clone()));
        }
        let mut stmt = conn
            .prepare_cached("SELECT physical FROM _tables WHERE name = ?1 AND version = ?2")?;
        let found: Option<String> = stmt
            .query_row(params![decl.logical, decl.version], |row| row.get(0))
            .optional()?;
        match found {
            Some(physical) => {
                let physical: Arc<str> = physical.into();
                self.physical.insert(key, physical.clone());
                Ok(Some(physical))
            }
            None => Ok(None),
        }
    }

    /// Physical table for a write path: registers and creates it when
    /// missing, and validates the stored structure once per connection.
    pub(crate) fn ensure(&mut self, conn: &Connection, decl: &TableDecl) -> DbResult<Arc<str>> {
        let physical = match self.lookup(conn, decl)? {
            Some(existing) => existing,
            None => self.register(conn, decl)?,
        };
        if !self.validated.contains(&physical) {
            validate_structure(conn, decl, &physical)?;
            self.validated.insert(physical.clone());
        }
        Ok(physical)
    }

    fn register(&mut self, conn: &Connection, decl: &TableDecl) -> DbResult<Arc<str>> {
        let physical = allocate_name(conn, &decl.logical, decl.version)?;
        conn.prepare_cached(
            "INSERT INTO _tables (name, version, physical) VALUES (?1, ?2, ?3)",
        )?
        .execute(params![decl.logical, decl.version, physical])?;
        conn.execute_batch(&decl.create_sql(&physical))?;
        conn.execute_batch(&decl.index_sql(&physical))?;
        self.tcid = schema::bump_tcid(conn)?;
        tracing::info!(logical = %decl.logical, version = decl.version, physical = %physical, "registered table");
        let physical: Arc<str> = physical.into();
        self.physical
            .insert((decl.logical.clone(), decl.version), physical.clone());
        self.validated.insert(physical.clone());
        Ok(physical)
    }
}

/// Every physical table currently in the registry.
pub(crate) fn registered_physicals(conn: &Connection) -> DbResult<Vec<String>> {
    let mut stmt = conn.prepare_cached("SELECT physical FROM _tables ORDER BY table_id")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn allocate_name(conn: &Connection, logical: &str, version: i32) -> DbResult<String> {
    let preferred = preferred_physical(logical, version);
    if !name_in_use(conn, &preferred)? {
        return Ok(preferred);
    }
    let mut rng = rand::thread_rng();
    for _ in 0..NAME_RETRIES {
        let suffix: String = (0..3).map(|_| rng.gen_range(b'a'..=b'z') as char).collect();
        let candidate = format!("{preferred}_{suffix}");
        if !name_in_use(conn, &candidate)? {
            return Ok(candidate);
        }
    }
    Err(DbError::table_registry(format!(
        "no free physical name for {logical} v{version} after {NAME_RETRIES} tries"
    )))
}

/// Reconciles an on-disk table with its declaration: creates a missing
/// table, adds missing non-key columns, and recreates the table when the
/// key structure or column types diverge. Recreation discards rows and is
/// logged at warn.
fn validate_structure(conn: &Connection, decl: &TableDecl, physical: &str) -> DbResult<()> {
    let existing = read_columns(conn, physical)?;
    if existing.is_empty() {
        tracing::warn!(physical, logical = %decl.logical, "registered table missing on disk, creating");
        conn.execute_batch(&decl.create_sql(physical))?;
        conn.execute_batch(&decl.index_sql(physical))?;
        return Ok(());
    }
    let mut missing: Vec<&ColumnDecl> = Vec::new();
    for col in &decl.columns {
        match existing.iter().find(|e| e.name.eq_ignore_ascii_case(col.name)) {
            None if col.pk => return recreate(conn, decl, physical, "missing key column"),
            None => missing.push(col),
            Some(e) => {
                if !e.sql_type.eq_ignore_ascii_case(col.sql_type) {
                    return recreate(conn, decl, physical, "column type mismatch");
                }
                if e.pk != col.pk {
                    return recreate(conn, decl, physical, "key structure mismatch");
                }
            }
        }
    }
    for col in missing {
        conn.execute_batch(&format!(
            "ALTER TABLE \"{physical}\" ADD COLUMN {} {} NOT NULL DEFAULT 0",
            col.name, col.sql_type
        ))?;
        tracing::info!(physical, column = col.name, "added missing column");
    }
    conn.execute_batch(&decl.index_sql(physical))?;
    Ok(())
}

fn recreate(conn: &Connection, decl: &TableDecl, physical: &str, reason: &str) -> DbResult<()> {
    tracing::warn!(physical, logical = %decl.logical, reason, "table structure diverged, recreating");
    conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{physical}\""))?;
    conn.execute_batch(&decl.create_sql(physical))?;
    conn.execute_batch(&decl.index_sql(physical))?;
    Ok(())
}

struct ExistingColumn {
    name: String,
    sql_type: String,
    pk: bool,
}

fn read_columns(conn: &Connection, physical: &str) -> DbResult<Vec<ExistingColumn>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{physical}\")"))?;
    let rows = stmt.query_map([], |row| {
        Ok(ExistingColumn {
            name: row.get(1)?,
            sql_type: row.get(2)?,
            pk: row.get::<_, i64>(5)? > 0,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        rusqlite::vtab::array::load_module(&conn).expect("rarray");
        schema::bootstrap(&conn).expect("bootstrap");
        conn
    }

    #[test]
    fn preferred_names_reverse_and_sanitize() {
        assert_eq!(preferred_physical("attr:str:set", 1), "set_str_attr_v1");
        assert_eq!(preferred_physical("attr:value_map", 1), "valuemap_attr_v1");
        assert_eq!(preferred_physical("attr:int", 2), "int_attr_v2");
        assert_eq!(preferred_physical("1:2", 1), "t2_1_v1");
    }

    #[test]
    fn ensure_registers_and_reuses() {
        let conn = memory_conn();
        let mut cache = TableCache::new();
        cache.refresh(&conn).unwrap();
        let decl = TableDecl::for_attribute(ScalarKind::Str, Composition::Scalar);
        let first = cache.ensure(&conn, &decl).unwrap();
        assert_eq!(&*first, "str_attr_v1");
        let again = cache.ensure(&conn, &decl).unwrap();
        assert_eq!(first, again);
        let registered: i64 = conn
            .query_row("SELECT COUNT(*) FROM _tables", [], |r| r.get(0))
            .unwrap();
        assert_eq!(registered, 1);
    }

    #[test]
    fn lookup_without_registration_is_none() {
        let conn = memory_conn();
        let mut cache = TableCache::new();
        cache.refresh(&conn).unwrap();
        let decl = TableDecl::for_attribute(ScalarKind::Int, Composition::Set);
        assert!(cache.lookup(&conn, &decl).unwrap().is_none());
    }

    #[test]
    fn colliding_preferred_name_gets_suffix() {
        let conn = memory_conn();
        conn.execute_batch("CREATE TABLE str_attr_v1 (x INTEGER)").unwrap();
        let name = allocate_name(&conn, "attr:str", 1).unwrap();
        assert_ne!(name, "str_attr_v1");
        assert!(name.starts_with("str_attr_v1_"));
    }

    #[test]
    fn registry_change_invalidates_other_caches() {
        let conn = memory_conn();
        let decl = TableDecl::for_attribute(ScalarKind::Str, Composition::Scalar);
        let mut writer = TableCache::new();
        writer.refresh(&conn).unwrap();
        let mut reader = TableCache::new();
        reader.refresh(&conn).unwrap();
        assert!(reader.lookup(&conn, &decl).unwrap().is_none());

        writer.ensure(&conn, &decl).unwrap();
        reader.refresh(&conn).unwrap();
        assert!(reader.lookup(&conn, &decl).unwrap().is_some());
    }

    #[test]
    fn dropped_table_is_recreated_on_validation() {
        let conn = memory_conn();
        let decl = TableDecl::for_attribute(ScalarKind::Str, Composition::Scalar);
        let mut cache = TableCache::new();
        cache.refresh(&conn).unwrap();
        let physical = cache.ensure(&conn, &decl).unwrap();
        conn.execute_batch(&format!("DROP TABLE \"{physical}\"")).unwrap();

        let mut fresh = TableCache::new();
        fresh.refresh(&conn).unwrap();
        fresh.ensure(&conn, &decl).unwrap();
        conn.execute(
            &format!("INSERT INTO \"{physical}\" (attr, item, value) VALUES (1, 1, 'x')"),
            [],
        )
        .unwrap();
    }

    #[test]
    fn structure_mismatch_recreates_with_declared_shape() {
        let conn = memory_conn();
        let decl = TableDecl::for_attribute(ScalarKind::Int, Composition::Scalar);
        let physical = preferred_physical(&decl.logical, decl.version);
        conn.execute(
            "INSERT INTO _tables (name, version, physical) VALUES (?1, ?2, ?3)",
            params![decl.logical, decl.version, physical],
        )
        .unwrap();
        conn.execute_batch(&format!(
            "CREATE TABLE \"{physical}\" (attr INTEGER NOT NULL, item TEXT NOT NULL, value INTEGER NOT NULL, PRIMARY KEY (attr, item))"
        ))
        .unwrap();

        let mut cache = TableCache::new();
        cache.refresh(&conn).unwrap();
        cache.ensure(&conn, &decl).unwrap();
        let cols = read_columns(&conn, &physical).unwrap();
        let item = cols.iter().find(|c| c.name == "item").unwrap();
        assert!(item.sql_type.eq_ignore_ascii_case("INTEGER"));
    }
}
