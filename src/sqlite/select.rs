//! Incremental SQL assembly with owned parameters.
//!
//! Queries against attribute tables are built in fragments, with item
//! restrictions rendered in one of three shapes chosen by cardinality so
//! prepared statements stay reusable: a single equality, an `IN` list
//! padded with nulls to a fixed arity, or an `rarray` rowset beyond that.

use rusqlite::types::{ToSql, Value as SqlValue};
use rusqlite::{CachedStatement, Connection, Row};
use std::rc::Rc;

use crate::error::DbResult;
use crate::types::ItemId;

/// Largest restriction rendered as a padded `IN (?, ...)` list.
pub(crate) const IN_LIST_ARITY: usize = 10;

pub(crate) struct SqlBuilder {
    sql: String,
    params: Vec<Box<dyn ToSql>>,
}

impl SqlBuilder {
    pub(crate) fn new(base: impl Into<String>) -> SqlBuilder {
        SqlBuilder { sql: base.into(), params: Vec::new() }
    }

    /// Appends a raw SQL fragment.
    pub(crate) fn push(&mut self, fragment: &str) {
        self.sql.push_str(fragment);
    }

    /// Appends a `?N` placeholder bound to `value`.
    pub(crate) fn bind(&mut self, value: impl ToSql + 'static) {
        self.params.push(Box::new(value));
        self.sql.push_str(&format!("?{}", self.params.len()));
    }

    /// Appends `column <restriction>` for the given items.
    pub(crate) fn bind_items(&mut self, column: &str, items: &[ItemId]) {
        match items.len() {
            0 => self.push("0 = 1"),
            1 => {
                self.push(column);
                self.push(" = ");
                self.bind(items[0].raw());
            }
            n if n <= IN_LIST_ARITY => {
                self.push(column);
                self.push(" IN (");
                for slot in 0..IN_LIST_ARITY {
                    if slot > 0 {
                        self.push(", ");
                    }
                    match items.get(slot) {
                        Some(item) => self.bind(item.raw()),
                        // Null never matches, so padding keeps the
                        // statement text identical across cardinalities.
                        None => self.bind(SqlValue::Null),
                    }
                }
                self.push(")");
            }
            _ => {
                let rows: Vec<SqlValue> =
                    items.iter().map(|i| SqlValue::Integer(i.raw())).collect();
                self.push(column);
                self.push(" IN rarray(");
                self.bind(Rc::new(rows));
                self.push(")");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn sql(&self) -> &str {
        &self.sql
    }

    fn param_refs(&self) -> Vec<&dyn ToSql> {
        self.params.iter().map(|p| p.as_ref()).collect()
    }

    pub(crate) fn prepare<'c>(&self, conn: &'c Connection) -> DbResult<CachedStatement<'c>> {
        Ok(conn.prepare_cached(&self.sql)?)
    }

    /// Runs the statement and folds each row through `f`.
    pub(crate) fn query_each<F>(&self, conn: &Connection, mut f: F) -> DbResult<()>
    where
        F: FnMut(&Row<'_>) -> DbResult<()>,
    {
        let mut stmt = self.prepare(conn)?;
        let params = self.param_refs();
        let mut rows = stmt.query(params.as_slice())?;
        while let Some(row) = rows.next()? {
            f(row)?;
        }
        Ok(())
    }

    /// Runs the statement collecting the first column as item ids.
    pub(crate) fn query_items(&self, conn: &Connection) -> DbResult<Vec<ItemId>> {
        let mut out = Vec::new();
        self.query_each(conn, |row| {
            out.push(ItemId(row.get(0)?));
            Ok(())
        })?;
        Ok(out)
    }

    pub(crate) fn execute(&self, conn: &Connection) -> DbResult<usize> {
        let mut stmt = self.prepare(conn)?;
        let params = self.param_refs();
        Ok(stmt.execute(params.as_slice())?)
    }
}
