//! Read and write paths for attribute rows.
//!
//! One adapter per composition, a closed set. All three share the same
//! row shape helpers; what differs is ordering, uniqueness, and how a
//! new value list is compared against the stored one. Writes report
//! whether they changed anything so unchanged stores never touch an
//! item.

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, params};
use std::sync::Arc;

use crate::attr::AttrInfo;
use crate::attr::tables::TableCache;
use crate::error::{DbError, DbResult};
use crate::sqlite::select::SqlBuilder;
use crate::types::ItemId;
use crate::value::{CodecRegistry, Composition, ScalarKind, Value};

/// Borrowed view of connection-scoped storage state, assembled by the
/// transaction for each adapter call.
pub(crate) struct StorageCtx<'a> {
    pub conn: &'a Connection,
    pub tables: &'a mut TableCache,
    pub codecs: &'a CodecRegistry,
}

pub(crate) enum AttributeAdapter {
    Scalar(ScalarAdapter),
    Set(SetAdapter),
    List(ListAdapter),
}

pub(crate) struct ScalarAdapter {
    info: Arc<AttrInfo>,
}

pub(crate) struct SetAdapter {
    info: Arc<AttrInfo>,
}

pub(crate) struct ListAdapter {
    info: Arc<AttrInfo>,
}

impl AttributeAdapter {
    pub(crate) fn for_info(info: Arc<AttrInfo>) -> AttributeAdapter {
        match info.def.composition {
            Composition::Scalar => AttributeAdapter::Scalar(ScalarAdapter { info }),
            Composition::Set => AttributeAdapter::Set(SetAdapter { info }),
            Composition::List => AttributeAdapter::List(ListAdapter { info }),
        }
    }

    pub(crate) fn info(&self) -> &Arc<AttrInfo> {
        match self {
            AttributeAdapter::Scalar(a) => &a.info,
            AttributeAdapter::Set(a) => &a.info,
            AttributeAdapter::List(a) => &a.info,
        }
    }

    /// Stored values for one item: at most one for scalars, value-ordered
    /// for sets, position-ordered for lists. Absent rows read as empty.
    pub(crate) fn read(
        &self,
        cx: &mut StorageCtx<'_>,
        attr_item: ItemId,
        item: ItemId,
    ) -> DbResult<Vec<Value>> {
        read_rows(cx, self.info(), attr_item, item)
    }

    /// Replaces the stored values for one item. Empty input deletes every
    /// row, which reads back the same as never-written. Returns whether
    /// the store changed.
    pub(crate) fn write(
        &self,
        cx: &mut StorageCtx<'_>,
        attr_item: ItemId,
        item: ItemId,
        values: &[Value],
    ) -> DbResult<bool> {
        match self {
            AttributeAdapter::Scalar(a) => a.write(cx, attr_item, item, values),
            AttributeAdapter::Set(a) => a.write(cx, attr_item, item, values),
            AttributeAdapter::List(a) => a.write(cx, attr_item, item, values),
        }
    }

    /// Columnar load for many items in one statement, output aligned
    /// with the input order.
    pub(crate) fn load_many(
        &self,
        cx: &mut StorageCtx<'_>,
        attr_item: ItemId,
        items: &[ItemId],
    ) -> DbResult<Vec<Vec<Value>>> {
        let info = self.info();
        let mut out = vec![Vec::new(); items.len()];
        if items.is_empty() {
            return Ok(out);
        }
        let Some(table) = cx.tables.lookup(cx.conn, &info.table)? else {
            return Ok(out);
        };
        let mut slot_of = std::collections::HashMap::with_capacity(items.len());
        for (slot, item) in items.iter().enumerate() {
            slot_of.insert(item.raw(), slot);
        }
        let mut b = SqlBuilder::new(format!(
            "SELECT item, value FROM \"{table}\" WHERE attr = "
        ));
        b.bind(attr_item.raw());
        b.push(" AND ");
        b.bind_items("item", items);
        b.push(match info.def.composition {
            Composition::List => " ORDER BY item, position",
            _ => " ORDER BY item, value",
        });
        b.query_each(cx.conn, |row| {
            let item: i64 = row.get(0)?;
            if let Some(&slot) = slot_of.get(&item) {
                out[slot].push(decode_value(cx.codecs, info, row.get_ref(1)?)?);
            }
            Ok(())
        })?;
        Ok(out)
    }
}

impl ScalarAdapter {
    fn write(
        &self,
        cx: &mut StorageCtx<'_>,
        attr_item: ItemId,
        item: ItemId,
        values: &[Value],
    ) -> DbResult<bool> {
        if values.len() > 1 {
            return Err(DbError::Validation(format!(
                "attribute {} is scalar, got {} values",
                self.info.def.id,
                values.len()
            )));
        }
        let current = read_rows(cx, &self.info, attr_item, item)?;
        if current == values {
            return Ok(false);
        }
        match values.first() {
            None => {
                delete_rows(cx, &self.info, attr_item, item)?;
            }
            Some(value) => {
                let bound = bind_value(cx.codecs, &self.info, value)?;
                let table = cx.tables.ensure(cx.conn, &self.info.table)?;
                let sql = format!(
                    "INSERT OR REPLACE INTO \"{table}\" (attr, item, value) VALUES (?1, ?2, ?3)"
                );
                cx.conn
                    .prepare_cached(&sql)?
                    .execute(params![attr_item.raw(), item.raw(), bound])?;
            }
        }
        Ok(true)
    }
}

impl SetAdapter {
    fn write(
        &self,
        cx: &mut StorageCtx<'_>,
        attr_item: ItemId,
        item: ItemId,
        values: &[Value],
    ) -> DbResult<bool> {
        let mut incoming = values.to_vec();
        incoming.sort();
        incoming.dedup();
        let mut current = read_rows(cx, &self.info, attr_item, item)?;
        current.sort();
        if current == incoming {
            return Ok(false);
        }
        delete_rows(cx, &self.info, attr_item, item)?;
        if !incoming.is_empty() {
            let table = cx.tables.ensure(cx.conn, &self.info.table)?;
            let sql = format!(
                "INSERT OR IGNORE INTO \"{table}\" (attr, item, value) VALUES (?1, ?2, ?3)"
            );
            let mut stmt = cx.conn.prepare_cached(&sql)?;
            for value in &incoming {
                let bound = bind_value(cx.codecs, &self.info, value)?;
                stmt.execute(params![attr_item.raw(), item.raw(), bound])?;
            }
        }
        Ok(true)
    }
}

impl ListAdapter {
    fn write(
        &self,
        cx: &mut StorageCtx<'_>,
        attr_item: ItemId,
        item: ItemId,
        values: &[Value],
    ) -> DbResult<bool> {
        let current = read_rows(cx, &self.info, attr_item, item)?;
        if current == values {
            return Ok(false);
        }
        delete_rows(cx, &self.info, attr_item, item)?;
        if !values.is_empty() {
            let table = cx.tables.ensure(cx.conn, &self.info.table)?;
            let sql = format!(
                "INSERT INTO \"{table}\" (attr, item, position, value) VALUES (?1, ?2, ?3, ?4)"
            );
            let mut stmt = cx.conn.prepare_cached(&sql)?;
            for (position, value) in values.iter().enumerate() {
                let bound = bind_value(cx.codecs, &self.info, value)?;
                stmt.execute(params![
                    attr_item.raw(),
                    item.raw(),
                    position as i64,
                    bound
                ])?;
            }
        }
        Ok(true)
    }
}

/// Stored values for one item, ordered by the composition's natural key.
fn read_rows(
    cx: &mut StorageCtx<'_>,
    info: &AttrInfo,
    attr_item: ItemId,
    item: ItemId,
) -> DbResult<Vec<Value>> {
    let Some(table) = cx.tables.lookup(cx.conn, &info.table)? else {
        return Ok(Vec::new());
    };
    let order = match info.def.composition {
        Composition::Scalar => "",
        Composition::Set => " ORDER BY value",
        Composition::List => " ORDER BY position",
    };
    let sql = format!("SELECT value FROM \"{table}\" WHERE attr = ?1 AND item = ?2{order}");
    let mut stmt = cx.conn.prepare_cached(&sql)?;
    let mut rows = stmt.query(params![attr_item.raw(), item.raw()])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(decode_value(cx.codecs, info, row.get_ref(0)?)?);
    }
    Ok(out)
}

fn delete_rows(
    cx: &mut StorageCtx<'_>,
    info: &AttrInfo,
    attr_item: ItemId,
    item: ItemId,
) -> DbResult<()> {
    if let Some(table) = cx.tables.lookup(cx.conn, &info.table)? {
        let sql = format!("DELETE FROM \"{table}\" WHERE attr = ?1 AND item = ?2");
        cx.conn
            .prepare_cached(&sql)?
            .execute(params![attr_item.raw(), item.raw()])?;
    }
    Ok(())
}

/// Converts a value for binding, checking its kind against the
/// attribute. References bind as plain integers without a codec so item
/// links work even on a stripped-down codec registry.
pub(crate) fn bind_value(
    codecs: &CodecRegistry,
    info: &AttrInfo,
    value: &Value,
) -> DbResult<SqlValue> {
    if value.kind() != info.def.kind {
        return Err(DbError::Validation(format!(
            "attribute {} holds {} values, got {}",
            info.def.id,
            info.def.kind,
            value.kind()
        )));
    }
    if let Value::Ref(item) = value {
        return Ok(SqlValue::Integer(item.raw()));
    }
    codecs.require(info.def.kind, &info.def.id)?.bind(value)
}

pub(crate) fn decode_value(
    codecs: &CodecRegistry,
    info: &AttrInfo,
    raw: ValueRef<'_>,
) -> DbResult<Value> {
    if info.def.kind == ScalarKind::Ref {
        if let ValueRef::Integer(id) = raw {
            return Ok(Value::Ref(ItemId(id)));
        }
        return Err(DbError::Validation(format!(
            "attribute {} holds references, found non-integer row",
            info.def.id
        )));
    }
    codecs.require(info.def.kind, &info.def.id)?.decode(raw)
}
