//! Extraction operators.
//!
//! Each normalized conjunct becomes one operator from a closed set. An
//! operator narrows a candidate item set, either through indexed SQL or
//! by checking items one at a time. Construction walks an ordered
//! factory list; the last factory accepts anything, so every conjunct
//! the planner admits gets an operator or fails typed before running.

use std::sync::Arc;

use crate::attr::AttrInfo;
use crate::attr::adapter::bind_value;
use crate::error::{DbError, DbResult};
use crate::query::{CompareOp, Conjunct, Term};
use crate::sqlite::select::SqlBuilder;
use crate::tx::{ConnState, TransactionContext};
use crate::types::{ItemId, ItemSet};
use crate::value::{ScalarKind, Value};

/// Cost ranks deciding chain order. Lower runs first.
const COST_LITERAL: u32 = 0;
const COST_INDEXED: u32 = 1;
const COST_NOT_NULL: u32 = 2;
const COST_INTERSECTS: u32 = 3;
const COST_PER_ITEM: u32 = 10;

pub(crate) enum ExtractionOp {
    /// Passes the input through unchanged.
    AllPass,
    /// Discards everything.
    NonePass,
    /// Indexed equality on the attribute's value column.
    SqlEquals { attr: Arc<AttrInfo>, value: Value },
    /// Indexed range comparison, ordered kinds only.
    SqlCompare { attr: Arc<AttrInfo>, op: CompareOp, value: Value },
    /// Any row present for the attribute.
    SqlNotNull { attr: Arc<AttrInfo> },
    /// Any row holding one of the listed values.
    SqlIntersects { attr: Arc<AttrInfo>, values: Vec<Value> },
    /// Loads the attribute per candidate item and evaluates in process.
    PerItem { attr: Arc<AttrInfo>, conjunct: Conjunct },
}

impl ExtractionOp {
    pub(crate) fn cost(&self) -> u32 {
        match self {
            ExtractionOp::AllPass | ExtractionOp::NonePass => COST_LITERAL,
            ExtractionOp::SqlEquals { .. } | ExtractionOp::SqlCompare { .. } => COST_INDEXED,
            ExtractionOp::SqlNotNull { .. } => COST_NOT_NULL,
            ExtractionOp::SqlIntersects { .. } => COST_INTERSECTS,
            ExtractionOp::PerItem { .. } => COST_PER_ITEM,
        }
    }

    pub(crate) fn apply(
        &self,
        ctx: &mut TransactionContext<'_>,
        input: &ItemSet,
    ) -> DbResult<ItemSet> {
        match self {
            ExtractionOp::AllPass => Ok(input.clone()),
            ExtractionOp::NonePass => Ok(ItemSet::empty()),
            ExtractionOp::SqlEquals { attr, value } => apply_equals(ctx, attr, value, input),
            ExtractionOp::SqlCompare { attr, op, value } => {
                apply_compare(ctx, attr, *op, value, input)
            }
            ExtractionOp::SqlNotNull { attr } => apply_not_null(ctx, attr, input),
            ExtractionOp::SqlIntersects { attr, values } => {
                apply_intersects(ctx, attr, values, input)
            }
            ExtractionOp::PerItem { attr, conjunct } => {
                apply_per_item(ctx, attr, conjunct, input)
            }
        }
    }
}

/// Ordered factory list. The first factory claiming a conjunct builds
/// its operator; `per_item` claims everything left.
pub(crate) fn build_operator(
    ctx: &mut TransactionContext<'_>,
    conjunct: &Conjunct,
) -> DbResult<ExtractionOp> {
    type Factory = fn(&mut TransactionContext<'_>, &Conjunct) -> DbResult<Option<ExtractionOp>>;
    const FACTORIES: &[Factory] = &[
        equals_factory,
        identified_factory,
        compare_factory,
        not_null_factory,
        intersects_factory,
        per_item_factory,
    ];
    for factory in FACTORIES {
        if let Some(op) = factory(ctx, conjunct)? {
            return Ok(op);
        }
    }
    Err(DbError::unexecutable(format!("no operator for {:?}", conjunct.term)))
}

fn equals_factory(
    ctx: &mut TransactionContext<'_>,
    conjunct: &Conjunct,
) -> DbResult<Option<ExtractionOp>> {
    if conjunct.negated {
        return Ok(None);
    }
    let Term::Equals { attr, value } = &conjunct.term else {
        return Ok(None);
    };
    let info = ctx.engine.attrs.require(*attr)?;
    Ok(Some(ExtractionOp::SqlEquals { attr: info, value: value.clone() }))
}

fn identified_factory(
    ctx: &mut TransactionContext<'_>,
    conjunct: &Conjunct,
) -> DbResult<Option<ExtractionOp>> {
    let Term::EqualsIdentified { attr, id } = &conjunct.term else {
        return Ok(None);
    };
    let info = ctx.engine.attrs.require(*attr)?;
    let resolved = ctx.resolve(id)?;
    let op = match (resolved, conjunct.negated) {
        // No backing item: nothing can reference it yet.
        (None, false) => ExtractionOp::NonePass,
        (None, true) => ExtractionOp::AllPass,
        (Some(item), false) => ExtractionOp::SqlEquals { attr: info, value: Value::Ref(item) },
        (Some(item), true) => ExtractionOp::PerItem {
            attr: info,
            conjunct: Conjunct {
                term: Term::Equals { attr: *attr, value: Value::Ref(item) },
                negated: true,
            },
        },
    };
    Ok(Some(op))
}

fn compare_factory(
    ctx: &mut TransactionContext<'_>,
    conjunct: &Conjunct,
) -> DbResult<Option<ExtractionOp>> {
    let Term::Compare { attr, op, value } = &conjunct.term else {
        return Ok(None);
    };
    let info = ctx.engine.attrs.require(*attr)?;
    if info.def.kind == ScalarKind::Decimal {
        return Err(DbError::unexecutable(format!(
            "attribute {} stores decimals, whose text order is not their numeric order",
            info.def.id
        )));
    }
    if !info.def.kind.is_ordered() {
        return Err(DbError::unexecutable(format!(
            "attribute {} holds {} values, which have no order",
            info.def.id, info.def.kind
        )));
    }
    let op = if conjunct.negated { op.negate() } else { *op };
    Ok(Some(ExtractionOp::SqlCompare { attr: info, op, value: value.clone() }))
}

fn not_null_factory(
    ctx: &mut TransactionContext<'_>,
    conjunct: &Conjunct,
) -> DbResult<Option<ExtractionOp>> {
    if conjunct.negated {
        return Ok(None);
    }
    let Term::NotNull { attr } = &conjunct.term else {
        return Ok(None);
    };
    let info = ctx.engine.attrs.require(*attr)?;
    Ok(Some(ExtractionOp::SqlNotNull { attr: info }))
}

fn intersects_factory(
    ctx: &mut TransactionContext<'_>,
    conjunct: &Conjunct,
) -> DbResult<Option<ExtractionOp>> {
    let Term::Intersects { attr, values } = &conjunct.term else {
        return Ok(None);
    };
    if conjunct.negated {
        return Err(DbError::unexecutable(
            "negated intersection cannot run against the value index",
        ));
    }
    if values.is_empty() {
        return Ok(Some(ExtractionOp::NonePass));
    }
    let info = ctx.engine.attrs.require(*attr)?;
    Ok(Some(ExtractionOp::SqlIntersects { attr: info, values: values.clone() }))
}

fn per_item_factory(
    ctx: &mut TransactionContext<'_>,
    conjunct: &Conjunct,
) -> DbResult<Option<ExtractionOp>> {
    let info = ctx.engine.attrs.require(conjunct.term.attr())?;
    Ok(Some(ExtractionOp::PerItem { attr: info, conjunct: conjunct.clone() }))
}

// ---- application ----

fn apply_equals(
    ctx: &mut TransactionContext<'_>,
    info: &Arc<AttrInfo>,
    value: &Value,
    input: &ItemSet,
) -> DbResult<ItemSet> {
    match input {
        // Unrestricted lookups run through the value index cache.
        ItemSet::All => {
            let rows = ctx.items_with_value(info.handle, value)?;
            Ok(ItemSet::Sorted(rows.as_ref().clone()))
        }
        ItemSet::Sorted(items) => {
            let Some(attr_item) = ctx.attr_item(info, false)? else {
                return Ok(ItemSet::empty());
            };
            let rows = ctx.query_value_rows(info, attr_item, value, Some(items))?;
            Ok(ItemSet::Sorted(rows))
        }
    }
}

fn apply_compare(
    ctx: &mut TransactionContext<'_>,
    info: &Arc<AttrInfo>,
    op: CompareOp,
    value: &Value,
    input: &ItemSet,
) -> DbResult<ItemSet> {
    let Some(attr_item) = ctx.attr_item(info, false)? else {
        return Ok(ItemSet::empty());
    };
    let bound = {
        let codecs = ctx.engine.codecs.read();
        bind_value(&codecs, info, value)?
    };
    let ConnState { conn, tables, .. } = &mut *ctx.state;
    let Some(table) = tables.lookup(conn, &info.table)? else {
        return Ok(ItemSet::empty());
    };
    let mut b = SqlBuilder::new(format!("SELECT DISTINCT item FROM \"{table}\" WHERE attr = "));
    b.bind(attr_item.raw());
    b.push(" AND value ");
    b.push(op.sql());
    b.push(" ");
    b.bind(bound);
    if let ItemSet::Sorted(items) = input {
        b.push(" AND ");
        b.bind_items("item", items);
    }
    b.push(" ORDER BY item");
    Ok(ItemSet::Sorted(b.query_items(conn)?))
}

fn apply_not_null(
    ctx: &mut TransactionContext<'_>,
    info: &Arc<AttrInfo>,
    input: &ItemSet,
) -> DbResult<ItemSet> {
    let Some(attr_item) = ctx.attr_item(info, false)? else {
        return Ok(ItemSet::empty());
    };
    let ConnState { conn, tables, .. } = &mut *ctx.state;
    let Some(table) = tables.lookup(conn, &info.table)? else {
        return Ok(ItemSet::empty());
    };
    let mut b = SqlBuilder::new(format!("SELECT DISTINCT item FROM \"{table}\" WHERE attr = "));
    b.bind(attr_item.raw());
    if let ItemSet::Sorted(items) = input {
        b.push(" AND ");
        b.bind_items("item", items);
    }
    b.push(" ORDER BY item");
    Ok(ItemSet::Sorted(b.query_items(conn)?))
}

fn apply_intersects(
    ctx: &mut TransactionContext<'_>,
    info: &Arc<AttrInfo>,
    values: &[Value],
    input: &ItemSet,
) -> DbResult<ItemSet> {
    let Some(attr_item) = ctx.attr_item(info, false)? else {
        return Ok(ItemSet::empty());
    };
    let bound: Vec<rusqlite::types::Value> = {
        let codecs = ctx.engine.codecs.read();
        values
            .iter()
            .map(|v| bind_value(&codecs, info, v))
            .collect::<DbResult<_>>()?
    };
    let ConnState { conn, tables, .. } = &mut *ctx.state;
    let Some(table) = tables.lookup(conn, &info.table)? else {
        return Ok(ItemSet::empty());
    };
    let mut b = SqlBuilder::new(format!("SELECT DISTINCT item FROM \"{table}\" WHERE attr = "));
    b.bind(attr_item.raw());
    b.push(" AND value IN (");
    for (n, value) in bound.into_iter().enumerate() {
        if n > 0 {
            b.push(", ");
        }
        b.bind(value);
    }
    b.push(")");
    if let ItemSet::Sorted(items) = input {
        b.push(" AND ");
        b.bind_items("item", items);
    }
    b.push(" ORDER BY item");
    Ok(ItemSet::Sorted(b.query_items(conn)?))
}

fn apply_per_item(
    ctx: &mut TransactionContext<'_>,
    info: &Arc<AttrInfo>,
    conjunct: &Conjunct,
    input: &ItemSet,
) -> DbResult<ItemSet> {
    let candidates: Vec<ItemId> = match input {
        ItemSet::All => ctx.all_items()?,
        ItemSet::Sorted(items) => items.clone(),
    };
    let mut kept = Vec::new();
    for (n, item) in candidates.iter().enumerate() {
        if n % 256 == 0 {
            ctx.ensure_alive()?;
        }
        let values = ctx.read_values(*item, info.handle)?;
        if eval_conjunct(conjunct, &values) {
            kept.push(*item);
        }
    }
    Ok(ItemSet::Sorted(kept))
}

/// In-process evaluation of one conjunct against an item's values.
pub(crate) fn eval_conjunct(conjunct: &Conjunct, values: &[Value]) -> bool {
    let holds = match &conjunct.term {
        Term::Equals { value, .. } => values.contains(value),
        // Factories rewrite resolved identified terms into plain
        // equality; an unresolved one matches no stored value.
        Term::EqualsIdentified { .. } => false,
        Term::Compare { op, value, .. } => values.iter().any(|v| match op {
            CompareOp::Lt => v < value,
            CompareOp::Le => v <= value,
            CompareOp::Gt => v > value,
            CompareOp::Ge => v >= value,
        }),
        Term::NotNull { .. } => !values.is_empty(),
        Term::Intersects { values: wanted, .. } => values.iter().any(|v| wanted.contains(v)),
    };
    holds != conjunct.negated
}
