//! Filter sharing across repeated queries.
//!
//! Conjunctive filters a connection keeps running are materialized into
//! TEMP tables and arranged in a tree: a filter whose conjuncts contain
//! another filter's conjuncts becomes its child and only evaluates the
//! difference over the parent's rows. Tables are revalidated by ICN, so
//! a filter that ran before only reprocesses items changed since.

use rand::Rng;
use std::sync::Arc;

use crate::error::DbResult;
use crate::query::planner;
use crate::query::{Conjunct, Predicate, execute_within};
use crate::sqlite::select::SqlBuilder;
use crate::tx::TransactionContext;
use crate::types::{Icn, ItemId, ItemSet, intersect_sorted};

/// Materialized filters kept per tree; least recently used leaves are
/// evicted beyond this.
const MAX_ENTRIES: usize = 64;

struct Entry {
    /// Full conjunct set this filter represents, sorted.
    conjuncts: Vec<Conjunct>,
    /// Conjuncts evaluated at this node, the rest comes from the parent.
    working: Vec<Conjunct>,
    parent: Option<usize>,
    table: Arc<str>,
    built: bool,
    validated: Option<Icn>,
    rows: usize,
    used: u64,
}

pub(crate) struct FilterTree {
    /// Random letters in every table name, so trees on different
    /// connections never collide in a shared temp schema.
    infix: String,
    entries: Vec<Option<Entry>>,
    next_table: u32,
    clock: u64,
}

impl FilterTree {
    pub(crate) fn new() -> FilterTree {
        let mut rng = rand::thread_rng();
        let infix: String = (0..2).map(|_| rng.gen_range(b'a'..=b'z') as char).collect();
        FilterTree { infix, entries: Vec::new(), next_table: 0, clock: 0 }
    }

    /// Runs `predicate` through the tree. Only single-conjunction forms
    /// are shareable; everything else executes directly.
    pub(crate) fn query(
        &mut self,
        ctx: &mut TransactionContext<'_>,
        predicate: &Predicate,
    ) -> DbResult<Vec<ItemId>> {
        let Some(conjuncts) = self.shareable(ctx, predicate)? else {
            return ctx.query(predicate);
        };
        if conjuncts.is_empty() {
            return ctx.all_items();
        }
        let idx = self.ensure_entry(conjuncts);
        self.materialize(ctx, idx)?;
        self.evict_stale(ctx)?;
        self.table_rows(ctx, idx)
    }

    /// Full predicates of the chain `predicate` folds under, outermost
    /// first and the filter itself last.
    pub(crate) fn ancestry(
        &mut self,
        ctx: &mut TransactionContext<'_>,
        predicate: &Predicate,
    ) -> DbResult<Vec<Predicate>> {
        let Some(conjuncts) = self.shareable(ctx, predicate)? else {
            return Ok(vec![predicate.clone()]);
        };
        if conjuncts.is_empty() {
            return Ok(vec![Predicate::All]);
        }
        let idx = self.ensure_entry(conjuncts);
        let chain = self.chain(idx);
        Ok(chain
            .into_iter()
            .map(|i| conjuncts_to_predicate(&self.entries[i].as_ref().unwrap().conjuncts))
            .collect())
    }

    /// Normalizes to a single sorted conjunction, or `None` when the
    /// predicate cannot share a filter table.
    fn shareable(
        &self,
        ctx: &TransactionContext<'_>,
        predicate: &Predicate,
    ) -> DbResult<Option<Vec<Conjunct>>> {
        let dnf = planner::normalize(predicate, ctx.engine.config.max_predicate_depth)?;
        if dnf.matches_nothing() || dnf.disjuncts.len() != 1 {
            return Ok(None);
        }
        let mut conjuncts = dnf.disjuncts.into_iter().next().unwrap();
        conjuncts.sort();
        conjuncts.dedup();
        Ok(Some(conjuncts))
    }

    // ---- structure ----

    /// Finds or inserts the entry for `conjuncts`, restructuring the
    /// tree when a new shared ancestor pays off.
    fn ensure_entry(&mut self, conjuncts: Vec<Conjunct>) -> usize {
        self.clock += 1;
        if let Some(idx) = self.find_exact(&conjuncts) {
            self.entries[idx].as_mut().unwrap().used = self.clock;
            return idx;
        }

        // Best existing filter whose conjuncts are all contained in the
        // new one: largest overlap wins, smaller row count breaks ties.
        let mut parent: Option<usize> = None;
        for (idx, slot) in self.entries.iter().enumerate() {
            let Some(entry) = slot else { continue };
            if !is_subset(&entry.conjuncts, &conjuncts) {
                continue;
            }
            let better = match parent {
                None => true,
                Some(best) => {
                    let best = self.entries[best].as_ref().unwrap();
                    (entry.conjuncts.len(), std::cmp::Reverse(entry.rows))
                        > (best.conjuncts.len(), std::cmp::Reverse(best.rows))
                }
            };
            if better {
                parent = Some(idx);
            }
        }
        if let Some(p) = parent {
            let working = difference(&conjuncts, &self.entries[p].as_ref().unwrap().conjuncts);
            return self.insert(conjuncts, working, Some(p));
        }

        // No subset parent. Look for a filter sharing a strict prefix of
        // conjuncts and pull the common part out into a new ancestor
        // both can hang off.
        let mut couple: Option<(usize, Vec<Conjunct>, i32)> = None;
        for (idx, slot) in self.entries.iter().enumerate() {
            let Some(entry) = slot else { continue };
            if entry.parent.is_some() {
                continue;
            }
            let common = common_conjuncts(&entry.conjuncts, &conjuncts);
            if common.is_empty() || common.len() >= entry.conjuncts.len() {
                continue;
            }
            let priority = couple_priority(entry);
            let better = match &couple {
                None => true,
                Some((_, best_common, best_priority)) => {
                    (common.len(), priority) > (best_common.len(), *best_priority)
                }
            };
            if better {
                couple = Some((idx, common, priority));
            }
        }
        if let Some((existing, common, _)) = couple {
            let ancestor = self.insert(common.clone(), common.clone(), None);
            let entry = self.entries[existing].as_mut().unwrap();
            entry.parent = Some(ancestor);
            entry.working = difference(&entry.conjuncts.clone(), &common);
            entry.built = false;
            entry.validated = None;
            let working = difference(&conjuncts, &common);
            return self.insert(conjuncts, working, Some(ancestor));
        }

        let working = conjuncts.clone();
        self.insert(conjuncts, working, None)
    }

    fn find_exact(&self, conjuncts: &[Conjunct]) -> Option<usize> {
        self.entries.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|entry| entry.conjuncts == conjuncts)
        })
    }

    fn insert(
        &mut self,
        conjuncts: Vec<Conjunct>,
        working: Vec<Conjunct>,
        parent: Option<usize>,
    ) -> usize {
        let table: Arc<str> = format!("sr{}{}", self.infix, self.next_table).into();
        self.next_table += 1;
        let entry = Entry {
            conjuncts,
            working,
            parent,
            table,
            built: false,
            validated: None,
            rows: 0,
            used: self.clock,
        };
        match self.entries.iter().position(Option::is_none) {
            Some(free) => {
                self.entries[free] = Some(entry);
                free
            }
            None => {
                self.entries.push(Some(entry));
                self.entries.len() - 1
            }
        }
    }

    /// Indexes from the root of `idx`'s chain down to `idx` itself.
    fn chain(&self, idx: usize) -> Vec<usize> {
        let mut chain = vec![idx];
        let mut current = idx;
        while let Some(parent) = self.entries[current].as_ref().unwrap().parent {
            chain.push(parent);
            current = parent;
        }
        chain.reverse();
        chain
    }

    // ---- materialization ----

    fn materialize(&mut self, ctx: &mut TransactionContext<'_>, idx: usize) -> DbResult<()> {
        let target = ctx.icn();
        for step in self.chain(idx) {
            ctx.ensure_alive()?;
            // The table can be gone while the entry survives, e.g. when
            // the transaction that built it failed and rolled back; only
            // a table that still exists is reusable.
            let (present, validated) = {
                let entry = self.entries[step].as_ref().unwrap();
                let present = entry.built && table_exists(ctx, &entry.table)?;
                (present, entry.validated)
            };
            match validated {
                Some(seen) if present && seen == target => {}
                Some(seen) if present && seen < target => {
                    self.refresh(ctx, step, seen, target)?;
                }
                _ => self.build(ctx, step, target)?,
            }
            self.entries[step].as_mut().unwrap().used = self.clock;
        }
        Ok(())
    }

    fn build(
        &mut self,
        ctx: &mut TransactionContext<'_>,
        idx: usize,
        target: Icn,
    ) -> DbResult<()> {
        let (table, parent, working) = {
            let entry = self.entries[idx].as_ref().unwrap();
            (entry.table.clone(), entry.parent, entry.working.clone())
        };
        let universe = match parent {
            Some(p) => ItemSet::Sorted(self.table_rows(ctx, p)?),
            None => ItemSet::All,
        };
        let predicate = conjuncts_to_predicate(&working);
        let matching = match execute_within(ctx, &predicate, &universe)? {
            ItemSet::Sorted(items) => items,
            ItemSet::All => match universe {
                ItemSet::Sorted(items) => items,
                ItemSet::All => ctx.all_items()?,
            },
        };
        ctx.note_temp_write();
        ctx.state.conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS \"{table}\";\n\
             CREATE TEMP TABLE \"{table}\" (id INTEGER NOT NULL PRIMARY KEY)"
        ))?;
        {
            let sql = format!("INSERT INTO \"{table}\" (id) VALUES (?1)");
            let mut stmt = ctx.state.conn.prepare_cached(&sql)?;
            for item in &matching {
                stmt.execute([item.raw()])?;
            }
        }
        tracing::debug!(table = %table, rows = matching.len(), "built filter table");
        let entry = self.entries[idx].as_mut().unwrap();
        entry.built = true;
        entry.validated = Some(target);
        entry.rows = matching.len();
        Ok(())
    }

    /// Brings a built table from `seen` to `target` by reprocessing only
    /// the items changed in between.
    fn refresh(
        &mut self,
        ctx: &mut TransactionContext<'_>,
        idx: usize,
        seen: Icn,
        target: Icn,
    ) -> DbResult<()> {
        let changed = ctx.changed_since(seen)?;
        if changed.is_empty() {
            self.entries[idx].as_mut().unwrap().validated = Some(target);
            return Ok(());
        }
        let (table, parent, working) = {
            let entry = self.entries[idx].as_ref().unwrap();
            (entry.table.clone(), entry.parent, entry.working.clone())
        };
        ctx.note_temp_write();
        let mut delete = SqlBuilder::new(format!("DELETE FROM \"{table}\" WHERE "));
        delete.bind_items("id", &changed);
        delete.execute(&ctx.state.conn)?;
        // Candidates are the changed items the parent still admits; the
        // parent ran first in the chain, so its table is current.
        let candidates = match parent {
            Some(p) => intersect_sorted(&changed, &self.table_rows(ctx, p)?),
            None => changed,
        };
        let predicate = conjuncts_to_predicate(&working);
        let matching = match execute_within(ctx, &predicate, &ItemSet::Sorted(candidates))? {
            ItemSet::Sorted(items) => items,
            ItemSet::All => unreachable!("restricted execution never widens to all"),
        };
        {
            let sql = format!("INSERT OR IGNORE INTO \"{table}\" (id) VALUES (?1)");
            let mut stmt = ctx.state.conn.prepare_cached(&sql)?;
            for item in &matching {
                stmt.execute([item.raw()])?;
            }
        }
        let count: i64 = ctx
            .state
            .conn
            .prepare_cached(&format!("SELECT COUNT(*) FROM \"{table}\""))?
            .query_row([], |row| row.get(0))?;
        tracing::trace!(table = %table, added = matching.len(), rows = count, "refreshed filter table");
        let entry = self.entries[idx].as_mut().unwrap();
        entry.validated = Some(target);
        entry.rows = count as usize;
        Ok(())
    }

    fn table_rows(
        &self,
        ctx: &mut TransactionContext<'_>,
        idx: usize,
    ) -> DbResult<Vec<ItemId>> {
        let table = self.entries[idx].as_ref().unwrap().table.clone();
        let b = SqlBuilder::new(format!("SELECT id FROM \"{table}\" ORDER BY id"));
        b.query_items(&ctx.state.conn)
    }

    /// Drops least-recently-used leaves while over capacity.
    fn evict_stale(&mut self, ctx: &mut TransactionContext<'_>) -> DbResult<()> {
        loop {
            let live = self.entries.iter().flatten().count();
            if live <= MAX_ENTRIES {
                return Ok(());
            }
            let has_children: Vec<usize> = self
                .entries
                .iter()
                .flatten()
                .filter_map(|entry| entry.parent)
                .collect();
            let victim = self
                .entries
                .iter()
                .enumerate()
                .filter_map(|(idx, slot)| slot.as_ref().map(|entry| (idx, entry)))
                .filter(|(idx, _)| !has_children.contains(idx))
                .min_by_key(|(_, entry)| entry.used)
                .map(|(idx, _)| idx);
            let Some(victim) = victim else { return Ok(()) };
            let entry = self.entries[victim].take().unwrap();
            if entry.built {
                ctx.note_temp_write();
                ctx.state
                    .conn
                    .execute_batch(&format!("DROP TABLE IF EXISTS \"{}\"", entry.table))?;
            }
            tracing::debug!(table = %entry.table, "evicted filter table");
        }
    }
}

fn table_exists(ctx: &TransactionContext<'_>, table: &str) -> DbResult<bool> {
    let mut stmt = ctx
        .state
        .conn
        .prepare_cached("SELECT 1 FROM sqlite_temp_master WHERE type = 'table' AND name = ?1")?;
    Ok(stmt.exists([table])?)
}

fn conjuncts_to_predicate(conjuncts: &[Conjunct]) -> Predicate {
    if conjuncts.is_empty() {
        return Predicate::All;
    }
    let mut parts: Vec<Predicate> = conjuncts
        .iter()
        .map(|c| {
            let term = Predicate::Term(c.term.clone());
            if c.negated { Predicate::not(term) } else { term }
        })
        .collect();
    if parts.len() == 1 {
        parts.pop().unwrap()
    } else {
        Predicate::And(parts)
    }
}

/// Whether every conjunct of `a` occurs in `b`; both sorted.
fn is_subset(a: &[Conjunct], b: &[Conjunct]) -> bool {
    a.iter().all(|c| b.binary_search(c).is_ok())
}

fn common_conjuncts(a: &[Conjunct], b: &[Conjunct]) -> Vec<Conjunct> {
    a.iter().filter(|c| b.binary_search(c).is_ok()).cloned().collect()
}

/// Conjuncts of `a` not in `b`; both sorted.
fn difference(a: &[Conjunct], b: &[Conjunct]) -> Vec<Conjunct> {
    a.iter().filter(|c| b.binary_search(c).is_err()).cloned().collect()
}

/// Restructuring preference: filters that are cheap to rebuild (nothing
/// or only literal comparisons left at their node) yield to ones that
/// would lose real work.
fn couple_priority(entry: &Entry) -> i32 {
    let literal_only = entry.working.iter().all(|c| {
        !c.negated
            && matches!(
                c.term,
                crate::query::Term::Equals { .. } | crate::query::Term::EqualsIdentified { .. }
            )
    });
    if entry.working.is_empty() || literal_only { -2 } else { -1 }
}
