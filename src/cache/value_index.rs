//! Cache of value-to-items lookups.
//!
//! Keys are `(attribute, value)` pairs; rows are the sorted items
//! currently holding that value. Incremental validation re-probes only
//! the changed items against SQL, so a big cached result survives a
//! small commit. Attributes written by the open transaction drop out of
//! the cache and bypass it until commit.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::attr::AttrHandle;
use crate::cache::{CacheCore, RecentChanges, Revalidation};
use crate::error::DbResult;
use crate::types::{Icn, ItemId, diff_sorted, union_sorted};
use crate::value::Value;

const MAX_ENTRIES: usize = 64;

pub(crate) struct ValueIndexCache {
    core: CacheCore,
    entries: HashMap<(AttrHandle, Value), Arc<Vec<ItemId>>>,
    dirty_attrs: BTreeSet<AttrHandle>,
    in_tx: bool,
}

impl ValueIndexCache {
    pub(crate) fn new() -> ValueIndexCache {
        ValueIndexCache {
            core: CacheCore::new(),
            entries: HashMap::new(),
            dirty_attrs: BTreeSet::new(),
            in_tx: false,
        }
    }

    /// Brings cached rows up to `target`. The probe receives the
    /// changed items and returns the subset currently matching the key.
    pub(crate) fn revalidate<F>(
        &mut self,
        target: Icn,
        ring: &RecentChanges,
        mut probe: F,
    ) -> DbResult<()>
    where
        F: FnMut(AttrHandle, &Value, &[ItemId]) -> DbResult<Vec<ItemId>>,
    {
        match self.core.plan(target, ring) {
            Revalidation::Fresh => {}
            Revalidation::Incremental(changed) => {
                let keys: Vec<(AttrHandle, Value)> = self.entries.keys().cloned().collect();
                for key in keys {
                    let matching = probe(key.0, &key.1, &changed)?;
                    let entry = match self.entries.get(&key) {
                        Some(rows) => rows,
                        None => continue,
                    };
                    let kept = diff_sorted(entry, &changed);
                    let updated = union_sorted(&kept, &matching);
                    self.entries.insert(key, Arc::new(updated));
                }
                self.core.mark_valid(target);
            }
            Revalidation::Reset => {
                if !self.entries.is_empty() {
                    tracing::trace!(entries = self.entries.len(), "value index fell behind, dropping");
                }
                self.entries.clear();
                self.core.mark_valid(target);
            }
        }
        Ok(())
    }

    pub(crate) fn get(&self, attr: AttrHandle, value: &Value) -> Option<Arc<Vec<ItemId>>> {
        if self.in_tx && self.dirty_attrs.contains(&attr) {
            return None;
        }
        self.entries.get(&(attr, value.clone())).cloned()
    }

    /// Caches a sorted result. Skipped for attributes the open
    /// transaction already touched, whose rows are in flux.
    pub(crate) fn record(&mut self, attr: AttrHandle, value: Value, rows: Arc<Vec<ItemId>>) {
        if self.in_tx && self.dirty_attrs.contains(&attr) {
            return;
        }
        if self.entries.len() >= MAX_ENTRIES && !self.entries.contains_key(&(attr, value.clone())) {
            // Arbitrary eviction keeps this bounded without an access
            // trail; entries rebuild on demand.
            if let Some(victim) = self.entries.keys().next().cloned() {
                self.entries.remove(&victim);
            }
        }
        self.entries.insert((attr, value), rows);
    }

    /// Called when the open transaction writes through `attr`.
    pub(crate) fn attr_written(&mut self, attr: AttrHandle) {
        debug_assert!(self.in_tx);
        self.dirty_attrs.insert(attr);
        self.entries.retain(|(entry_attr, _), _| *entry_attr != attr);
    }

    pub(crate) fn begin_tx(&mut self) {
        self.in_tx = true;
        self.dirty_attrs.clear();
    }

    pub(crate) fn commit_tx(&mut self, stamped: Icn) {
        self.in_tx = false;
        self.dirty_attrs.clear();
        self.core.mark_valid(stamped);
    }

    pub(crate) fn rollback_tx(&mut self) {
        self.in_tx = false;
        self.dirty_attrs.clear();
    }

    pub(crate) fn invalidate_all(&mut self) {
        self.entries.clear();
        self.dirty_attrs.clear();
        self.core.invalidate();
    }
}
