//! Cache of attribute definitions read back from their backing items.
//!
//! A materialized attribute stores its own definition as system
//! attributes on its item. Reading it back is rare but chatty (four
//! scalar reads), so resolved definitions are cached per connection and
//! dropped when the backing item changes.

use std::collections::HashMap;
use std::sync::Arc;

use crate::attr::Attribute;
use crate::cache::{CacheCore, RecentChanges, Revalidation};
use crate::types::{Icn, ItemId};

pub(crate) struct AttrDefCache {
    core: CacheCore,
    committed: HashMap<ItemId, Arc<Attribute>>,
    /// Items whose definition the open write transaction touched; their
    /// entries are dropped and stay uncached until commit.
    in_tx: bool,
}

impl AttrDefCache {
    pub(crate) fn new() -> AttrDefCache {
        AttrDefCache { core: CacheCore::new(), committed: HashMap::new(), in_tx: false }
    }

    /// Brings the map up to `target` before any lookup.
    pub(crate) fn revalidate(&mut self, target: Icn, ring: &RecentChanges) {
        match self.core.plan(target, ring) {
            Revalidation::Fresh => {}
            Revalidation::Incremental(changed) => {
                self.committed.retain(|item, _| changed.binary_search(item).is_err());
                self.core.mark_valid(target);
            }
            Revalidation::Reset => {
                if !self.committed.is_empty() {
                    tracing::trace!(
                        entries = self.committed.len(),
                        "attribute definition cache fell behind, dropping"
                    );
                }
                self.committed.clear();
                self.core.mark_valid(target);
            }
        }
    }

    pub(crate) fn get(&self, item: ItemId) -> Option<Arc<Attribute>> {
        self.committed.get(&item).cloned()
    }

    pub(crate) fn record(&mut self, item: ItemId, def: Arc<Attribute>) {
        // Definitions written by the open transaction bypass the cache
        // until they commit.
        if !self.in_tx {
            self.committed.insert(item, def);
        }
    }

    pub(crate) fn drop_item(&mut self, item: ItemId) {
        self.committed.remove(&item);
    }

    pub(crate) fn begin_tx(&mut self) {
        self.in_tx = true;
    }

    pub(crate) fn commit_tx(&mut self, stamped: Icn) {
        self.in_tx = false;
        self.core.mark_valid(stamped);
    }

    pub(crate) fn rollback_tx(&mut self) {
        self.in_tx = false;
    }

    pub(crate) fn invalidate_all(&mut self) {
        self.committed.clear();
        self.core.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Composition, ScalarKind};

    fn def(id: &str) -> Arc<Attribute> {
        Arc::new(Attribute {
            id: id.into(),
            kind: ScalarKind::Str,
            composition: Composition::Scalar,
            propagating: false,
        })
    }

    #[test]
    fn incremental_validation_drops_changed_definitions_only() {
        let ring = RecentChanges::new(8);
        let mut cache = AttrDefCache::new();
        cache.revalidate(Icn(1), &ring);
        cache.record(ItemId(10), def("t:title"));
        cache.record(ItemId(11), def("t:notes"));

        ring.publish(Icn(2), Arc::new(vec![ItemId(11)]));
        cache.revalidate(Icn(2), &ring);
        assert!(cache.get(ItemId(10)).is_some());
        assert!(cache.get(ItemId(11)).is_none());
    }

    #[test]
    fn in_transaction_records_are_skipped() {
        let ring = RecentChanges::new(8);
        let mut cache = AttrDefCache::new();
        cache.revalidate(Icn(1), &ring);

        cache.begin_tx();
        cache.record(ItemId(10), def("t:title"));
        assert!(cache.get(ItemId(10)).is_none());
        cache.commit_tx(Icn(2));
        cache.record(ItemId(10), def("t:title"));
        assert!(cache.get(ItemId(10)).is_some());
    }

    #[test]
    fn uncovered_span_resets() {
        let ring = RecentChanges::new(8);
        let mut cache = AttrDefCache::new();
        cache.revalidate(Icn(1), &ring);
        cache.record(ItemId(10), def("t:title"));
        cache.revalidate(Icn(9), &ring);
        assert!(cache.get(ItemId(10)).is_none());
    }
}
