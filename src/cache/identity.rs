//! Cache of identified-object resolutions.
//!
//! Maps string ids to their backing items. Only positive resolutions
//! are cached; a miss always goes back to SQL, since new items appear
//! outside this connection's view. Writes in the current transaction
//! overlay the committed map and fold in on commit or vanish on
//! rollback.

use std::collections::HashMap;

use crate::cache::{CacheCore, RecentChanges, Revalidation};
use crate::types::{Icn, ItemId};

pub(crate) struct IdentityCache {
    core: CacheCore,
    committed: HashMap<String, ItemId>,
    /// Resolutions made by the open write transaction. `None` marks an
    /// id whose item was cleared.
    pending: HashMap<String, Option<ItemId>>,
    in_tx: bool,
}

impl IdentityCache {
    pub(crate) fn new() -> IdentityCache {
        IdentityCache {
            core: CacheCore::new(),
            committed: HashMap::new(),
            pending: HashMap::new(),
            in_tx: false,
        }
    }

    /// Brings the committed map up to `target` before any lookup.
    pub(crate) fn revalidate(&mut self, target: Icn, ring: &RecentChanges) {
        match self.core.plan(target, ring) {
            Revalidation::Fresh => {}
            Revalidation::Incremental(changed) => {
                self.committed.retain(|_, item| changed.binary_search(item).is_err());
                self.core.mark_valid(target);
            }
            Revalidation::Reset => {
                if !self.committed.is_empty() {
                    tracing::trace!(
                        entries = self.committed.len(),
                        "identity cache fell behind, dropping"
                    );
                }
                self.committed.clear();
                self.core.mark_valid(target);
            }
        }
    }

    pub(crate) fn get(&self, id: &str) -> Option<Option<ItemId>> {
        if self.in_tx {
            if let Some(pending) = self.pending.get(id) {
                return Some(*pending);
            }
        }
        self.committed.get(id).map(|item| Some(*item))
    }

    /// Records a resolution learned from SQL or a materialization.
    pub(crate) fn record(&mut self, id: String, item: ItemId) {
        if self.in_tx {
            self.pending.insert(id, Some(item));
        } else {
            self.committed.insert(id, item);
        }
    }

    /// Records that the item backing `id` was cleared by this
    /// transaction.
    pub(crate) fn record_cleared(&mut self, id: String) {
        debug_assert!(self.in_tx);
        self.committed.remove(&id);
        self.pending.insert(id, None);
    }

    /// Drops every id resolving to one of the cleared items. Used when a
    /// write clears items by id without knowing their string names.
    pub(crate) fn drop_items(&mut self, items: &[ItemId]) {
        self.committed.retain(|_, item| !items.contains(item));
        if self.in_tx {
            self.pending.retain(|_, pending| match pending {
                Some(item) => !items.contains(item),
                None => true,
            });
        }
    }

    pub(crate) fn begin_tx(&mut self) {
        self.in_tx = true;
        self.pending.clear();
    }

    pub(crate) fn commit_tx(&mut self, stamped: Icn) {
        for (id, pending) in self.pending.drain() {
            match pending {
                Some(item) => {
                    self.committed.insert(id, item);
                }
                None => {
                    self.committed.remove(&id);
                }
            }
        }
        self.in_tx = false;
        self.core.mark_valid(stamped);
    }

    pub(crate) fn rollback_tx(&mut self) {
        self.pending.clear();
        self.in_tx = false;
    }

    pub(crate) fn invalidate_all(&mut self) {
        self.committed.clear();
        self.pending.clear();
        self.core.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ring() -> RecentChanges {
        RecentChanges::new(8)
    }

    #[test]
    fn incremental_validation_drops_changed_items_only() {
        let ring = ring();
        let mut cache = IdentityCache::new();
        cache.revalidate(Icn(1), &ring);
        cache.record("a".into(), ItemId(10));
        cache.record("b".into(), ItemId(20));

        ring.publish(Icn(2), Arc::new(vec![ItemId(20)]));
        cache.revalidate(Icn(2), &ring);
        assert_eq!(cache.get("a"), Some(Some(ItemId(10))));
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn uncovered_span_resets_everything() {
        let ring = ring();
        let mut cache = IdentityCache::new();
        cache.revalidate(Icn(1), &ring);
        cache.record("a".into(), ItemId(10));
        // Nothing published for (1, 5].
        cache.revalidate(Icn(5), &ring);
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn pending_overlay_wins_inside_a_transaction() {
        let ring = ring();
        let mut cache = IdentityCache::new();
        cache.revalidate(Icn(1), &ring);
        cache.record("a".into(), ItemId(10));

        cache.begin_tx();
        cache.record("a".into(), ItemId(11));
        assert_eq!(cache.get("a"), Some(Some(ItemId(11))));
        cache.rollback_tx();
        assert_eq!(cache.get("a"), Some(Some(ItemId(10))));
    }

    #[test]
    fn invalidate_drops_committed_and_pending_state() {
        let ring = ring();
        let mut cache = IdentityCache::new();
        cache.revalidate(Icn(1), &ring);
        cache.record("a".into(), ItemId(10));
        cache.begin_tx();
        cache.record("b".into(), ItemId(20));

        cache.invalidate_all();
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn commit_folds_pending_into_committed() {
        let ring = ring();
        let mut cache = IdentityCache::new();
        cache.revalidate(Icn(1), &ring);

        cache.begin_tx();
        cache.record("a".into(), ItemId(10));
        cache.record_cleared("b".into());
        cache.commit_tx(Icn(2));
        assert_eq!(cache.get("a"), Some(Some(ItemId(10))));
        assert_eq!(cache.get("b"), None);

        ring.publish(Icn(2), Arc::new(vec![ItemId(10)]));
        cache.revalidate(Icn(2), &ring);
        assert_eq!(cache.get("a"), Some(Some(ItemId(10))));
    }
}
