//! Per-transaction change journal.
//!
//! Tracks which items the open write transaction touched and which of
//! those have already been through a propagation pass. The flush loop
//! in the transaction context drains `pending` until it stops growing.

use std::collections::BTreeSet;

use crate::types::ItemId;

#[derive(Debug, Default)]
pub(crate) struct ChangeSet {
    touched: BTreeSet<ItemId>,
    flushed: BTreeSet<ItemId>,
}

impl ChangeSet {
    pub(crate) fn new() -> ChangeSet {
        ChangeSet::default()
    }

    /// Marks an item changed. Returns whether it was newly recorded.
    pub(crate) fn touch(&mut self, item: ItemId) -> bool {
        self.touched.insert(item)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.touched.is_empty()
    }

    /// Touched items not yet propagated, in ascending order.
    pub(crate) fn pending(&self) -> Vec<ItemId> {
        self.touched.difference(&self.flushed).copied().collect()
    }

    pub(crate) fn mark_flushed(&mut self, items: &[ItemId]) {
        self.flushed.extend(items.iter().copied());
    }

    /// Every touched item in ascending order, for the final ICN stamp.
    pub(crate) fn touched_sorted(&self) -> Vec<ItemId> {
        self.touched.iter().copied().collect()
    }
}
