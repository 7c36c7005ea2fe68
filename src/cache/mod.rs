//! Passive caches validated against the item change number.
//!
//! A passive cache never subscribes to anything. Each lookup first
//! brings the cache up to the reader's ICN: unchanged means the data is
//! fresh, a covered span of recent commits means targeted invalidation,
//! and anything older than the ring reaches back means the cache drops
//! everything and starts over.

pub(crate) mod attr_defs;
pub(crate) mod identity;
pub(crate) mod value_index;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::types::{Icn, ItemId, union_sorted};

/// Ring of recently committed change sets, newest last. Commits that
/// touch nothing publish nothing, so entry ICNs are consecutive.
pub(crate) struct RecentChanges {
    inner: Mutex<Ring>,
}

struct Ring {
    entries: VecDeque<(Icn, Arc<Vec<ItemId>>)>,
    capacity: usize,
}

impl RecentChanges {
    pub(crate) fn new(capacity: usize) -> RecentChanges {
        RecentChanges {
            inner: Mutex::new(Ring { entries: VecDeque::new(), capacity: capacity.max(1) }),
        }
    }

    /// Records the sorted items touched by the commit stamped `icn`.
    pub(crate) fn publish(&self, icn: Icn, items: Arc<Vec<ItemId>>) {
        let mut ring = self.inner.lock();
        while ring.entries.len() >= ring.capacity {
            ring.entries.pop_front();
        }
        ring.entries.push_back((icn, items));
    }

    /// Union of items changed in `(after, upto]`, sorted, or `None` when
    /// the ring no longer covers that span.
    pub(crate) fn span(&self, after: Icn, upto: Icn) -> Option<Vec<ItemId>> {
        if upto <= after {
            return Some(Vec::new());
        }
        let ring = self.inner.lock();
        let mut expected = Icn(after.raw() + 1);
        let mut out: Vec<ItemId> = Vec::new();
        for (icn, items) in ring.entries.iter() {
            if *icn <= after {
                continue;
            }
            if *icn != expected {
                return None;
            }
            out = union_sorted(&out, items);
            expected = Icn(icn.raw() + 1);
            if *icn == upto {
                return Some(out);
            }
        }
        if expected.raw() == upto.raw() + 1 { Some(out) } else { None }
    }
}

/// What a cache must do to serve reads at the target ICN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Revalidation {
    /// Already valid at the target.
    Fresh,
    /// Drop or refresh entries for exactly these items.
    Incremental(Vec<ItemId>),
    /// The ring cannot account for the distance; start empty.
    Reset,
}

/// Validation bookkeeping shared by every passive cache.
pub(crate) struct CacheCore {
    validated_to: Option<Icn>,
}

impl CacheCore {
    pub(crate) fn new() -> CacheCore {
        CacheCore { validated_to: None }
    }

    pub(crate) fn plan(&self, target: Icn, ring: &RecentChanges) -> Revalidation {
        match self.validated_to {
            Some(seen) if seen == target => Revalidation::Fresh,
            Some(seen) if seen < target => match ring.span(seen, target) {
                Some(changed) => Revalidation::Incremental(changed),
                None => Revalidation::Reset,
            },
            // A target behind the validation point means the reader got
            // an older snapshot than the cache; rebuild rather than
            // serve rows from the future.
            Some(_) => Revalidation::Reset,
            None => Revalidation::Reset,
        }
    }

    pub(crate) fn mark_valid(&mut self, target: Icn) {
        self.validated_to = Some(target);
    }

    pub(crate) fn invalidate(&mut self) {
        self.validated_to = None;
    }

    pub(crate) fn validated_to(&self) -> Option<Icn> {
        self.validated_to
    }
}
