use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one item. Items are opaque: the id carries no meaning
/// beyond identity, and ids are never reused once allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId(pub i64);

impl ItemId {
    pub fn raw(self) -> i64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Item Change Number: one per committed write transaction, strictly
/// increasing, never reused. `Icn(0)` is the state of a store that has
/// seen no writes; the first committed write gets `Icn(1)`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Icn(pub i64);

impl Icn {
    pub const ZERO: Icn = Icn(0);

    pub fn raw(self) -> i64 {
        self.0
    }

    pub fn next(self) -> Icn {
        Icn(self.0 + 1)
    }
}

impl fmt::Display for Icn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "icn:{}", self.0)
    }
}

/// Job priority. Positive values are interactive work, zero and below is
/// background work; the scheduler always picks the highest pending
/// priority and keeps submission order among equals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub i32);

impl Priority {
    pub const FOREGROUND: Priority = Priority(10);
    pub const BACKGROUND: Priority = Priority(0);
    pub const HOUSEKEEPING: Priority = Priority(-10);

    pub fn is_interactive(self) -> bool {
        self.0 > 0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::FOREGROUND
    }
}

/// An input or output of one extraction step: either every item in the
/// store or an explicit sorted, deduplicated list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemSet {
    All,
    Sorted(Vec<ItemId>),
}

impl ItemSet {
    pub fn empty() -> ItemSet {
        ItemSet::Sorted(Vec::new())
    }

    pub fn from_unsorted(mut items: Vec<ItemId>) -> ItemSet {
        items.sort_unstable();
        items.dedup();
        ItemSet::Sorted(items)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ItemSet::Sorted(v) if v.is_empty())
    }

    pub fn len_hint(&self) -> Option<usize> {
        match self {
            ItemSet::All => None,
            ItemSet::Sorted(v) => Some(v.len()),
        }
    }

    pub fn contains(&self, item: ItemId) -> bool {
        match self {
            ItemSet::All => true,
            ItemSet::Sorted(v) => v.binary_search(&item).is_ok(),
        }
    }

    pub fn union(self, other: ItemSet) -> ItemSet {
        match (self, other) {
            (ItemSet::All, _) | (_, ItemSet::All) => ItemSet::All,
            (ItemSet::Sorted(a), ItemSet::Sorted(b)) => ItemSet::Sorted(union_sorted(&a, &b)),
        }
    }

    pub fn intersect(self, other: &ItemSet) -> ItemSet {
        match (self, other) {
            (s, ItemSet::All) => s,
            (ItemSet::All, ItemSet::Sorted(b)) => ItemSet::Sorted(b.clone()),
            (ItemSet::Sorted(a), ItemSet::Sorted(b)) => ItemSet::Sorted(intersect_sorted(&a, b)),
        }
    }
}

/// Merge two sorted deduplicated lists into their sorted union.
pub fn union_sorted(a: &[ItemId], b: &[ItemId]) -> Vec<ItemId> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

pub fn intersect_sorted(a: &[ItemId], b: &[ItemId]) -> Vec<ItemId> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

/// Elements of `a` not present in `b`; both inputs sorted and deduplicated.
pub fn diff_sorted(a: &[ItemId], b: &[ItemId]) -> Vec<ItemId> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() {
        if j >= b.len() || a[i] < b[j] {
            out.push(a[i]);
            i += 1;
        } else if a[i] > b[j] {
            j += 1;
        } else {
            i += 1;
            j += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[i64]) -> Vec<ItemId> {
        v.iter().map(|&i| ItemId(i)).collect()
    }

    #[test]
    fn sorted_set_algebra() {
        let a = ids(&[1, 3, 5, 7]);
        let b = ids(&[2, 3, 6, 7, 9]);
        assert_eq!(union_sorted(&a, &b), ids(&[1, 2, 3, 5, 6, 7, 9]));
        assert_eq!(intersect_sorted(&a, &b), ids(&[3, 7]));
        assert_eq!(diff_sorted(&a, &b), ids(&[1, 5]));
        assert_eq!(diff_sorted(&b, &a), ids(&[2, 6, 9]));
    }

    #[test]
    fn item_set_union_with_all_is_all() {
        let s = ItemSet::Sorted(ids(&[1, 2]));
        assert_eq!(s.union(ItemSet::All), ItemSet::All);
    }

    #[test]
    fn item_set_intersect_defers_to_explicit_side() {
        let s = ItemSet::All.intersect(&ItemSet::Sorted(ids(&[4, 8])));
        assert_eq!(s, ItemSet::Sorted(ids(&[4, 8])));
    }

    #[test]
    fn from_unsorted_sorts_and_dedups() {
        let s = ItemSet::from_unsorted(ids(&[5, 1, 5, 3, 1]));
        assert_eq!(s, ItemSet::Sorted(ids(&[1, 3, 5])));
    }
}
