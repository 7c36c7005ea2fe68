use crate::value::{Composition, ScalarKind, Value};
use std::collections::BTreeMap;

/// A self-contained attribute→values map, keyed by attribute string id so
/// it survives serialization across processes and handle renumbering.
/// This is the payload type for `ScalarKind::ValueMap` attributes (e.g. a
/// snapshot of an item's state stored inside another item).
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttributeMap {
    entries: BTreeMap<String, MapEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapEntry {
    pub kind: ScalarKind,
    pub composition: Composition,
    pub values: Vec<Value>,
}

impl AttributeMap {
    pub fn new() -> AttributeMap {
        AttributeMap::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store a single scalar value under `id`, replacing any prior entry.
    pub fn put_scalar(&mut self, id: impl Into<String>, value: Value) {
        let kind = value.kind();
        self.entries.insert(
            id.into(),
            MapEntry {
                kind,
                composition: Composition::Scalar,
                values: vec![value],
            },
        );
    }

    /// Store a collection under `id`. An empty collection is a legal entry
    /// (it records "present but empty", unlike a missing entry).
    pub fn put_many(
        &mut self,
        id: impl Into<String>,
        kind: ScalarKind,
        composition: Composition,
        values: Vec<Value>,
    ) {
        self.entries.insert(
            id.into(),
            MapEntry {
                kind,
                composition,
                values,
            },
        );
    }

    pub fn remove(&mut self, id: &str) -> Option<MapEntry> {
        self.entries.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&MapEntry> {
        self.entries.get(id)
    }

    pub fn scalar(&self, id: &str) -> Option<&Value> {
        match self.entries.get(id) {
            Some(entry) if entry.composition == Composition::Scalar => entry.values.first(),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MapEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_entries_replace() {
        let mut map = AttributeMap::new();
        map.put_scalar("jira:summary", Value::str("first"));
        map.put_scalar("jira:summary", Value::str("second"));
        assert_eq!(map.len(), 1);
        assert_eq!(map.scalar("jira:summary"), Some(&Value::str("second")));
    }

    #[test]
    fn empty_collection_differs_from_absence() {
        let mut map = AttributeMap::new();
        map.put_many("jira:labels", ScalarKind::Str, Composition::Set, vec![]);
        assert!(map.get("jira:labels").is_some());
        assert!(map.get("jira:components").is_none());
        assert!(map.scalar("jira:labels").is_none());
    }

    #[test]
    fn maps_nest() {
        let mut inner = AttributeMap::new();
        inner.put_scalar("a", Value::int(1));
        let mut outer = AttributeMap::new();
        outer.put_scalar("shadow", Value::Map(inner.clone()));
        assert_eq!(outer.scalar("shadow"), Some(&Value::Map(inner)));
    }
}
