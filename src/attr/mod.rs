//! Attribute definitions and the in-process registry.
//!
//! An attribute couples a stable string id with a scalar kind and a
//! composition. Registration hands back a cheap [`AttrHandle`] used on
//! every hot path; the handle is process-local, while the attribute's
//! durable identity is the item that gets materialized for it on first
//! write.

pub(crate) mod adapter;
pub(crate) mod tables;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{DbError, DbResult};
use crate::types::ItemId;
use crate::value::{Composition, ScalarKind, Value};

use tables::TableDecl;

/// Process-local handle to a registered attribute.
///
/// Handles are dense indexes assigned in registration order. They are
/// not stable across processes; persist the string id instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttrHandle(pub(crate) u32);

impl AttrHandle {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for AttrHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attr#{}", self.0)
    }
}

/// Item id of an attribute's identity (`sys:id` = `"sys:id"`).
pub(crate) const SYS_ID_ITEM: ItemId = ItemId(1);
pub(crate) const SYS_KIND_ITEM: ItemId = ItemId(2);
pub(crate) const SYS_COMPOSITION_ITEM: ItemId = ItemId(3);
pub(crate) const SYS_PROPAGATING_ITEM: ItemId = ItemId(4);

/// Item ids at or below this are reserved for engine use; user items are
/// allocated strictly above.
pub(crate) const LAST_RESERVED_ITEM: i64 = 15;

/// String id of every identified object, including attributes themselves.
pub const SYS_ID: AttrHandle = AttrHandle(0);
/// Scalar kind tag of a materialized attribute.
pub const SYS_KIND: AttrHandle = AttrHandle(1);
/// Composition tag of a materialized attribute.
pub const SYS_COMPOSITION: AttrHandle = AttrHandle(2);
/// Whether a materialized attribute propagates changes to referenced items.
pub const SYS_PROPAGATING: AttrHandle = AttrHandle(3);

/// An attribute definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub id: String,
    pub kind: ScalarKind,
    pub composition: Composition,
    /// When the holder changes, items referenced through this attribute
    /// count as changed too. Only valid for [`ScalarKind::Ref`].
    pub propagating: bool,
}

impl Attribute {
    pub fn scalar(id: impl Into<String>, kind: ScalarKind) -> Attribute {
        Attribute { id: id.into(), kind, composition: Composition::Scalar, propagating: false }
    }

    pub fn set(id: impl Into<String>, kind: ScalarKind) -> Attribute {
        Attribute { id: id.into(), kind, composition: Composition::Set, propagating: false }
    }

    pub fn list(id: impl Into<String>, kind: ScalarKind) -> Attribute {
        Attribute { id: id.into(), kind, composition: Composition::List, propagating: false }
    }

    /// Marks the attribute as change-propagating. Registration rejects
    /// this on non-reference kinds.
    pub fn propagating(mut self) -> Attribute {
        self.propagating = true;
        self
    }
}

/// A name for an item that survives restarts. Resolving one yields the
/// backing item, materializing it on first use inside a write
/// transaction and applying the initial values exactly once.
#[derive(Debug, Clone)]
pub struct IdentifiedObject {
    id: String,
    init: Vec<(AttrHandle, Value)>,
}

impl IdentifiedObject {
    pub fn new(id: impl Into<String>) -> IdentifiedObject {
        IdentifiedObject { id: id.into(), init: Vec::new() }
    }

    /// Adds a value written when the backing item is first materialized.
    pub fn with(mut self, attr: AttrHandle, value: Value) -> IdentifiedObject {
        self.init.push((attr, value));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn init_values(&self) -> &[(AttrHandle, Value)] {
        &self.init
    }
}

/// Everything the storage paths need to know about one attribute.
pub(crate) struct AttrInfo {
    pub handle: AttrHandle,
    pub def: Attribute,
    pub table: TableDecl,
    /// Durable item backing the attribute, fixed for system attributes
    /// and resolved through the identity cache for the rest.
    pub fixed_item: Option<ItemId>,
}

impl AttrInfo {
    fn new(handle: AttrHandle, def: Attribute, fixed_item: Option<ItemId>) -> Arc<AttrInfo> {
        let table = TableDecl::for_attribute(def.kind, def.composition);
        Arc::new(AttrInfo { handle, def, table, fixed_item })
    }

    /// Values written when the attribute's own item is materialized.
    pub(crate) fn identity_init(&self) -> Vec<(AttrHandle, Value)> {
        vec![
            (SYS_KIND, Value::Int(self.def.kind.tag() as i64)),
            (SYS_COMPOSITION, Value::Int(self.def.composition.tag() as i64)),
            (SYS_PROPAGATING, Value::Bool(self.def.propagating)),
        ]
    }
}

struct RegistryInner {
    by_handle: Vec<Arc<AttrInfo>>,
    by_id: HashMap<String, AttrHandle>,
}

/// Append-only registry of attribute definitions.
///
/// Registration is idempotent for identical definitions and rejects
/// redefinition under the same id. Handles stay valid for the life of
/// the process.
pub struct AttributeRegistry {
    inner: RwLock<RegistryInner>,
}

impl AttributeRegistry {
    pub(crate) fn new() -> AttributeRegistry {
        let registry = AttributeRegistry {
            inner: RwLock::new(RegistryInner { by_handle: Vec::new(), by_id: HashMap::new() }),
        };
        let system = [
            (Attribute::scalar("sys:id", ScalarKind::Str), SYS_ID_ITEM),
            (Attribute::scalar("sys:kind", ScalarKind::Int), SYS_KIND_ITEM),
            (Attribute::scalar("sys:composition", ScalarKind::Int), SYS_COMPOSITION_ITEM),
            (Attribute::scalar("sys:propagating", ScalarKind::Bool), SYS_PROPAGATING_ITEM),
        ];
        let mut inner = registry.inner.write();
        for (def, item) in system {
            let handle = AttrHandle(inner.by_handle.len() as u32);
            inner.by_id.insert(def.id.clone(), handle);
            inner.by_handle.push(AttrInfo::new(handle, def, Some(item)));
        }
        drop(inner);
        registry
    }

    pub fn register(&self, def: Attribute) -> DbResult<AttrHandle> {
        if def.id.is_empty() {
            return Err(DbError::attr_config("attribute id must not be empty"));
        }
        if def.propagating && def.kind != ScalarKind::Ref {
            return Err(DbError::attr_config(format!(
                "attribute {} is propagating but holds {} values, not references",
                def.id, def.kind
            )));
        }
        if def.id.starts_with("sys:") && self.resolve(&def.id).is_none() {
            return Err(DbError::attr_config(format!(
                "attribute id {} uses the reserved sys: prefix",
                def.id
            )));
        }
        let mut inner = self.inner.write();
        if let Some(&existing) = inner.by_id.get(&def.id) {
            let known = &inner.by_handle[existing.index()];
            if known.def == def {
                return Ok(existing);
            }
            return Err(DbError::attr_config(format!(
                "attribute {} already registered with a different definition",
                def.id
            )));
        }
        let handle = AttrHandle(inner.by_handle.len() as u32);
        tracing::debug!(id = %def.id, kind = %def.kind, composition = %def.composition, %handle, "registered attribute");
        inner.by_id.insert(def.id.clone(), handle);
        inner.by_handle.push(AttrInfo::new(handle, def, None));
        Ok(handle)
    }

    pub fn resolve(&self, id: &str) -> Option<AttrHandle> {
        self.inner.read().by_id.get(id).copied()
    }

    pub fn definition(&self, handle: AttrHandle) -> Option<Attribute> {
        self.inner
            .read()
            .by_handle
            .get(handle.index())
            .map(|info| info.def.clone())
    }

    pub(crate) fn get(&self, handle: AttrHandle) -> Option<Arc<AttrInfo>> {
        self.inner.read().by_handle.get(handle.index()).cloned()
    }

    pub(crate) fn require(&self, handle: AttrHandle) -> DbResult<Arc<AttrInfo>> {
        self.get(handle)
            .ok_or_else(|| DbError::attr_config(format!("unknown attribute handle {handle}")))
    }

    /// Snapshot of every propagating attribute, for the flush pass.
    pub(crate) fn propagating(&self) -> Vec<Arc<AttrInfo>> {
        self.inner
            .read()
            .by_handle
            .iter()
            .filter(|info| info.def.propagating)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_attributes_are_preregistered() {
        let reg = AttributeRegistry::new();
        assert_eq!(reg.resolve("sys:id"), Some(SYS_ID));
        assert_eq!(reg.resolve("sys:propagating"), Some(SYS_PROPAGATING));
        assert_eq!(reg.len(), 4);
        let info = reg.get(SYS_ID).unwrap();
        assert_eq!(info.fixed_item, Some(SYS_ID_ITEM));
        assert_eq!(info.def.kind, ScalarKind::Str);
    }

    #[test]
    fn registration_is_idempotent_for_identical_defs() {
        let reg = AttributeRegistry::new();
        let a = reg.register(Attribute::scalar("t:title", ScalarKind::Str)).unwrap();
        let b = reg.register(Attribute::scalar("t:title", ScalarKind::Str)).unwrap();
        assert_eq!(a, b);
        assert_eq!(reg.len(), 5);
    }

    #[test]
    fn conflicting_redefinition_is_rejected() {
        let reg = AttributeRegistry::new();
        reg.register(Attribute::scalar("t:title", ScalarKind::Str)).unwrap();
        let err = reg.register(Attribute::set("t:title", ScalarKind::Str)).unwrap_err();
        assert_eq!(err.code().as_str(), "attribute_config");
    }

    #[test]
    fn propagating_requires_ref_kind() {
        let reg = AttributeRegistry::new();
        let err = reg
            .register(Attribute::scalar("t:parent", ScalarKind::Int).propagating())
            .unwrap_err();
        assert_eq!(err.code().as_str(), "attribute_config");
        reg.register(Attribute::scalar("t:parent", ScalarKind::Ref).propagating())
            .unwrap();
    }

    #[test]
    fn sys_prefix_is_reserved() {
        let reg = AttributeRegistry::new();
        assert!(reg.register(Attribute::scalar("sys:custom", ScalarKind::Str)).is_err());
        // Re-registering an existing system attribute stays idempotent.
        let h = reg.register(Attribute::scalar("sys:id", ScalarKind::Str)).unwrap();
        assert_eq!(h, SYS_ID);
    }

    #[test]
    fn identity_init_captures_definition() {
        let reg = AttributeRegistry::new();
        let h = reg
            .register(Attribute::set("t:labels", ScalarKind::Str))
            .unwrap();
        let info = reg.get(h).unwrap();
        let init = info.identity_init();
        assert!(init.contains(&(SYS_KIND, Value::Int(ScalarKind::Str.tag() as i64))));
        assert!(init.contains(&(SYS_COMPOSITION, Value::Int(Composition::Set.tag() as i64))));
        assert!(init.contains(&(SYS_PROPAGATING, Value::Bool(false))));
    }

    #[test]
    fn propagating_snapshot_lists_only_refs() {
        let reg = AttributeRegistry::new();
        reg.register(Attribute::scalar("t:title", ScalarKind::Str)).unwrap();
        let parent = reg
            .register(Attribute::scalar("t:parent", ScalarKind::Ref).propagating())
            .unwrap();
        let props = reg.propagating();
        assert_eq!(props.len(), 1);
        assert_eq!(props[0].handle, parent);
    }
}
