//! Typed values and their wire forms.
//!
//! The store is schema-less at the item level but strictly typed at the
//! value level: every attribute declares one scalar kind and one
//! composition, and every stored value is one of the closed set of kinds
//! below. Kinds are closed on purpose: the byte-stream format (`stream`)
//! and the SQL binding layer (`codec`) both enumerate them exhaustively.

mod codec;
mod map;
mod stream;

pub use codec::{CodecRegistry, ValueCodec};
pub use map::{AttributeMap, MapEntry};
pub use stream::{ValueReader, ValueWriter, read_map, read_tagged_value, write_map, write_tagged_value};

use crate::types::ItemId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar kind of an attribute's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ScalarKind {
    Str = 0,
    Int = 1,
    Bool = 2,
    Timestamp = 3,
    Decimal = 4,
    Bytes = 5,
    Ref = 6,
    ValueMap = 7,
}

pub(crate) const SCALAR_KIND_COUNT: usize = 8;

impl ScalarKind {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<ScalarKind> {
        match tag {
            0 => Some(ScalarKind::Str),
            1 => Some(ScalarKind::Int),
            2 => Some(ScalarKind::Bool),
            3 => Some(ScalarKind::Timestamp),
            4 => Some(ScalarKind::Decimal),
            5 => Some(ScalarKind::Bytes),
            6 => Some(ScalarKind::Ref),
            7 => Some(ScalarKind::ValueMap),
            _ => None,
        }
    }

    /// Kinds with a total order usable in comparison predicates. Decimal
    /// is deliberately excluded: its textual storage form does not order
    /// numerically.
    pub fn is_ordered(self) -> bool {
        matches!(self, ScalarKind::Int | ScalarKind::Timestamp | ScalarKind::Str)
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScalarKind::Str => "str",
            ScalarKind::Int => "int",
            ScalarKind::Bool => "bool",
            ScalarKind::Timestamp => "timestamp",
            ScalarKind::Decimal => "decimal",
            ScalarKind::Bytes => "bytes",
            ScalarKind::Ref => "ref",
            ScalarKind::ValueMap => "value_map",
        };
        f.write_str(s)
    }
}

/// How many values one item may hold for an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Composition {
    Scalar = 0,
    Set = 1,
    List = 2,
}

impl Composition {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Composition> {
        match tag {
            0 => Some(Composition::Scalar),
            1 => Some(Composition::Set),
            2 => Some(Composition::List),
            _ => None,
        }
    }
}

impl fmt::Display for Composition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Composition::Scalar => "scalar",
            Composition::Set => "set",
            Composition::List => "list",
        };
        f.write_str(s)
    }
}

/// One stored value. `Decimal` keeps its normalized textual form exactly;
/// `Timestamp` is milliseconds since the epoch.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    Timestamp(i64),
    Decimal(String),
    Bytes(Vec<u8>),
    Ref(ItemId),
    Map(AttributeMap),
}

impl Value {
    pub fn kind(&self) -> ScalarKind {
        match self {
            Value::Str(_) => ScalarKind::Str,
            Value::Int(_) => ScalarKind::Int,
            Value::Bool(_) => ScalarKind::Bool,
            Value::Timestamp(_) => ScalarKind::Timestamp,
            Value::Decimal(_) => ScalarKind::Decimal,
            Value::Bytes(_) => ScalarKind::Bytes,
            Value::Ref(_) => ScalarKind::Ref,
            Value::Map(_) => ScalarKind::ValueMap,
        }
    }

    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(s.into())
    }

    pub fn int(i: i64) -> Value {
        Value::Int(i)
    }

    pub fn item(item: ItemId) -> Value {
        Value::Ref(item)
    }

    pub fn as_item(&self) -> Option<ItemId> {
        match self {
            Value::Ref(item) => Some(*item),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Timestamp(t) => write!(f, "@{t}"),
            Value::Decimal(d) => write!(f, "{d}d"),
            Value::Bytes(b) => write!(f, "bytes[{}]", b.len()),
            Value::Ref(item) => write!(f, "{item}"),
            Value::Map(m) => write!(f, "map[{}]", m.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_round_trip() {
        for tag in 0..SCALAR_KIND_COUNT as u8 {
            let kind = ScalarKind::from_tag(tag).unwrap();
            assert_eq!(kind.tag(), tag);
        }
        assert!(ScalarKind::from_tag(99).is_none());
    }

    #[test]
    fn decimal_is_not_ordered() {
        assert!(ScalarKind::Int.is_ordered());
        assert!(ScalarKind::Str.is_ordered());
        assert!(!ScalarKind::Decimal.is_ordered());
        assert!(!ScalarKind::Ref.is_ordered());
    }

    #[test]
    fn value_reports_its_kind() {
        assert_eq!(Value::str("x").kind(), ScalarKind::Str);
        assert_eq!(Value::item(ItemId(4)).kind(), ScalarKind::Ref);
        assert_eq!(Value::Decimal("1.50".into()).kind(), ScalarKind::Decimal);
    }
}
