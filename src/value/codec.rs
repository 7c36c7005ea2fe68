use crate::error::{DbError, DbResult};
use crate::types::ItemId;
use crate::value::{
    SCALAR_KIND_COUNT, ScalarKind, Value, ValueReader, ValueWriter, read_map, write_map,
};
use rusqlite::types::{Value as SqlValue, ValueRef};
use std::sync::Arc;

/// Translates one scalar kind to and from its SQL column form. Reference
/// values never pass through here: they bind directly as integers.
pub trait ValueCodec: Send + Sync {
    fn kind(&self) -> ScalarKind;

    /// Owned SQL value to bind. Must reject values of the wrong kind.
    fn bind(&self, value: &Value) -> DbResult<SqlValue>;

    /// Decode a column back to a value of this codec's kind.
    fn decode(&self, raw: ValueRef<'_>) -> DbResult<Value>;
}

/// Codec lookup table, built before the store starts and immutable from
/// then on. A kind with no codec is a configuration error surfaced on
/// first use of an attribute of that kind.
#[derive(Clone)]
pub struct CodecRegistry {
    by_kind: [Option<Arc<dyn ValueCodec>>; SCALAR_KIND_COUNT],
}

impl CodecRegistry {
    pub fn empty() -> CodecRegistry {
        CodecRegistry {
            by_kind: Default::default(),
        }
    }

    /// All built-in codecs registered.
    pub fn standard() -> CodecRegistry {
        let mut registry = CodecRegistry::empty();
        for kind in [
            ScalarKind::Str,
            ScalarKind::Int,
            ScalarKind::Bool,
            ScalarKind::Timestamp,
            ScalarKind::Decimal,
            ScalarKind::Bytes,
            ScalarKind::Ref,
            ScalarKind::ValueMap,
        ] {
            registry.put(Arc::new(BuiltinCodec { kind }));
        }
        registry
    }

    /// Register or replace the codec for `codec.kind()`.
    pub fn put(&mut self, codec: Arc<dyn ValueCodec>) {
        let slot = codec.kind().tag() as usize;
        self.by_kind[slot] = Some(codec);
    }

    pub fn remove(&mut self, kind: ScalarKind) {
        self.by_kind[kind.tag() as usize] = None;
    }

    pub fn get(&self, kind: ScalarKind) -> Option<&Arc<dyn ValueCodec>> {
        self.by_kind[kind.tag() as usize].as_ref()
    }

    pub(crate) fn require(&self, kind: ScalarKind, attribute: &str) -> DbResult<&Arc<dyn ValueCodec>> {
        self.get(kind).ok_or_else(|| DbError::MissingCodec {
            attribute: attribute.to_owned(),
            kind: kind.to_string(),
        })
    }
}

struct BuiltinCodec {
    kind: ScalarKind,
}

impl BuiltinCodec {
    fn mismatch(&self, value: &Value) -> DbError {
        DbError::Validation(format!(
            "value of kind {} bound where {} expected",
            value.kind(),
            self.kind
        ))
    }

    fn bad_column(&self, raw: &ValueRef<'_>) -> DbError {
        DbError::Validation(format!(
            "column type {:?} does not decode as {}",
            raw.data_type(),
            self.kind
        ))
    }
}

impl ValueCodec for BuiltinCodec {
    fn kind(&self) -> ScalarKind {
        self.kind
    }

    fn bind(&self, value: &Value) -> DbResult<SqlValue> {
        if value.kind() != self.kind {
            return Err(self.mismatch(value));
        }
        Ok(match value {
            Value::Str(s) => SqlValue::Text(s.clone()),
            Value::Int(i) | Value::Timestamp(i) => SqlValue::Integer(*i),
            Value::Bool(b) => SqlValue::Integer(*b as i64),
            Value::Decimal(d) => SqlValue::Text(d.clone()),
            Value::Bytes(b) => SqlValue::Blob(b.clone()),
            Value::Ref(item) => SqlValue::Integer(item.raw()),
            Value::Map(map) => {
                let mut w = ValueWriter::new();
                write_map(&mut w, map);
                SqlValue::Blob(w.into_bytes())
            }
        })
    }

    fn decode(&self, raw: ValueRef<'_>) -> DbResult<Value> {
        Ok(match (self.kind, raw) {
            (ScalarKind::Str, ValueRef::Text(t)) => Value::Str(
                std::str::from_utf8(t)
                    .map_err(|_| DbError::Validation("stored text is not utf-8".into()))?
                    .to_owned(),
            ),
            (ScalarKind::Int, ValueRef::Integer(i)) => Value::Int(i),
            (ScalarKind::Bool, ValueRef::Integer(i)) => Value::Bool(i != 0),
            (ScalarKind::Timestamp, ValueRef::Integer(i)) => Value::Timestamp(i),
            (ScalarKind::Decimal, ValueRef::Text(t)) => Value::Decimal(
                std::str::from_utf8(t)
                    .map_err(|_| DbError::Validation("stored decimal is not utf-8".into()))?
                    .to_owned(),
            ),
            (ScalarKind::Bytes, ValueRef::Blob(b)) => Value::Bytes(b.to_owned()),
            (ScalarKind::Ref, ValueRef::Integer(i)) => Value::Ref(ItemId(i)),
            (ScalarKind::ValueMap, ValueRef::Blob(b)) => {
                let mut r = ValueReader::new(b);
                Value::Map(read_map(&mut r)?)
            }
            (_, other) => return Err(self.bad_column(&other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::AttributeMap;

    #[test]
    fn standard_registry_covers_every_kind() {
        let registry = CodecRegistry::standard();
        for tag in 0..SCALAR_KIND_COUNT as u8 {
            let kind = ScalarKind::from_tag(tag).unwrap();
            assert!(registry.get(kind).is_some(), "missing codec for {kind}");
        }
    }

    #[test]
    fn missing_codec_is_a_typed_error() {
        let mut registry = CodecRegistry::standard();
        registry.remove(ScalarKind::Decimal);
        let err = match registry.require(ScalarKind::Decimal, "jira:estimate") {
            Ok(_) => panic!("codec was removed"),
            Err(err) => err,
        };
        assert!(matches!(err, DbError::MissingCodec { .. }));
        assert!(err.to_string().contains("jira:estimate"));
    }

    #[test]
    fn bind_rejects_wrong_kind() {
        let registry = CodecRegistry::standard();
        let codec = registry.get(ScalarKind::Int).unwrap();
        assert!(codec.bind(&Value::str("not an int")).is_err());
        assert!(codec.bind(&Value::int(5)).is_ok());
    }

    #[test]
    fn sql_round_trip_per_kind() {
        let registry = CodecRegistry::standard();
        let mut map = AttributeMap::new();
        map.put_scalar("k", Value::int(9));
        let values = [
            Value::str("s"),
            Value::int(-1),
            Value::Bool(true),
            Value::Timestamp(123),
            Value::Decimal("0.5".into()),
            Value::Bytes(vec![7, 8]),
            Value::Ref(ItemId(31)),
            Value::Map(map),
        ];
        for value in &values {
            let codec = registry.get(value.kind()).unwrap();
            let sql = codec.bind(value).expect("bind");
            let back = codec.decode(ValueRef::from(&sql)).expect("decode");
            assert_eq!(&back, value);
        }
    }
}
