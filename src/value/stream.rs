//! Flat byte-stream encoding for values, used when a value nests inside
//! another attribute's stored form (an `AttributeMap` as a blob). The
//! format is little-endian and length-prefixed; map entries carry the
//! attribute's string id rather than a numeric handle so blobs written by
//! one process remain readable by any other.

use crate::error::{DbError, DbResult};
use crate::types::ItemId;
use crate::value::{AttributeMap, Composition, ScalarKind, Value};

pub struct ValueWriter {
    buf: Vec<u8>,
}

impl ValueWriter {
    pub fn new() -> ValueWriter {
        ValueWriter { buf: Vec::new() }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.write_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    pub fn write_str(&mut self, v: &str) {
        self.write_bytes(v.as_bytes());
    }
}

impl Default for ValueWriter {
    fn default() -> Self {
        ValueWriter::new()
    }
}

pub struct ValueReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ValueReader<'a> {
    pub fn new(buf: &'a [u8]) -> ValueReader<'a> {
        ValueReader { buf, pos: 0 }
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn corrupt(what: &str) -> DbError {
        DbError::Validation(format!("corrupt value stream: {what}"))
    }

    fn take(&mut self, n: usize) -> DbResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| Self::corrupt("truncated"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> DbResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> DbResult<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn read_i64(&mut self) -> DbResult<i64> {
        let raw = self.take(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(i64::from_le_bytes(bytes))
    }

    pub fn read_bytes(&mut self) -> DbResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    pub fn read_str(&mut self) -> DbResult<&'a str> {
        std::str::from_utf8(self.read_bytes()?).map_err(|_| Self::corrupt("invalid utf-8"))
    }
}

/// Write a value with a leading kind tag.
pub fn write_tagged_value(w: &mut ValueWriter, value: &Value) {
    w.write_u8(value.kind().tag());
    write_payload(w, value);
}

fn write_payload(w: &mut ValueWriter, value: &Value) {
    match value {
        Value::Str(s) => w.write_str(s),
        Value::Int(i) | Value::Timestamp(i) => w.write_i64(*i),
        Value::Bool(b) => w.write_u8(*b as u8),
        Value::Decimal(d) => w.write_str(d),
        Value::Bytes(b) => w.write_bytes(b),
        Value::Ref(item) => w.write_i64(item.raw()),
        Value::Map(map) => write_map(w, map),
    }
}

pub fn read_tagged_value(r: &mut ValueReader<'_>) -> DbResult<Value> {
    let tag = r.read_u8()?;
    let kind = ScalarKind::from_tag(tag)
        .ok_or_else(|| DbError::Validation(format!("corrupt value stream: kind tag {tag}")))?;
    read_payload(r, kind)
}

fn read_payload(r: &mut ValueReader<'_>, kind: ScalarKind) -> DbResult<Value> {
    Ok(match kind {
        ScalarKind::Str => Value::Str(r.read_str()?.to_owned()),
        ScalarKind::Int => Value::Int(r.read_i64()?),
        ScalarKind::Bool => Value::Bool(r.read_u8()? != 0),
        ScalarKind::Timestamp => Value::Timestamp(r.read_i64()?),
        ScalarKind::Decimal => Value::Decimal(r.read_str()?.to_owned()),
        ScalarKind::Bytes => Value::Bytes(r.read_bytes()?.to_owned()),
        ScalarKind::Ref => Value::Ref(ItemId(r.read_i64()?)),
        ScalarKind::ValueMap => Value::Map(read_map(r)?),
    })
}

/// Map layout: entry count, then per entry the attribute string id, the
/// composition tag, the kind tag, the value count, and the untagged value
/// payloads (the kind is fixed by the entry header).
pub fn write_map(w: &mut ValueWriter, map: &AttributeMap) {
    w.write_u32(map.len() as u32);
    for (id, entry) in map.iter() {
        w.write_str(id);
        w.write_u8(entry.composition.tag());
        w.write_u8(entry.kind.tag());
        w.write_u32(entry.values.len() as u32);
        for value in &entry.values {
            write_payload(w, value);
        }
    }
}

pub fn read_map(r: &mut ValueReader<'_>) -> DbResult<AttributeMap> {
    let count = r.read_u32()?;
    let mut map = AttributeMap::new();
    for _ in 0..count {
        let id = r.read_str()?.to_owned();
        let composition = Composition::from_tag(r.read_u8()?)
            .ok_or_else(|| DbError::Validation("corrupt value stream: composition tag".into()))?;
        let kind = ScalarKind::from_tag(r.read_u8()?)
            .ok_or_else(|| DbError::Validation("corrupt value stream: kind tag".into()))?;
        let n = r.read_u32()? as usize;
        let mut values = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            let value = read_payload(r, kind)?;
            if value.kind() != kind {
                return Err(DbError::Validation(
                    "corrupt value stream: kind mismatch".into(),
                ));
            }
            values.push(value);
        }
        map.put_many(id, kind, composition, values);
    }
    Ok(map)
}
