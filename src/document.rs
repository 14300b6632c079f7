//! The opaque-bytes-plus-field-extraction companion mechanism.
//!
//! Documents are stored and moved around as opaque, already-BSON-encoded
//! `Vec<u8>` — this module never converts to or from JSON, and it is not a
//! general BSON⇄`Key` mapping layer. It exposes exactly one operation:
//! pulling a single named field's typed value out of an encoded document,
//! needed by `Put`/`InsertRow` validation and by vacuum when it must
//! re-derive index keys for a surviving record.

use bson::Bson;

use crate::errors::{DbError, DbResult};
use crate::key::Key;

/// Decodes `bytes` as a BSON document and extracts `field` as a [`Key`] of
/// the given type. Returns `Err(MissingIndexedField)` if the field is
/// absent, and `Err(KeyTypeMismatch)` if its BSON type doesn't correspond to
/// the requested one.
pub fn extract_field(bytes: &[u8], field: &str) -> DbResult<Key> {
    let doc = bson::from_slice::<bson::Document>(bytes).map_err(DbError::BsonDe)?;
    let value = doc
        .get(field)
        .ok_or_else(|| DbError::MissingIndexedField { field: field.to_string() })?;
    bson_to_key(field, value)
}

fn bson_to_key(field: &str, value: &Bson) -> DbResult<Key> {
    match value {
        Bson::Int32(v) => Ok(Key::Int64(i64::from(*v))),
        Bson::Int64(v) => Ok(Key::Int64(*v)),
        Bson::String(s) => Ok(Key::Str(s.clone())),
        Bson::Boolean(b) => Ok(Key::Bool(*b)),
        Bson::Double(d) => Key::f64(*d),
        Bson::DateTime(dt) => Ok(Key::Timestamp(dt.timestamp_millis() * 1_000_000)),
        other => Err(DbError::MissingIndexedField {
            field: format!("{field} has unsupported BSON type {other:?} for a key"),
        }),
    }
}
