//! Comparable, type-tagged key values.
//!
//! Keys are a tagged sum over {Int64, String, Float64, Bool, Timestamp}. Every
//! variant is totally ordered; NaN is rejected at construction so `Key` can
//! implement `Ord` directly instead of only `PartialOrd`. Comparing two keys
//! of different variants is a programming error — cross-variant comparison is
//! undefined behavior — and panics via `cmp`'s `unreachable!`, surfacing the
//! invariant violation loudly rather than returning a silently-wrong answer.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::io::{self, Read, Write};

use crate::errors::{DbError, DbResult};

/// The type tag of an index's key column. Every key stored in a given index
/// must share this tag — callers must provide keys of the declared index
/// type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    Int64,
    Str,
    F64,
    Bool,
    Timestamp,
}

/// A single comparable key value. `Timestamp` is nanoseconds since the Unix
/// epoch, stored as a plain `i64` rather than pulling in a datetime crate —
/// it is only ever treated as an orderable integer here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Key {
    Int64(i64),
    Str(String),
    F64(OrderedFloat<f64>),
    Bool(bool),
    Timestamp(i64),
}

impl Eq for Key {}

impl Key {
    /// Constructs a float key, rejecting NaN.
    pub fn f64(v: f64) -> DbResult<Self> {
        if v.is_nan() {
            return Err(DbError::InvariantViolation("NaN is not a valid key".into()));
        }
        Ok(Self::F64(OrderedFloat(v)))
    }

    #[must_use]
    pub const fn key_type(&self) -> KeyType {
        match self {
            Self::Int64(_) => KeyType::Int64,
            Self::Str(_) => KeyType::Str,
            Self::F64(_) => KeyType::F64,
            Self::Bool(_) => KeyType::Bool,
            Self::Timestamp(_) => KeyType::Timestamp,
        }
    }

    /// Tagged binary encoding: 1-byte tag followed by the value.
    /// `{1: Int, 2: String, 3: Bool, 4: Float, 5: Date}`.
    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            Self::Int64(v) => {
                w.write_all(&[1])?;
                w.write_all(&v.to_le_bytes())
            }
            Self::Str(s) => {
                w.write_all(&[2])?;
                let bytes = s.as_bytes();
                let len = u16::try_from(bytes.len())
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "string key too long"))?;
                w.write_all(&len.to_le_bytes())?;
                w.write_all(bytes)
            }
            Self::Bool(b) => w.write_all(&[3, u8::from(*b)]),
            Self::F64(v) => {
                w.write_all(&[4])?;
                w.write_all(&v.0.to_le_bytes())
            }
            Self::Timestamp(v) => {
                w.write_all(&[5])?;
                w.write_all(&v.to_le_bytes())
            }
        }
    }

    #[must_use]
    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf).expect("encoding to a Vec cannot fail");
        buf
    }

    /// Decodes a tagged key as written by [`Key::encode`].
    pub fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut tag = [0u8; 1];
        r.read_exact(&mut tag)?;
        match tag[0] {
            1 => {
                let mut buf = [0u8; 8];
                r.read_exact(&mut buf)?;
                Ok(Self::Int64(i64::from_le_bytes(buf)))
            }
            2 => {
                let mut len_buf = [0u8; 2];
                r.read_exact(&mut len_buf)?;
                let len = u16::from_le_bytes(len_buf) as usize;
                let mut bytes = vec![0u8; len];
                r.read_exact(&mut bytes)?;
                String::from_utf8(bytes)
                    .map(Self::Str)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            }
            3 => {
                let mut buf = [0u8; 1];
                r.read_exact(&mut buf)?;
                Ok(Self::Bool(buf[0] != 0))
            }
            4 => {
                let mut buf = [0u8; 8];
                r.read_exact(&mut buf)?;
                let v = f64::from_le_bytes(buf);
                if v.is_nan() {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "NaN key"));
                }
                Ok(Self::F64(OrderedFloat(v)))
            }
            5 => {
                let mut buf = [0u8; 8];
                r.read_exact(&mut buf)?;
                Ok(Self::Timestamp(i64::from_le_bytes(buf)))
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown key tag {other}"),
            )),
        }
    }

    pub fn decode_from_slice(bytes: &[u8]) -> io::Result<Self> {
        let mut cursor = bytes;
        Self::decode(&mut cursor)
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Int64(a), Self::Int64(b)) => a.cmp(b),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            (Self::F64(a), Self::F64(b)) => a.cmp(b),
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Timestamp(a), Self::Timestamp(b)) => a.cmp(b),
            _ => unreachable!(
                "cross-variant key comparison ({:?} vs {:?}) is undefined behavior",
                self.key_type(),
                other.key_type()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_variant() {
        let keys = vec![
            Key::Int64(-42),
            Key::Str("hello".into()),
            Key::f64(3.25).unwrap(),
            Key::Bool(true),
            Key::Timestamp(1_700_000_000_000_000_000),
        ];
        for k in keys {
            let bytes = k.encode_to_vec();
            let decoded = Key::decode_from_slice(&bytes).unwrap();
            assert_eq!(k, decoded);
        }
    }

    #[test]
    fn bool_orders_false_before_true() {
        assert!(Key::Bool(false) < Key::Bool(true));
    }

    #[test]
    fn nan_rejected() {
        assert!(Key::f64(f64::NAN).is_err());
    }

    #[test]
    fn ints_total_order() {
        let mut v = vec![Key::Int64(5), Key::Int64(-3), Key::Int64(0)];
        v.sort();
        assert_eq!(v, vec![Key::Int64(-3), Key::Int64(0), Key::Int64(5)]);
    }
}
