//! Record and header layout.
//!
//! The 24-byte header is hand-encoded to pin an exact wire layout; the
//! payload behind it is a length-prefixed, `bincode`-encoded [`WalPayload`],
//! with the fixed header carrying the entry tag, LSN, and checksum needed
//! to validate a record independent of decoding its payload.

use serde::{Deserialize, Serialize};

use crate::errors::{DbError, DbResult};

pub const WAL_MAGIC: u32 = 0xDEAD_BEEF;
pub const WAL_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 24;
pub const PAYLOAD_LEN_LIMIT: u32 = 1 << 30; // 1 GiB; guards against a corrupt length field allocating unboundedly.

/// One WAL entry kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
    Insert = 0,
    Update = 1,
    Delete = 2,
    MultiInsert = 3,
    Begin = 4,
    Commit = 5,
    Abort = 6,
}

impl TryFrom<u8> for EntryType {
    type Error = DbError;

    fn try_from(v: u8) -> DbResult<Self> {
        Ok(match v {
            0 => Self::Insert,
            1 => Self::Update,
            2 => Self::Delete,
            3 => Self::MultiInsert,
            4 => Self::Begin,
            5 => Self::Commit,
            6 => Self::Abort,
            other => return Err(DbError::Corruption(format!("unknown WAL entry type {other}"))),
        })
    }
}

/// The fixed 24-byte header preceding every record's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    pub entry_type: EntryType,
    pub lsn: u64,
    pub payload_len: u32,
    pub crc32: u32,
}

impl WalHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&WAL_MAGIC.to_le_bytes());
        buf[4] = WAL_VERSION;
        buf[5] = self.entry_type as u8;
        buf[6..8].copy_from_slice(&0u16.to_le_bytes());
        buf[8..16].copy_from_slice(&self.lsn.to_le_bytes());
        buf[16..20].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[20..24].copy_from_slice(&self.crc32.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> DbResult<Self> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != WAL_MAGIC {
            return Err(DbError::Corruption("bad WAL record magic".into()));
        }
        let version = buf[4];
        if version != WAL_VERSION {
            return Err(DbError::Corruption(format!("unsupported WAL record version {version}")));
        }
        let entry_type = EntryType::try_from(buf[5])?;
        let lsn = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let payload_len = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        if payload_len > PAYLOAD_LEN_LIMIT {
            return Err(DbError::Corruption(format!("WAL payload_len {payload_len} exceeds limit")));
        }
        let crc32 = u32::from_le_bytes(buf[20..24].try_into().unwrap());
        Ok(Self { entry_type, lsn, payload_len, crc32 })
    }
}

/// Payload carried by a record, before the tagged-key/bincode encoding is
/// applied. `key`/`entries` values are [`crate::key::Key::encode_to_vec`]
/// output; `document` is the opaque, already-BSON-encoded row payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalPayload {
    Empty,
    SingleIndex { table: String, index: String, key: Vec<u8>, document: Option<Vec<u8>> },
    MultiInsert { table: String, entries: Vec<(String, Vec<u8>)>, document: Vec<u8> },
}

/// A fully decoded record yielded by [`super::WalReader`].
#[derive(Debug, Clone)]
pub struct WalEntry {
    pub lsn: u64,
    pub entry_type: EntryType,
    pub payload: WalPayload,
}
