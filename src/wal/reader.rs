//! Sequential WAL reader.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::errors::{DbError, DbResult};

use super::record::{WalEntry, WalHeader, WalPayload, HEADER_LEN};

pub struct WalReader {
    file: File,
}

impl WalReader {
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        Ok(Self { file: File::open(path)? })
    }
}

impl Iterator for WalReader {
    type Item = DbResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut header_buf = [0u8; HEADER_LEN];
        // Distinguish a clean end-of-log (zero bytes available) from a
        // truncated record (some bytes, not enough for a full header).
        let mut read_total = 0usize;
        while read_total < HEADER_LEN {
            match self.file.read(&mut header_buf[read_total..]) {
                Ok(0) => {
                    if read_total == 0 {
                        return None;
                    }
                    return Some(Err(DbError::Corruption("truncated WAL record header".into())));
                }
                Ok(n) => read_total += n,
                Err(e) => return Some(Err(DbError::Io(e))),
            }
        }

        let header = match WalHeader::decode(&header_buf) {
            Ok(h) => h,
            Err(e) => return Some(Err(e)),
        };

        let mut payload = vec![0u8; header.payload_len as usize];
        if let Err(e) = self.file.read_exact(&mut payload) {
            let _ = e;
            return Some(Err(DbError::Corruption("truncated WAL record payload".into())));
        }

        let checksum = crc32fast::hash(&payload);
        if checksum != header.crc32 {
            return Some(Err(DbError::Corruption("WAL record checksum mismatch".into())));
        }

        let decoded: WalPayload = match bincode::serde::decode_from_slice(&payload, bincode::config::standard()) {
            Ok((value, _)) => value,
            Err(e) => return Some(Err(DbError::Decode(e))),
        };

        Some(Ok(WalEntry { lsn: header.lsn, entry_type: header.entry_type, payload: decoded }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::record::EntryType;
    use crate::wal::writer::{SyncPolicy, WalWriter};
    use tempfile::tempdir;

    #[test]
    fn stops_cleanly_at_eof() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let writer = WalWriter::create(&path, SyncPolicy::EveryWrite).unwrap();
            writer.append_marker(1, EntryType::Begin).unwrap();
        }
        let mut reader = WalReader::open(&path).unwrap();
        assert!(reader.next().unwrap().is_ok());
        assert!(reader.next().is_none());
    }

    #[test]
    fn detects_truncated_trailing_record() {
        use std::io::Write as _;
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let writer = WalWriter::create(&path, SyncPolicy::EveryWrite).unwrap();
            writer.append_marker(1, EntryType::Begin).unwrap();
        }
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0xDE]).unwrap();
        }
        let mut reader = WalReader::open(&path).unwrap();
        assert!(reader.next().unwrap().is_ok());
        assert!(matches!(reader.next(), Some(Err(DbError::Corruption(_)))));
    }
}
