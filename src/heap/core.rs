//! Append-only record file with in-place tombstone marking.
//!
//! Layout: a 14-byte file header (`magic: u32, version: u16, next_offset:
//! i64`) followed by a stream of records, each `length: u32, valid: u8,
//! create_lsn: u64, delete_lsn: u64, prev_offset: i64, data: [u8; length]`.
//! Offsets are absolute byte positions from the start of the file.
//!
//! I/O uses positioned reads/writes (`FileExt::read_at`/`write_at`) rather
//! than a shared seek cursor, so a `read` never contends with a concurrent
//! `write` for the file's position — only the logical region each touches.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;

use crate::errors::{DbError, DbResult};

const FILE_MAGIC: u32 = 0x4845_4150;
const FILE_VERSION: u16 = 1;
const FILE_HEADER_LEN: u64 = 14;

const RECORD_HEADER_LEN: usize = 4 + 1 + 8 + 8 + 8;

/// The fixed header preceding every heap record's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub length: u32,
    pub valid: bool,
    pub create_lsn: u64,
    pub delete_lsn: u64,
    pub prev_offset: i64,
}

impl RecordHeader {
    fn encode(&self) -> [u8; RECORD_HEADER_LEN] {
        let mut buf = [0u8; RECORD_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4] = u8::from(self.valid);
        buf[5..13].copy_from_slice(&self.create_lsn.to_le_bytes());
        buf[13..21].copy_from_slice(&self.delete_lsn.to_le_bytes());
        buf[21..29].copy_from_slice(&self.prev_offset.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; RECORD_HEADER_LEN]) -> Self {
        Self {
            length: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            valid: buf[4] != 0,
            create_lsn: u64::from_le_bytes(buf[5..13].try_into().unwrap()),
            delete_lsn: u64::from_le_bytes(buf[13..21].try_into().unwrap()),
            prev_offset: i64::from_le_bytes(buf[21..29].try_into().unwrap()),
        }
    }
}

/// A single heap file. `write`/`delete` briefly hold `write_latch`; `read`
/// and `iterate` never block on it — reads may proceed in parallel with
/// writes.
pub struct HeapFile {
    file: File,
    path: PathBuf,
    next_offset: AtomicI64,
    write_latch: Mutex<()>,
}

impl HeapFile {
    /// Creates a fresh heap file, failing if one already exists at `path`.
    pub fn create(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        let mut header = [0u8; FILE_HEADER_LEN as usize];
        header[0..4].copy_from_slice(&FILE_MAGIC.to_le_bytes());
        header[4..6].copy_from_slice(&FILE_VERSION.to_le_bytes());
        header[6..14].copy_from_slice(&(FILE_HEADER_LEN as i64).to_le_bytes());
        file.write_at(&header, 0)?;
        file.sync_all()?;
        Ok(Self {
            file,
            path,
            next_offset: AtomicI64::new(FILE_HEADER_LEN as i64),
            write_latch: Mutex::new(()),
        })
    }

    /// Opens an existing heap file. `next_offset` is recomputed from the
    /// physical file size rather than trusted from the stored header field,
    /// so a heap reopened after a crash (header update lost) is still
    /// correct: the logical end of the heap is always the physical file
    /// size after recovery.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut header = [0u8; FILE_HEADER_LEN as usize];
        file.read_exact_at(&mut header, 0)
            .map_err(|_| DbError::Corruption(format!("{}: truncated heap header", path.display())))?;
        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let version = u16::from_le_bytes(header[4..6].try_into().unwrap());
        if magic != FILE_MAGIC {
            return Err(DbError::Corruption(format!("{}: bad heap magic", path.display())));
        }
        if version != FILE_VERSION {
            return Err(DbError::Corruption(format!("{}: unsupported heap version {version}", path.display())));
        }
        let len = file.metadata()?.len();
        let next_offset = i64::try_from(len)
            .map_err(|_| DbError::Corruption(format!("{}: heap file too large", path.display())))?;
        Ok(Self {
            file,
            path,
            next_offset: AtomicI64::new(next_offset),
            write_latch: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current logical end of the heap, i.e. the offset the next `write`
    /// will return.
    pub fn next_offset(&self) -> i64 {
        self.next_offset.load(Ordering::Acquire)
    }

    /// Appends a new record, returning its absolute offset.
    pub fn write(&self, data: &[u8], create_lsn: u64, prev_offset: i64) -> DbResult<i64> {
        let _guard = self.write_latch.lock();
        let offset = self.next_offset.load(Ordering::Acquire);
        let header = RecordHeader {
            length: u32::try_from(data.len())
                .map_err(|_| DbError::InvariantViolation("heap record too large".into()))?,
            valid: true,
            create_lsn,
            delete_lsn: 0,
            prev_offset,
        };
        let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + data.len());
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(data);
        self.file.write_at(&buf, offset as u64)?;

        let new_next = offset + buf.len() as i64;
        self.next_offset.store(new_next, Ordering::Release);
        self.file.write_at(&new_next.to_le_bytes(), 6)?;
        Ok(offset)
    }

    /// Reads the record at `offset`. Safe to call concurrently with `write`.
    pub fn read(&self, offset: i64) -> DbResult<(Vec<u8>, RecordHeader)> {
        if offset < FILE_HEADER_LEN as i64 || offset >= self.next_offset() {
            return Err(DbError::Corruption(format!("heap read offset {offset} out of range")));
        }
        let mut header_buf = [0u8; RECORD_HEADER_LEN];
        self.file
            .read_exact_at(&mut header_buf, offset as u64)
            .map_err(|_| DbError::Corruption(format!("short heap record header at offset {offset}")))?;
        let header = RecordHeader::decode(&header_buf);
        let mut data = vec![0u8; header.length as usize];
        self.file
            .read_exact_at(&mut data, offset as u64 + RECORD_HEADER_LEN as u64)
            .map_err(|_| DbError::Corruption(format!("short heap record payload at offset {offset}")))?;
        Ok((data, header))
    }

    /// Marks the record at `offset` as a tombstone. A repeat call on an
    /// already-dead record is a no-op preserving the earliest `delete_lsn`.
    pub fn delete(&self, offset: i64, delete_lsn: u64) -> DbResult<()> {
        if delete_lsn == 0 {
            return Err(DbError::InvariantViolation("delete_lsn must be > 0".into()));
        }
        let _guard = self.write_latch.lock();
        if offset < FILE_HEADER_LEN as i64 || offset >= self.next_offset() {
            return Err(DbError::Corruption(format!("heap delete offset {offset} out of range")));
        }
        let mut header_buf = [0u8; RECORD_HEADER_LEN];
        self.file
            .read_exact_at(&mut header_buf, offset as u64)
            .map_err(|_| DbError::Corruption(format!("short heap record header at offset {offset}")))?;
        let header = RecordHeader::decode(&header_buf);
        if !header.valid {
            return Ok(());
        }
        self.file.write_at(&[0u8], offset as u64 + 4)?;
        self.file
            .write_at(&delete_lsn.to_le_bytes(), offset as u64 + 13)?;
        Ok(())
    }

    /// Linear scan over every record from the first data offset to the
    /// current logical end, in `(offset, header, data)` order.
    pub fn iterate(&self) -> DbResult<HeapIter<'_>> {
        Ok(HeapIter {
            heap: self,
            cursor: FILE_HEADER_LEN as i64,
            end: self.next_offset(),
        })
    }

    pub fn sync(&self) -> DbResult<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

pub struct HeapIter<'a> {
    heap: &'a HeapFile,
    cursor: i64,
    end: i64,
}

impl<'a> Iterator for HeapIter<'a> {
    type Item = DbResult<(i64, RecordHeader, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.end {
            return None;
        }
        let offset = self.cursor;
        match self.heap.read(offset) {
            Ok((data, header)) => {
                self.cursor = offset + RECORD_HEADER_LEN as i64 + header.length as i64;
                Some(Ok((offset, header, data)))
            }
            Err(e) => {
                self.cursor = self.end;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_round_trip() {
        let dir = tempdir().unwrap();
        let heap = HeapFile::create(dir.path().join("t.heap")).unwrap();
        let off = heap.write(b"hello", 1, -1).unwrap();
        let (data, header) = heap.read(off).unwrap();
        assert_eq!(data, b"hello");
        assert!(header.valid);
        assert_eq!(header.create_lsn, 1);
        assert_eq!(header.prev_offset, -1);
    }

    #[test]
    fn delete_marks_tombstone_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let heap = HeapFile::create(dir.path().join("t.heap")).unwrap();
        let off = heap.write(b"v1", 1, -1).unwrap();
        heap.delete(off, 5).unwrap();
        let (_, header) = heap.read(off).unwrap();
        assert!(!header.valid);
        assert_eq!(header.delete_lsn, 5);

        heap.delete(off, 9).unwrap();
        let (_, header) = heap.read(off).unwrap();
        assert_eq!(header.delete_lsn, 5, "later delete must not overwrite earlier delete_lsn");
    }

    #[test]
    fn version_chain_links_by_prev_offset() {
        let dir = tempdir().unwrap();
        let heap = HeapFile::create(dir.path().join("t.heap")).unwrap();
        let off1 = heap.write(b"v1", 1, -1).unwrap();
        let off2 = heap.write(b"v2", 2, off1).unwrap();
        let (_, header2) = heap.read(off2).unwrap();
        assert_eq!(header2.prev_offset, off1);
    }

    #[test]
    fn reopen_recomputes_next_offset_from_file_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.heap");
        {
            let heap = HeapFile::create(&path).unwrap();
            heap.write(b"abc", 1, -1).unwrap();
        }
        let reopened = HeapFile::open(&path).unwrap();
        let off = reopened.write(b"def", 2, -1).unwrap();
        assert!(off > FILE_HEADER_LEN as i64);
    }

    #[test]
    fn iterate_visits_every_record() {
        let dir = tempdir().unwrap();
        let heap = HeapFile::create(dir.path().join("t.heap")).unwrap();
        heap.write(b"a", 1, -1).unwrap();
        heap.write(b"bb", 2, -1).unwrap();
        heap.write(b"ccc", 3, -1).unwrap();
        let collected: Vec<_> = heap.iterate().unwrap().collect::<DbResult<Vec<_>>>().unwrap();
        assert_eq!(collected.len(), 3);
        assert_eq!(collected[1].2, b"bb");
    }

    #[test]
    fn read_out_of_range_is_corruption() {
        let dir = tempdir().unwrap();
        let heap = HeapFile::create(dir.path().join("t.heap")).unwrap();
        assert!(matches!(heap.read(1_000_000), Err(DbError::Corruption(_))));
    }
}
