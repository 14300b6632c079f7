//! Append-only WAL writer with configurable durability policy.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::errors::DbResult;

use super::record::{EntryType, WalHeader, WalPayload, HEADER_LEN};

/// Durability policy for [`WalWriter::append`].
#[derive(Debug, Clone, Copy)]
pub enum SyncPolicy {
    /// `flush` + `fsync` after every record.
    EveryWrite,
    /// A background thread flushes and fsyncs on a fixed period.
    Interval(Duration),
    /// Flush and fsync once accumulated bytes cross a threshold.
    Batch(usize),
}

struct Inner {
    file: File,
    bytes_since_sync: u64,
}

impl Inner {
    fn sync(&mut self) -> DbResult<()> {
        self.file.flush()?;
        if let Err(e) = self.file.sync_data() {
            log::error!("WAL fsync failed: {e}");
            return Err(e.into());
        }
        self.bytes_since_sync = 0;
        Ok(())
    }
}

/// A single WAL writer. Cloning is not supported — open one per engine and
/// share it behind an `Arc`, matching the "WAL writer: mutex around buffered
/// writer + sync batch state" latch in the concurrency model.
pub struct WalWriter {
    inner: Arc<Mutex<Inner>>,
    policy: SyncPolicy,
    shutdown: Option<mpsc::Sender<()>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl WalWriter {
    pub fn create(path: impl AsRef<Path>, policy: SyncPolicy) -> DbResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Self::from_file(file, policy)
    }

    fn from_file(file: File, policy: SyncPolicy) -> DbResult<Self> {
        let inner = Arc::new(Mutex::new(Inner { file, bytes_since_sync: 0 }));
        let (shutdown, worker) = if let SyncPolicy::Interval(period) = policy {
            let (tx, rx) = mpsc::channel::<()>();
            let bg_inner = inner.clone();
            let handle = thread::spawn(move || {
                loop {
                    match rx.recv_timeout(period) {
                        Ok(()) => break,
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            let _ = bg_inner.lock().sync();
                        }
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
            });
            (Some(tx), Some(handle))
        } else {
            (None, None)
        };
        Ok(Self { inner, policy, shutdown, worker })
    }

    /// Appends one record and applies the configured sync policy.
    pub fn append(&self, lsn: u64, entry_type: EntryType, payload: &WalPayload) -> DbResult<()> {
        let payload_bytes = bincode::serde::encode_to_vec(payload, bincode::config::standard())?;
        let crc32 = crc32fast::hash(&payload_bytes);
        let header = WalHeader {
            entry_type,
            lsn,
            payload_len: payload_bytes.len() as u32,
            crc32,
        };

        let mut inner = self.inner.lock();
        inner.file.write_all(&header.encode())?;
        inner.file.write_all(&payload_bytes)?;

        match self.policy {
            SyncPolicy::EveryWrite => inner.sync()?,
            SyncPolicy::Batch(threshold) => {
                inner.bytes_since_sync += (HEADER_LEN + payload_bytes.len()) as u64;
                if inner.bytes_since_sync >= threshold as u64 {
                    inner.sync()?;
                }
            }
            SyncPolicy::Interval(_) => inner.file.flush()?,
        }
        Ok(())
    }

    /// Convenience wrapper for the empty-payload marker records.
    pub fn append_marker(&self, lsn: u64, entry_type: EntryType) -> DbResult<()> {
        self.append(lsn, entry_type, &WalPayload::Empty)
    }

    /// Stops the background sync thread (if any) and performs a final
    /// flush+fsync.
    pub fn close(&mut self) -> DbResult<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        self.inner.lock().sync()
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::reader::WalReader;
    use tempfile::tempdir;

    #[test]
    fn every_write_policy_is_immediately_readable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let writer = WalWriter::create(&path, SyncPolicy::EveryWrite).unwrap();
            writer.append_marker(1, EntryType::Begin).unwrap();
            writer
                .append(
                    2,
                    EntryType::Insert,
                    &WalPayload::SingleIndex {
                        table: "t".into(),
                        index: "id".into(),
                        key: vec![1, 2, 3],
                        document: Some(vec![4, 5, 6]),
                    },
                )
                .unwrap();
            writer.append_marker(3, EntryType::Commit).unwrap();
        }
        let entries: Vec<_> = WalReader::open(&path)
            .unwrap()
            .collect::<DbResult<Vec<_>>>()
            .unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].lsn, 2);
    }
}
