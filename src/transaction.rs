//! Read transactions (snapshot isolation) and buffered write transactions
//! with BEGIN/COMMIT/ABORT markers.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::IsolationLevel;
use crate::engine::Engine;
use crate::errors::{DbError, DbResult};
use crate::key::Key;
use crate::wal::{EntryType, WalPayload};

/// A read-only transaction with either `ReadCommitted` or `RepeatableRead`
/// visibility.
pub struct ReadTransaction<'e> {
    engine: &'e Engine,
    level: IsolationLevel,
    snapshot_lsn: AtomicU64,
}

impl<'e> ReadTransaction<'e> {
    pub(crate) fn new(engine: &'e Engine, level: IsolationLevel) -> Self {
        let snapshot_lsn = engine.lsn().current();
        engine.registry().register(snapshot_lsn);
        Self { engine, level, snapshot_lsn: AtomicU64::new(snapshot_lsn) }
    }

    /// Refreshes the snapshot under `ReadCommitted`; a no-op under
    /// `RepeatableRead`, whose snapshot is fixed at `begin`.
    fn refresh(&self) -> u64 {
        if self.level == IsolationLevel::RepeatableRead {
            return self.snapshot_lsn.load(Ordering::SeqCst);
        }
        let new = self.engine.lsn().current();
        let old = self.snapshot_lsn.swap(new, Ordering::SeqCst);
        if old != new {
            self.engine.registry().unregister(old);
            self.engine.registry().register(new);
        }
        new
    }

    pub fn get(&self, table: &str, index: &str, key: &Key) -> DbResult<Option<Vec<u8>>> {
        let snapshot_lsn = self.refresh();
        let t = self.engine.catalog().table(table)?;
        let idx = t.index(index)?;
        self.engine.visible_read(&t, &idx, key, snapshot_lsn)
    }

    pub fn scan(&self, table: &str, index: &str, condition: &crate::engine::ScanCondition) -> DbResult<Vec<(Key, Vec<u8>)>> {
        // `ReadCommitted` refreshes once for the whole scan rather than per
        // visited key; `RepeatableRead` reuses the snapshot captured at
        // `begin`. Either way the resulting `snapshot_lsn` is threaded
        // through to `scan_at` so the scan honors this transaction's
        // visibility, not whatever LSN the engine is at when it runs.
        let snapshot_lsn = self.refresh();
        self.engine.scan_at(table, index, condition, snapshot_lsn)
    }

    pub fn snapshot_lsn(&self) -> u64 {
        self.snapshot_lsn.load(Ordering::SeqCst)
    }

    /// Closes the transaction, removing its snapshot from the registry so
    /// vacuum can advance past it.
    pub fn close(self) {
        self.engine.registry().unregister(self.snapshot_lsn.load(Ordering::SeqCst));
    }
}

impl Drop for ReadTransaction<'_> {
    fn drop(&mut self) {
        self.engine.registry().unregister(self.snapshot_lsn.load(Ordering::SeqCst));
    }
}

enum BufferedOp {
    Put { table: String, index: String, key: Key, document: Vec<u8> },
    Del { table: String, index: String, key: Key },
}

/// A buffered multi-op transaction. Operations accumulate in memory until
/// `commit`, which writes a `Begin` marker, one WAL record per op with a
/// freshly allocated LSN, then a `Commit` marker, before applying the ops
/// to heap and tree in the same order.
pub struct WriteTransaction<'e> {
    engine: &'e Engine,
    ops: Vec<BufferedOp>,
    closed: bool,
}

impl<'e> WriteTransaction<'e> {
    pub(crate) fn new(engine: &'e Engine) -> Self {
        Self { engine, ops: Vec::new(), closed: false }
    }

    pub fn put(&mut self, table: impl Into<String>, index: impl Into<String>, key: Key, document: Vec<u8>) -> DbResult<()> {
        self.ops.push(BufferedOp::Put { table: table.into(), index: index.into(), key, document });
        Ok(())
    }

    pub fn del(&mut self, table: impl Into<String>, index: impl Into<String>, key: Key) -> DbResult<()> {
        self.ops.push(BufferedOp::Del { table: table.into(), index: index.into(), key });
        Ok(())
    }

    /// Commits every buffered op, or fails with `TxAlreadyClosed` if this
    /// transaction has already been committed or rolled back.
    pub fn commit(&mut self) -> DbResult<()> {
        if self.closed {
            return Err(DbError::TxAlreadyClosed);
        }
        self.closed = true;

        let begin_lsn = self.engine.lsn().next();
        self.engine.wal().append_marker(begin_lsn, EntryType::Begin)?;

        for op in &self.ops {
            let lsn = self.engine.lsn().next();
            match op {
                BufferedOp::Put { table, index, key, document } => {
                    self.engine.wal().append(
                        lsn,
                        EntryType::Insert,
                        &WalPayload::SingleIndex {
                            table: table.clone(),
                            index: index.clone(),
                            key: key.encode_to_vec(),
                            document: Some(document.clone()),
                        },
                    )?;
                }
                BufferedOp::Del { table, index, key } => {
                    self.engine.wal().append(
                        lsn,
                        EntryType::Delete,
                        &WalPayload::SingleIndex {
                            table: table.clone(),
                            index: index.clone(),
                            key: key.encode_to_vec(),
                            document: None,
                        },
                    )?;
                }
            }
            self.apply(op, lsn)?;
        }

        let commit_lsn = self.engine.lsn().next();
        self.engine.wal().append_marker(commit_lsn, EntryType::Commit)
    }

    /// Discards the buffer without touching heap or tree state, writing an
    /// `Abort` marker for symmetry (recovery relies solely on the `Commit`
    /// marker as its redo gate).
    pub fn rollback(&mut self) -> DbResult<()> {
        if self.closed {
            return Err(DbError::TxAlreadyClosed);
        }
        self.closed = true;
        self.ops.clear();
        let lsn = self.engine.lsn().next();
        self.engine.wal().append_marker(lsn, EntryType::Abort)
    }

    fn apply(&self, op: &BufferedOp, lsn: u64) -> DbResult<()> {
        match op {
            BufferedOp::Put { table, index, key, document } => {
                let t = self.engine.catalog().table(table)?;
                let idx = t.index(index)?;
                let heap = t.heap();
                idx.tree.upsert(key, |old| {
                    let prev = old.unwrap_or(-1);
                    Ok(Some(heap.write(document, lsn, prev)?))
                })
            }
            BufferedOp::Del { table, index, key } => {
                let t = self.engine.catalog().table(table)?;
                let idx = t.index(index)?;
                let heap = t.heap();
                idx.tree.upsert(key, |old| match old {
                    None => Ok(None),
                    Some(offset) => {
                        heap.delete(offset, lsn)?;
                        Ok(Some(offset))
                    }
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::key::KeyType;
    use bson::doc;
    use tempfile::tempdir;

    fn doc_bytes(id: i64) -> Vec<u8> {
        bson::to_vec(&doc! { "id": id }).unwrap()
    }

    #[test]
    fn commit_applies_all_buffered_ops() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();
        engine.create_table("t", "id", KeyType::Int64).unwrap();

        let mut tx = engine.begin_write();
        tx.put("t", "id", Key::Int64(1), doc_bytes(1)).unwrap();
        tx.put("t", "id", Key::Int64(2), doc_bytes(2)).unwrap();
        tx.commit().unwrap();

        assert_eq!(engine.get("t", "id", &Key::Int64(1)).unwrap(), Some(doc_bytes(1)));
        assert_eq!(engine.get("t", "id", &Key::Int64(2)).unwrap(), Some(doc_bytes(2)));
    }

    #[test]
    fn repeatable_read_scan_does_not_see_a_later_write() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();
        engine.create_table("t", "id", KeyType::Int64).unwrap();
        engine.put("t", "id", Key::Int64(1), doc_bytes(1)).unwrap();

        let tx = engine.begin_read(crate::config::IsolationLevel::RepeatableRead);
        engine.put("t", "id", Key::Int64(2), doc_bytes(2)).unwrap();

        let seen = tx.scan("t", "id", &crate::engine::ScanCondition::Ge(Key::Int64(0))).unwrap();
        assert_eq!(seen, vec![(Key::Int64(1), doc_bytes(1))]);

        let seen_now = engine.scan("t", "id", &crate::engine::ScanCondition::Ge(Key::Int64(0))).unwrap();
        assert_eq!(seen_now.len(), 2);
        tx.close();
    }

    #[test]
    fn double_commit_is_an_error() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();
        engine.create_table("t", "id", KeyType::Int64).unwrap();

        let mut tx = engine.begin_write();
        tx.put("t", "id", Key::Int64(1), doc_bytes(1)).unwrap();
        tx.commit().unwrap();
        assert!(matches!(tx.commit(), Err(DbError::TxAlreadyClosed)));
    }

    #[test]
    fn rollback_discards_buffered_ops() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();
        engine.create_table("t", "id", KeyType::Int64).unwrap();

        let mut tx = engine.begin_write();
        tx.put("t", "id", Key::Int64(1), doc_bytes(1)).unwrap();
        tx.rollback().unwrap();

        assert_eq!(engine.get("t", "id", &Key::Int64(1)).unwrap(), None);
    }
}
