//! The engine facade: the programmatic surface embedders call against.

use std::fs;
use std::sync::Arc;

use crate::catalog::{Catalog, Index, Table};
use crate::config::{EngineConfig, IsolationLevel};
use crate::document;
use crate::errors::{DbError, DbResult};
use crate::key::Key;
use crate::txn::{LsnCounter, TxRegistry};
use crate::wal::{EntryType, WalPayload, WalWriter};
use crate::{checkpoint, recovery, vacuum};

use super::scan::ScanCondition;

/// The embeddable storage engine. One instance owns one WAL, one LSN
/// counter, one transaction registry, and a catalog of tables.
pub struct Engine {
    config: EngineConfig,
    catalog: Catalog,
    wal: WalWriter,
    lsn: LsnCounter,
    registry: TxRegistry,
}

impl Engine {
    /// Opens (creating directories as needed) the engine at `config`'s
    /// paths. Does not read the WAL or any checkpoint — call
    /// [`Engine::recover`] after recreating the catalog's tables to do that:
    /// catalog persistence is out of scope here, so the embedder must call
    /// `create_table`/`create_index` for every table it expects before
    /// recovering.
    pub fn open(config: EngineConfig) -> DbResult<Self> {
        fs::create_dir_all(&config.data_dir)?;
        fs::create_dir_all(&config.checkpoint_dir)?;
        let wal = WalWriter::create(config.wal_path(), config.sync_policy)?;
        Ok(Self {
            config,
            catalog: Catalog::new(),
            wal,
            lsn: LsnCounter::new(1),
            registry: TxRegistry::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub(crate) fn wal(&self) -> &WalWriter {
        &self.wal
    }

    pub(crate) fn lsn(&self) -> &LsnCounter {
        &self.lsn
    }

    pub(crate) fn registry(&self) -> &TxRegistry {
        &self.registry
    }

    pub fn create_table(&self, name: &str, primary_index_name: &str, primary_key_type: crate::key::KeyType) -> DbResult<Arc<Table>> {
        self.catalog.create_table(
            name,
            self.config.heap_path(name),
            primary_index_name,
            primary_key_type,
            self.config.btree_degree,
        )
    }

    pub fn create_index(&self, table: &str, index_name: &str, key_type: crate::key::KeyType) -> DbResult<()> {
        self.catalog.table(table)?.create_index(index_name, key_type, self.config.btree_degree)
    }

    /// Replays the WAL (and any checkpoints) over the tables already
    /// registered in the catalog.
    pub fn recover(&self) -> DbResult<()> {
        recovery::recover(self)
    }

    /// Serializes every index of `table` to a fresh checkpoint file.
    pub fn checkpoint_table(&self, table: &str) -> DbResult<()> {
        let t = self.catalog.table(table)?;
        let watermark = self.lsn.current();
        checkpoint::checkpoint_table(&t, &self.config.checkpoint_dir, watermark)
    }

    pub fn checkpoint_all(&self) -> DbResult<()> {
        for name in self.catalog.table_names() {
            self.checkpoint_table(&name)?;
        }
        Ok(())
    }

    /// Rewrites `table`'s heap, dropping tombstones no active snapshot can
    /// still need.
    pub fn vacuum_table(&self, table: &str) -> DbResult<()> {
        let t = self.catalog.table(table)?;
        vacuum::vacuum_table(&t, &self.registry, &self.config)
    }

    pub fn begin_read(&self, level: IsolationLevel) -> crate::transaction::ReadTransaction<'_> {
        crate::transaction::ReadTransaction::new(self, level)
    }

    pub fn begin_write(&self) -> crate::transaction::WriteTransaction<'_> {
        crate::transaction::WriteTransaction::new(self)
    }

    /// `Put(table, index, key, document)`.
    pub fn put(&self, table: &str, index: &str, key: Key, document: Vec<u8>) -> DbResult<()> {
        let t = self.catalog.table(table)?;
        let idx = t.index(index)?;
        self.validate_key_and_field(&idx, index, &key, &document)?;

        let lsn = self.lsn.next();
        self.wal.append(
            lsn,
            EntryType::Insert,
            &WalPayload::SingleIndex {
                table: table.to_string(),
                index: index.to_string(),
                key: key.encode_to_vec(),
                document: Some(document.clone()),
            },
        )?;
        let heap = t.heap();
        idx.tree.upsert(&key, |old| {
            let prev = old.unwrap_or(-1);
            Ok(Some(heap.write(&document, lsn, prev)?))
        })?;
        Ok(())
    }

    /// `Get(table, index, key)` under a fresh, single-operation snapshot.
    pub fn get(&self, table: &str, index: &str, key: &Key) -> DbResult<Option<Vec<u8>>> {
        let t = self.catalog.table(table)?;
        let idx = t.index(index)?;
        let snapshot_lsn = self.lsn.current();
        self.visible_read(&t, &idx, key, snapshot_lsn)
    }

    /// `Del(table, index, key)`. Returns whether the key was present.
    pub fn del(&self, table: &str, index: &str, key: &Key) -> DbResult<bool> {
        let t = self.catalog.table(table)?;
        let idx = t.index(index)?;
        let lsn = self.lsn.next();
        self.wal.append(
            lsn,
            EntryType::Delete,
            &WalPayload::SingleIndex {
                table: table.to_string(),
                index: index.to_string(),
                key: key.encode_to_vec(),
                document: None,
            },
        )?;
        let heap = t.heap();
        let mut existed = false;
        idx.tree.upsert(key, |old| match old {
            None => Ok(None),
            Some(offset) => {
                heap.delete(offset, lsn)?;
                existed = true;
                Ok(Some(offset))
            }
        })?;
        Ok(existed)
    }

    /// `InsertRow`: one heap record, many index pointers, one WAL entry.
    pub fn insert_row(&self, table: &str, keys: &[(String, Key)], document: Vec<u8>) -> DbResult<()> {
        let t = self.catalog.table(table)?;
        let mut resolved = Vec::with_capacity(keys.len());
        for (index_name, key) in keys {
            let idx = t.index(index_name)?;
            if idx.key_type != key.key_type() {
                return Err(DbError::KeyTypeMismatch {
                    index: index_name.clone(),
                    expected: idx.key_type,
                    actual: key.key_type(),
                });
            }
            resolved.push((idx, key.clone()));
        }

        let lsn = self.lsn.next();
        self.wal.append(
            lsn,
            EntryType::MultiInsert,
            &WalPayload::MultiInsert {
                table: table.to_string(),
                entries: keys.iter().map(|(n, k)| (n.clone(), k.encode_to_vec())).collect(),
                document: document.clone(),
            },
        )?;
        let heap = t.heap();
        let offset = heap.write(&document, lsn, -1)?;
        for (idx, key) in resolved {
            if idx.primary {
                // Atomic under the leaf's write latch: a concurrent insert_row
                // for the same key fails here instead of silently overwriting
                // this one's pointer.
                if !idx.tree.insert(key.clone(), offset, true)? {
                    return Err(DbError::DuplicateKey { index: idx.name.clone() });
                }
            } else {
                idx.tree.upsert(&key, |_old| Ok(Some(offset)))?;
            }
        }
        Ok(())
    }

    /// `Scan`: yields every visible `(key, document)` pair satisfying
    /// `condition` under a fresh, single-operation snapshot, choosing
    /// between the indexed seek and a full walk based on `condition`.
    pub fn scan(&self, table: &str, index: &str, condition: &ScanCondition) -> DbResult<Vec<(Key, Vec<u8>)>> {
        let snapshot_lsn = self.lsn.current();
        self.scan_at(table, index, condition, snapshot_lsn)
    }

    /// `Scan` under a caller-supplied snapshot, so a transaction's captured
    /// (or refreshed) `snapshot_lsn` governs visibility the same way
    /// [`Engine::visible_read`] does for `Get`.
    pub(crate) fn scan_at(&self, table: &str, index: &str, condition: &ScanCondition, snapshot_lsn: u64) -> DbResult<Vec<(Key, Vec<u8>)>> {
        let t = self.catalog.table(table)?;
        let idx = t.index(index)?;
        let cursor = if condition.should_seek() {
            idx.tree.cursor_from(condition.seek_key().expect("should_seek implies a seek key"))
        } else {
            idx.tree.cursor_full()
        };

        let mut out = Vec::new();
        for (key, offset) in cursor {
            if condition.should_stop_before(&key) {
                break;
            }
            if !condition.matches(&key) {
                continue;
            }
            if let Some(doc) = self.read_visible_at(&t, offset, snapshot_lsn)? {
                out.push((key, doc));
            }
        }
        Ok(out)
    }

    pub(crate) fn visible_read(&self, table: &Table, index: &Index, key: &Key, snapshot_lsn: u64) -> DbResult<Option<Vec<u8>>> {
        let Some(offset) = index.tree.get(key) else { return Ok(None) };
        self.read_visible_at(table, offset, snapshot_lsn)
    }

    /// Walks the version chain from `offset`, returning the newest version
    /// visible at `snapshot_lsn`.
    fn read_visible_at(&self, table: &Table, mut offset: i64, snapshot_lsn: u64) -> DbResult<Option<Vec<u8>>> {
        let heap = table.heap();
        loop {
            let (data, header) = heap.read(offset)?;
            if header.create_lsn <= snapshot_lsn {
                if header.valid || header.delete_lsn > snapshot_lsn {
                    return Ok(Some(data));
                }
                return Ok(None);
            }
            if header.prev_offset < 0 {
                return Ok(None);
            }
            offset = header.prev_offset;
        }
    }

    fn validate_key_and_field(&self, idx: &Index, index_name: &str, key: &Key, document: &[u8]) -> DbResult<()> {
        if idx.key_type != key.key_type() {
            return Err(DbError::KeyTypeMismatch {
                index: index_name.to_string(),
                expected: idx.key_type,
                actual: key.key_type(),
            });
        }
        let extracted = document::extract_field(document, index_name)?;
        if extracted.key_type() != idx.key_type {
            return Err(DbError::KeyTypeMismatch {
                index: index_name.to_string(),
                expected: idx.key_type,
                actual: extracted.key_type(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyType;
    use bson::doc;
    use tempfile::tempdir;

    fn doc_bytes(id: i64, name: &str) -> Vec<u8> {
        bson::to_vec(&doc! { "id": id, "name": name }).unwrap()
    }

    #[test]
    fn put_get_del_round_trip() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();
        engine.create_table("users", "id", KeyType::Int64).unwrap();

        engine.put("users", "id", Key::Int64(1), doc_bytes(1, "A")).unwrap();
        let got = engine.get("users", "id", &Key::Int64(1)).unwrap();
        assert_eq!(got, Some(doc_bytes(1, "A")));

        assert!(engine.del("users", "id", &Key::Int64(1)).unwrap());
        assert_eq!(engine.get("users", "id", &Key::Int64(1)).unwrap(), None);
        assert!(!engine.del("users", "id", &Key::Int64(1)).unwrap());
    }

    #[test]
    fn mvcc_snapshot_isolation() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();
        engine.create_table("t", "id", KeyType::Int64).unwrap();

        engine.put("t", "id", Key::Int64(1), doc_bytes(1, "v1")).unwrap();
        let tx = engine.begin_read(IsolationLevel::RepeatableRead);
        engine.put("t", "id", Key::Int64(1), doc_bytes(1, "v2")).unwrap();

        assert_eq!(tx.get("t", "id", &Key::Int64(1)).unwrap(), Some(doc_bytes(1, "v1")));
        assert_eq!(engine.get("t", "id", &Key::Int64(1)).unwrap(), Some(doc_bytes(1, "v2")));
    }

    #[test]
    fn scan_between_is_inclusive_and_visible() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();
        engine.create_table("t", "id", KeyType::Int64).unwrap();
        for i in 1..=5 {
            engine.put("t", "id", Key::Int64(i), doc_bytes(i, "x")).unwrap();
        }
        let results = engine
            .scan("t", "id", &ScanCondition::Between(Key::Int64(2), Key::Int64(4)))
            .unwrap();
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn insert_row_rejects_duplicate_primary_key() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();
        engine.create_table("t", "id", KeyType::Int64).unwrap();
        engine
            .insert_row("t", &[("id".into(), Key::Int64(1))], doc_bytes(1, "a"))
            .unwrap();
        let err = engine.insert_row("t", &[("id".into(), Key::Int64(1))], doc_bytes(1, "b"));
        assert!(matches!(err, Err(DbError::DuplicateKey { .. })));
    }
}
