//! Vacuum — rewrite a table's heap, dropping tombstones no active
//! snapshot can still need, and rebuild every index from the survivors.
//!
//! Indices are rebuilt from each old index's own current `(key, offset)`
//! pairs rather than by re-deriving keys from document bytes: an index only
//! ever points at the *head* of a key's version chain, never at an older,
//! superseded version, so walking the old tree and remapping each head
//! offset is the only way to tell a live key from one whose head was a
//! tombstone just dropped from the heap. (Re-indexing every surviving heap
//! record, including non-head versions kept around for in-flight readers,
//! would resurrect deleted keys under their last live document bytes.)

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use crate::catalog::{Index, Table};
use crate::config::EngineConfig;
use crate::errors::DbResult;
use crate::heap::HeapFile;
use crate::txn::TxRegistry;

/// Rewrites `table`'s heap and every index, holding the table's exclusive
/// schema lock for the duration.
pub fn vacuum_table(table: &Table, registry: &TxRegistry, config: &EngineConfig) -> DbResult<()> {
    table.vacuum_swap(|old_heap, old_indices| rewrite(table, old_heap, old_indices, registry, config))
}

fn rewrite(
    table: &Table,
    old_heap: &HeapFile,
    old_indices: &HashMap<String, Arc<Index>>,
    registry: &TxRegistry,
    config: &EngineConfig,
) -> DbResult<(Arc<HeapFile>, HashMap<String, Arc<Index>>)> {
    let min_lsn = registry.min_active_lsn();
    log::info!("vacuum: rewriting table {} (min_active_lsn={})", table.name, min_lsn);

    let new_heap_path = table.heap_path().with_extension("heap.vacuum");
    if new_heap_path.exists() {
        fs::remove_file(&new_heap_path)?;
    }
    let new_heap = HeapFile::create(&new_heap_path)?;

    let mut remap: HashMap<i64, i64> = HashMap::new();
    let mut dropped = 0usize;
    let mut kept = 0usize;

    for item in old_heap.iterate()? {
        let (offset, header, data) = item?;
        let remapped_prev = |prev: i64| if prev < 0 { -1 } else { remap.get(&prev).copied().unwrap_or(-1) };

        if header.valid || header.delete_lsn >= min_lsn {
            let new_offset = new_heap.write(&data, header.create_lsn, remapped_prev(header.prev_offset))?;
            if !header.valid {
                new_heap.delete(new_offset, header.delete_lsn)?;
            }
            remap.insert(offset, new_offset);
            kept += 1;
        } else {
            dropped += 1;
        }
    }
    new_heap.sync()?;
    log::info!("vacuum: table {} kept {kept} records, dropped {dropped} tombstones", table.name);

    let final_path = table.heap_path().to_path_buf();
    drop(new_heap);
    fs::remove_file(&final_path)?;
    fs::rename(&new_heap_path, &final_path)?;
    let reopened_heap = Arc::new(HeapFile::open(&final_path)?);

    // A key survives in the rebuilt index only if its current head offset
    // was itself copied above; a head that was a dropped tombstone leaves
    // the key with no entry at all, matching a live delete.
    let new_indices = old_indices
        .iter()
        .map(|(name, old_idx)| {
            let tree = crate::btree::BTree::new(old_idx.tree.degree());
            for (key, old_offset) in old_idx.tree.cursor_full() {
                if let Some(&new_offset) = remap.get(&old_offset) {
                    let _ = tree.upsert(&key, |_old| Ok(Some(new_offset)));
                }
            }
            (
                name.clone(),
                Arc::new(Index { name: old_idx.name.clone(), primary: old_idx.primary, key_type: old_idx.key_type, tree }),
            )
        })
        .collect();

    Ok((reopened_heap, new_indices))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IsolationLevel;
    use crate::engine::Engine;
    use crate::key::{Key, KeyType};
    use bson::doc;
    use tempfile::tempdir;

    fn doc_bytes(id: i64) -> Vec<u8> {
        bson::to_vec(&doc! { "id": id }).unwrap()
    }

    #[test]
    fn vacuum_drops_old_tombstones_and_keeps_live_rows() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();
        engine.create_table("t", "id", KeyType::Int64).unwrap();
        for i in 1..=3 {
            engine.put("t", "id", Key::Int64(i), doc_bytes(i)).unwrap();
        }
        engine.del("t", "id", &Key::Int64(2)).unwrap();

        engine.vacuum_table("t").unwrap();

        assert_eq!(engine.get("t", "id", &Key::Int64(1)).unwrap(), Some(doc_bytes(1)));
        assert_eq!(engine.get("t", "id", &Key::Int64(2)).unwrap(), None);
        assert_eq!(engine.get("t", "id", &Key::Int64(3)).unwrap(), Some(doc_bytes(3)));
    }

    #[test]
    fn vacuum_honors_an_active_snapshot_then_reclaims_after_close() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();
        engine.create_table("t", "id", KeyType::Int64).unwrap();
        for i in 1..=3 {
            engine.put("t", "id", Key::Int64(i), doc_bytes(i)).unwrap();
        }

        let tx = engine.begin_read(IsolationLevel::RepeatableRead);
        engine.del("t", "id", &Key::Int64(2)).unwrap();

        engine.vacuum_table("t").unwrap();
        assert_eq!(tx.get("t", "id", &Key::Int64(2)).unwrap(), Some(doc_bytes(2)));

        tx.close();
        engine.vacuum_table("t").unwrap();
        assert_eq!(engine.get("t", "id", &Key::Int64(2)).unwrap(), None);
        assert_eq!(engine.get("t", "id", &Key::Int64(1)).unwrap(), Some(doc_bytes(1)));
    }

    #[test]
    fn vacuum_rebuilds_a_resurrected_key_correctly() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();
        engine.create_table("t", "id", KeyType::Int64).unwrap();
        engine.put("t", "id", Key::Int64(1), doc_bytes(1)).unwrap();
        engine.del("t", "id", &Key::Int64(1)).unwrap();
        engine.put("t", "id", Key::Int64(1), doc_bytes(99)).unwrap();

        engine.vacuum_table("t").unwrap();

        assert_eq!(engine.get("t", "id", &Key::Int64(1)).unwrap(), Some(doc_bytes(99)));
    }

    #[test]
    fn vacuum_does_not_resurrect_a_deleted_key_with_update_history() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();
        engine.create_table("t", "id", KeyType::Int64).unwrap();
        // An update keeps the superseded version `valid` and only chains it
        // via `prev_offset`; a following delete tombstones just the head.
        engine.put("t", "id", Key::Int64(1), doc_bytes(1)).unwrap();
        engine.put("t", "id", Key::Int64(1), doc_bytes(2)).unwrap();
        engine.del("t", "id", &Key::Int64(1)).unwrap();

        engine.vacuum_table("t").unwrap();

        assert_eq!(engine.get("t", "id", &Key::Int64(1)).unwrap(), None);
    }
}
