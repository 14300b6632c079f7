//! Recovery — reload the latest checkpoint per (table, index), then
//! replay the WAL delta on top of it.
//!
//! Write-transaction replay is strict: operations recorded between an
//! observed `Begin` and its matching `Commit` are buffered in memory and
//! applied only once the `Commit` marker is seen; an `Abort` or a `Begin`
//! with no terminating marker before EOF causes its buffered operations to
//! be discarded rather than replayed.

use std::collections::HashMap;

use crate::checkpoint;
use crate::engine::Engine;
use crate::errors::{DbError, DbResult};
use crate::key::Key;
use crate::wal::{EntryType, WalEntry, WalPayload, WalReader};

/// Replays checkpoints and the WAL over the tables already registered in
/// `engine`'s catalog. The embedder must have called `create_table`/
/// `create_index` for every table it expects before calling this, since
/// catalog persistence is out of scope for this crate.
pub fn recover(engine: &Engine) -> DbResult<()> {
    let mut loaded_lsn: HashMap<(String, String), u64> = HashMap::new();
    let mut max_lsn: u64 = 0;

    for table_name in engine.catalog().table_names() {
        let table = engine.catalog().table(&table_name)?;
        for index_name in table.index_names() {
            match checkpoint::latest_checkpoint(&engine.config().checkpoint_dir, &table_name, &index_name)? {
                Some((path, _lsn)) => {
                    let loaded = checkpoint::load_checkpoint(&path)?;
                    let index = table.index(&index_name)?;
                    index.tree.install_root(loaded.root);
                    loaded_lsn.insert((table_name.clone(), index_name.clone()), loaded.watermark);
                    max_lsn = max_lsn.max(loaded.watermark);
                    log::info!("recovery: loaded checkpoint {}.{} at lsn {}", table_name, index_name, loaded.watermark);
                }
                None => {
                    loaded_lsn.insert((table_name.clone(), index_name.clone()), 0);
                }
            }
        }
    }

    let wal_path = engine.config().wal_path();
    if wal_path.exists() {
        let reader = WalReader::open(&wal_path)?;
        let mut in_tx = false;
        let mut buffered: Vec<WalEntry> = Vec::new();

        for entry in reader {
            let entry = entry?;
            max_lsn = max_lsn.max(entry.lsn);

            match entry.entry_type {
                EntryType::Begin => {
                    in_tx = true;
                    buffered.clear();
                }
                EntryType::Commit => {
                    for buffered_entry in buffered.drain(..) {
                        apply_entry(engine, &buffered_entry, &loaded_lsn)?;
                    }
                    in_tx = false;
                }
                EntryType::Abort => {
                    buffered.clear();
                    in_tx = false;
                }
                EntryType::Insert | EntryType::Update | EntryType::Delete | EntryType::MultiInsert => {
                    if in_tx {
                        buffered.push(entry);
                    } else {
                        apply_entry(engine, &entry, &loaded_lsn)?;
                    }
                }
            }
        }
        // Any buffered ops left over belong to a transaction whose Begin
        // was observed but whose Commit never was (crash mid-transaction):
        // they are intentionally dropped here, never applied.
    }

    engine.lsn().advance_to_at_least(max_lsn);
    Ok(())
}

fn apply_entry(engine: &Engine, entry: &WalEntry, loaded_lsn: &HashMap<(String, String), u64>) -> DbResult<()> {
    match &entry.payload {
        WalPayload::Empty => Ok(()),
        WalPayload::SingleIndex { table, index, key, document } => {
            apply_single(engine, entry.lsn, entry.entry_type, table, index, key, document.as_deref(), loaded_lsn)
        }
        WalPayload::MultiInsert { table, entries, document } => {
            apply_multi_insert(engine, entry.lsn, table, entries, document, loaded_lsn)
        }
    }
}

fn apply_single(
    engine: &Engine,
    lsn: u64,
    entry_type: EntryType,
    table_name: &str,
    index_name: &str,
    key_bytes: &[u8],
    document: Option<&[u8]>,
    loaded_lsn: &HashMap<(String, String), u64>,
) -> DbResult<()> {
    let Ok(table) = engine.catalog().table(table_name) else {
        log::warn!("recovery: skipping WAL record for unknown table {table_name}");
        return Ok(());
    };
    let Ok(index) = table.index(index_name) else {
        log::warn!("recovery: skipping WAL record for unknown index {table_name}.{index_name}");
        return Ok(());
    };

    let gate = loaded_lsn.get(&(table_name.to_string(), index_name.to_string())).copied().unwrap_or(0);
    if gate >= lsn {
        return Ok(());
    }

    let key = Key::decode_from_slice(key_bytes)
        .map_err(|e| DbError::Corruption(format!("WAL record for {table_name}.{index_name}: bad key encoding: {e}")))?;
    let heap = table.heap();

    match entry_type {
        EntryType::Insert | EntryType::Update => {
            let document = document
                .ok_or_else(|| DbError::Corruption(format!("WAL {entry_type:?} record for {table_name}.{index_name} has no document")))?;
            let prev = index.tree.get(&key).unwrap_or(-1);
            let new_offset = heap.write(document, lsn, prev)?;
            index.tree.upsert(&key, |_old| Ok(Some(new_offset)))?;
        }
        EntryType::Delete => {
            if let Some(offset) = index.tree.get(&key) {
                heap.delete(offset, lsn)?;
            }
        }
        EntryType::Begin | EntryType::Commit | EntryType::Abort | EntryType::MultiInsert => {
            unreachable!("apply_single is only called for Insert/Update/Delete payloads")
        }
    }
    Ok(())
}

fn apply_multi_insert(
    engine: &Engine,
    lsn: u64,
    table_name: &str,
    entries: &[(String, Vec<u8>)],
    document: &[u8],
    loaded_lsn: &HashMap<(String, String), u64>,
) -> DbResult<()> {
    let Ok(table) = engine.catalog().table(table_name) else {
        log::warn!("recovery: skipping MultiInsert for unknown table {table_name}");
        return Ok(());
    };

    let mut resolved = Vec::with_capacity(entries.len());
    let mut any_stale = false;
    for (index_name, key_bytes) in entries {
        let Ok(index) = table.index(index_name) else {
            log::warn!("recovery: skipping MultiInsert entry for unknown index {table_name}.{index_name}");
            continue;
        };
        let key = Key::decode_from_slice(key_bytes)
            .map_err(|e| DbError::Corruption(format!("MultiInsert record for {table_name}.{index_name}: bad key encoding: {e}")))?;
        let gate = loaded_lsn.get(&(table_name.to_string(), index_name.clone())).copied().unwrap_or(0);
        let stale = gate < lsn;
        any_stale |= stale;
        resolved.push((index, key, stale));
    }

    if !any_stale {
        return Ok(());
    }

    let heap = table.heap();
    let offset = heap.write(document, lsn, -1)?;
    for (index, key, stale) in resolved {
        if stale {
            index.tree.upsert(&key, |_old| Ok(Some(offset)))?;
        }
    }
    Ok(())
}
