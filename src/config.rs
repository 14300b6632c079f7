//! Ambient configuration: a plain data struct with an explicit constructor
//! rather than a builder.

use std::path::PathBuf;

use crate::wal::SyncPolicy;

/// Isolation level a read transaction is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Snapshot LSN refreshed before every operation.
    ReadCommitted,
    /// Snapshot LSN fixed at `begin` for the transaction's lifetime.
    RepeatableRead,
}

/// Engine-wide configuration passed to `Engine::create`/`Engine::open`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding per-table heap files and the WAL.
    pub data_dir: PathBuf,
    /// Directory holding published `.chk` checkpoint files.
    pub checkpoint_dir: PathBuf,
    /// B+Tree minimum degree shared by every index created through this
    /// engine. `t = 3` is a reasonable default for small in-memory-sized
    /// trees.
    pub btree_degree: usize,
    /// WAL durability policy.
    pub sync_policy: SyncPolicy,
}

impl EngineConfig {
    /// Sensible defaults for a fresh engine rooted at `data_dir`: `t = 3`,
    /// `SyncPolicy::EveryWrite`, checkpoints under `data_dir/checkpoints`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let checkpoint_dir = data_dir.join("checkpoints");
        Self {
            data_dir,
            checkpoint_dir,
            btree_degree: 3,
            sync_policy: SyncPolicy::EveryWrite,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("wal.log")
    }

    pub fn heap_path(&self, table: &str) -> PathBuf {
        self.data_dir.join(format!("{table}.heap"))
    }
}
