//! The catalog — tables, each with a primary index and zero or more
//! secondary indices sharing one heap. Secondary indices are not given
//! physically independent storage; they share the table's heap file.
//!
//! Catalog *persistence* is explicitly out of scope: the embedding
//! application recreates tables and indices by calling `create_table`/
//! `create_index` before `recover`, and recovery skips any WAL record whose
//! table or index is not present in the in-memory catalog it was given.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::btree::BTree;
use crate::errors::{DbError, DbResult};
use crate::heap::HeapFile;
use crate::key::KeyType;

/// `(name, primary, key_type, tree)`.
pub struct Index {
    pub name: String,
    pub primary: bool,
    pub key_type: KeyType,
    pub tree: BTree,
}

impl Index {
    fn new(name: impl Into<String>, primary: bool, key_type: KeyType, degree: usize) -> Self {
        Self { name: name.into(), primary, key_type, tree: BTree::new(degree) }
    }
}

/// The mutable part of a table's schema: its indices and its heap. Swapped
/// wholesale by vacuum under the table's exclusive schema lock.
pub struct TableSchema {
    pub indices: HashMap<String, Arc<Index>>,
    pub heap: Arc<HeapFile>,
}

/// `(name, indices map, heap manager, per-table RW lock)`. The lock is a
/// *schema* lock, not a row lock: readers hold it briefly to look up an
/// index or the heap handle; only vacuum acquires it exclusively.
pub struct Table {
    pub name: String,
    schema: RwLock<TableSchema>,
    heap_path: PathBuf,
}

impl Table {
    pub fn primary_index_name(&self) -> Option<String> {
        self.schema.read().indices.values().find(|i| i.primary).map(|i| i.name.clone())
    }

    pub fn index(&self, name: &str) -> DbResult<Arc<Index>> {
        self.schema
            .read()
            .indices
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::NoSuchIndex(name.to_string()))
    }

    pub fn index_names(&self) -> Vec<String> {
        self.schema.read().indices.keys().cloned().collect()
    }

    pub fn heap(&self) -> Arc<HeapFile> {
        self.schema.read().heap.clone()
    }

    pub fn heap_path(&self) -> &Path {
        &self.heap_path
    }

    /// Adds a secondary index over an empty tree. Fails if one with the same
    /// name already exists.
    pub fn create_index(&self, name: impl Into<String>, key_type: KeyType, degree: usize) -> DbResult<()> {
        let name = name.into();
        let mut schema = self.schema.write();
        if schema.indices.contains_key(&name) {
            return Err(DbError::TableAlreadyExists(name));
        }
        schema.indices.insert(name.clone(), Arc::new(Index::new(name, false, key_type, degree)));
        Ok(())
    }

    /// Holds the schema lock exclusively for the full duration of `f`, which
    /// sees the table's current heap and indices and returns its
    /// replacements. Vacuum is this method's only caller; the lock spans
    /// the entire rewrite, not just the final pointer swap, so no writer
    /// can install a pointer into a heap vacuum is about to delete.
    pub fn vacuum_swap<F>(&self, f: F) -> DbResult<()>
    where
        F: FnOnce(&HeapFile, &HashMap<String, Arc<Index>>) -> DbResult<(Arc<HeapFile>, HashMap<String, Arc<Index>>)>,
    {
        let mut schema = self.schema.write();
        let (new_heap, new_indices) = f(&schema.heap, &schema.indices)?;
        schema.heap = new_heap;
        schema.indices = new_indices;
        Ok(())
    }
}

/// Tables keyed by name.
#[derive(Default)]
pub struct Catalog {
    tables: RwLock<HashMap<String, Arc<Table>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self { tables: RwLock::new(HashMap::new()) }
    }

    /// Creates a table with a fresh heap file at `heap_path` and a primary
    /// index named `primary_index_name`.
    pub fn create_table(
        &self,
        name: impl Into<String>,
        heap_path: impl Into<PathBuf>,
        primary_index_name: impl Into<String>,
        primary_key_type: KeyType,
        degree: usize,
    ) -> DbResult<Arc<Table>> {
        let name = name.into();
        let heap_path = heap_path.into();
        let mut tables = self.tables.write();
        if tables.contains_key(&name) {
            return Err(DbError::TableAlreadyExists(name));
        }
        let heap = Arc::new(HeapFile::create(&heap_path)?);
        let primary_name = primary_index_name.into();
        let mut indices = HashMap::new();
        indices.insert(
            primary_name.clone(),
            Arc::new(Index::new(primary_name, true, primary_key_type, degree)),
        );
        let table = Arc::new(Table {
            name: name.clone(),
            schema: RwLock::new(TableSchema { indices, heap }),
            heap_path,
        });
        tables.insert(name, table.clone());
        Ok(table)
    }

    pub fn table(&self, name: &str) -> DbResult<Arc<Table>> {
        self.tables.read().get(name).cloned().ok_or_else(|| DbError::NoSuchTable(name.to_string()))
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_table_installs_primary_index() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new();
        let table = catalog
            .create_table("users", dir.path().join("users.heap"), "id", KeyType::Int64, 3)
            .unwrap();
        assert_eq!(table.primary_index_name().as_deref(), Some("id"));
        assert!(table.index("id").unwrap().primary);
    }

    #[test]
    fn duplicate_table_name_rejected() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new();
        catalog.create_table("users", dir.path().join("u1.heap"), "id", KeyType::Int64, 3).unwrap();
        let err = catalog.create_table("users", dir.path().join("u2.heap"), "id", KeyType::Int64, 3);
        assert!(matches!(err, Err(DbError::TableAlreadyExists(_))));
    }

    #[test]
    fn secondary_index_creation() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new();
        let table = catalog
            .create_table("users", dir.path().join("users.heap"), "id", KeyType::Int64, 3)
            .unwrap();
        table.create_index("name", KeyType::Str, 3).unwrap();
        assert!(!table.index("name").unwrap().primary);
    }
}
