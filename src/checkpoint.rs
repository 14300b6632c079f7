//! Per-(table,index) B+Tree checkpoints.
//!
//! A checkpoint is a depth-first, pre-order serialization of one index's
//! tree plus a small header carrying the watermark LSN the traversal
//! started at. Traversal takes only read latches (the same ones `get`/
//! `Cursor` take), so a checkpoint can be captured while writers proceed —
//! it is *fuzzy*, and recovery's `loaded_lsn` gate is what makes that safe
//! rather than any claim of point-in-time consistency.
//!
//! Wire format, hand-encoded the way `heap::core` and `wal::record` encode
//! their own headers, rather than handed to `bincode`: a fixed 29-byte file
//! header, followed by nodes in pre-order — `node_type: u8, n: u32, n tagged
//! keys, then either n+1 recursively-encoded child subtrees (internal) or n
//! `i64` offsets (leaf)`.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::btree::core::{Internal, Leaf, Node, NodeRef};
use crate::btree::BTree;
use crate::catalog::Table;
use crate::errors::{DbError, DbResult};
use crate::key::Key;

const CHK_MAGIC: u32 = 0x434B_5054; // "CKPT"
const CHK_VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 8 + 4 + 1; // magic, version, watermark, degree, unique

const NODE_INTERNAL: u8 = 0;
const NODE_LEAF: u8 = 1;

/// `checkpoint_<table>_<index>_<lsn>.chk`.
pub fn checkpoint_file_name(table: &str, index: &str, lsn: u64) -> String {
    format!("checkpoint_{table}_{index}_{lsn}.chk")
}

fn checkpoint_prefix(table: &str, index: &str) -> String {
    format!("checkpoint_{table}_{index}_")
}

/// Serializes every index of `table` to a fresh checkpoint file under
/// `dir`, each watermarked at `lsn`, then prunes older checkpoints for the
/// same (table, index).
pub fn checkpoint_table(table: &Table, dir: &Path, lsn: u64) -> DbResult<()> {
    for index_name in table.index_names() {
        let index = table.index(&index_name)?;
        checkpoint_index(&table.name, &index_name, index.primary, &index.tree, dir, lsn)?;
    }
    Ok(())
}

fn checkpoint_index(table: &str, index: &str, primary: bool, tree: &BTree, dir: &Path, lsn: u64) -> DbResult<()> {
    fs::create_dir_all(dir)?;
    let final_name = checkpoint_file_name(table, index, lsn);
    let final_path = dir.join(&final_name);
    let tmp_path = dir.join(format!("{final_name}.tmp"));

    let mut buf = Vec::new();
    buf.extend_from_slice(&CHK_MAGIC.to_le_bytes());
    buf.extend_from_slice(&CHK_VERSION.to_le_bytes());
    buf.extend_from_slice(&lsn.to_le_bytes());
    buf.extend_from_slice(&(tree.degree() as u32).to_le_bytes());
    buf.push(u8::from(primary));
    debug_assert_eq!(buf.len(), HEADER_LEN);

    write_node(&mut buf, &tree.root_ref())?;

    {
        let mut f = File::create(&tmp_path)?;
        f.write_all(&buf)?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, &final_path)?;
    log::info!("published checkpoint {}", final_path.display());

    prune_older(dir, table, index, lsn)?;
    Ok(())
}

fn write_node(buf: &mut Vec<u8>, node: &NodeRef) -> DbResult<()> {
    let guard = node.read();
    match &*guard {
        Node::Leaf(leaf) => {
            buf.push(NODE_LEAF);
            buf.extend_from_slice(&(leaf.keys.len() as u32).to_le_bytes());
            for key in &leaf.keys {
                write_tagged_key(buf, key);
            }
            for offset in &leaf.offsets {
                buf.extend_from_slice(&offset.to_le_bytes());
            }
            Ok(())
        }
        Node::Internal(internal) => {
            buf.push(NODE_INTERNAL);
            buf.extend_from_slice(&(internal.keys.len() as u32).to_le_bytes());
            for key in &internal.keys {
                write_tagged_key(buf, key);
            }
            let children = internal.children.clone();
            drop(guard);
            for child in &children {
                write_node(buf, child)?;
            }
            Ok(())
        }
    }
}

fn write_tagged_key(buf: &mut Vec<u8>, key: &Key) {
    key.encode(buf).expect("encoding into a Vec cannot fail");
}

/// Deletes every checkpoint for `(table, index)` under `dir` whose embedded
/// LSN is strictly less than `keep_lsn`, run after a new checkpoint publishes.
fn prune_older(dir: &Path, table: &str, index: &str, keep_lsn: u64) -> DbResult<()> {
    let prefix = checkpoint_prefix(table, index);
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(candidate_lsn) = parse_checkpoint_lsn(name, &prefix) else { continue };
        if candidate_lsn < keep_lsn {
            let _ = fs::remove_file(entry.path());
        }
    }
    Ok(())
}

fn parse_checkpoint_lsn(name: &str, prefix: &str) -> Option<u64> {
    let rest = name.strip_prefix(prefix)?;
    let lsn_str = rest.strip_suffix(".chk")?;
    lsn_str.parse().ok()
}

/// Finds the highest-LSN checkpoint file for `(table, index)` under `dir`,
/// if any.
pub fn latest_checkpoint(dir: &Path, table: &str, index: &str) -> DbResult<Option<(PathBuf, u64)>> {
    if !dir.exists() {
        return Ok(None);
    }
    let prefix = checkpoint_prefix(table, index);
    let mut best: Option<(PathBuf, u64)> = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(lsn) = parse_checkpoint_lsn(name, &prefix) else { continue };
        if best.as_ref().is_none_or(|(_, best_lsn)| lsn > *best_lsn) {
            best = Some((entry.path(), lsn));
        }
    }
    Ok(best)
}

/// The result of loading a checkpoint file: the reconstructed root and the
/// watermark LSN it was captured at.
pub struct LoadedTree {
    pub root: NodeRef,
    pub watermark: u64,
    pub degree: usize,
}

/// Loads and reconstructs a tree from a checkpoint file written by
/// [`checkpoint_table`].
pub fn load_checkpoint(path: &Path) -> DbResult<LoadedTree> {
    let mut f = File::open(path)?;
    let mut header = [0u8; HEADER_LEN];
    f.read_exact(&mut header)
        .map_err(|_| DbError::Corruption(format!("{}: truncated checkpoint header", path.display())))?;
    let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
    if magic != CHK_MAGIC {
        return Err(DbError::Corruption(format!("{}: bad checkpoint magic", path.display())));
    }
    let version = u16::from_le_bytes(header[4..6].try_into().unwrap());
    if version != CHK_VERSION {
        return Err(DbError::Corruption(format!("{}: unsupported checkpoint version {version}", path.display())));
    }
    let watermark = u64::from_le_bytes(header[6..14].try_into().unwrap());
    let degree = u32::from_le_bytes(header[14..18].try_into().unwrap()) as usize;

    let mut rest = Vec::new();
    f.read_to_end(&mut rest)?;
    let mut cursor = rest.as_slice();
    let root = read_node(&mut cursor, path)?;
    link_leaves(&root);
    Ok(LoadedTree { root, watermark, degree })
}

fn read_node(cursor: &mut &[u8], path: &Path) -> DbResult<NodeRef> {
    let corrupt = || DbError::Corruption(format!("{}: truncated checkpoint body", path.display()));
    let mut tag = [0u8; 1];
    read_exact(cursor, &mut tag).map_err(|_| corrupt())?;
    let mut n_buf = [0u8; 4];
    read_exact(cursor, &mut n_buf).map_err(|_| corrupt())?;
    let n = u32::from_le_bytes(n_buf) as usize;

    let mut keys = Vec::with_capacity(n);
    for _ in 0..n {
        let key = Key::decode(cursor).map_err(|_| corrupt())?;
        keys.push(key);
    }

    match tag[0] {
        NODE_LEAF => {
            let mut offsets = Vec::with_capacity(n);
            for _ in 0..n {
                let mut buf = [0u8; 8];
                read_exact(cursor, &mut buf).map_err(|_| corrupt())?;
                offsets.push(i64::from_le_bytes(buf));
            }
            Ok(std::sync::Arc::new(parking_lot::RwLock::new(Node::Leaf(Leaf { keys, offsets, next: None }))))
        }
        NODE_INTERNAL => {
            let mut children = Vec::with_capacity(n + 1);
            for _ in 0..=n {
                children.push(read_node(cursor, path)?);
            }
            Ok(std::sync::Arc::new(parking_lot::RwLock::new(Node::Internal(Internal { keys, children }))))
        }
        other => Err(DbError::Corruption(format!("{}: unknown node tag {other}", path.display()))),
    }
}

fn read_exact(cursor: &mut &[u8], buf: &mut [u8]) -> io::Result<()> {
    Read::read_exact(cursor, buf)
}

/// After deserializing, relink every leaf's `next` pointer in left-to-right
/// order — the serialized form doesn't carry leaf links directly, since
/// they're redundant with tree structure (each node stores only its keys
/// plus offsets or child subtrees, no sibling pointer).
fn link_leaves(root: &NodeRef) {
    let mut leaves = Vec::new();
    collect_leaves(root, &mut leaves);
    for pair in leaves.windows(2) {
        let [a, b] = pair else { unreachable!() };
        if let Node::Leaf(leaf) = &mut *a.write() {
            leaf.next = Some(b.clone());
        }
    }
}

fn collect_leaves(node: &NodeRef, out: &mut Vec<NodeRef>) {
    let children = {
        let guard = node.read();
        match &*guard {
            Node::Leaf(_) => None,
            Node::Internal(internal) => Some(internal.children.clone()),
        }
    };
    match children {
        None => out.push(node.clone()),
        Some(children) => {
            for child in &children {
                collect_leaves(child, out);
            }
        }
    }
}
