//! Concurrent B+Tree with latch-crabbing.
//!
//! Splits and merges are performed *preemptively* while descending: before
//! stepping into a child that is already full (insert) or already at the
//! minimum key count (delete), the child is fixed up against its parent
//! first. This is the classic single-pass B-tree technique and it has the
//! same latching effect as a hand-over-hand crabbing protocol — a node's
//! parent is only ever needed, at most, alongside that one child (and a
//! sibling during a merge/borrow), so ancestors above it are already
//! unlocked by the time we need to touch it.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::errors::{DbError, DbResult};
use crate::key::Key;

use super::cursor::Cursor;

pub(crate) type NodeRef = Arc<RwLock<Node>>;

pub(crate) enum Node {
    Leaf(Leaf),
    Internal(Internal),
}

pub(crate) struct Leaf {
    pub(crate) keys: Vec<Key>,
    pub(crate) offsets: Vec<i64>,
    pub(crate) next: Option<NodeRef>,
}

pub(crate) struct Internal {
    pub(crate) keys: Vec<Key>,
    pub(crate) children: Vec<NodeRef>,
}

impl Node {
    fn len(&self) -> usize {
        match self {
            Self::Leaf(l) => l.keys.len(),
            Self::Internal(i) => i.keys.len(),
        }
    }

    fn is_full(&self, t: usize) -> bool {
        self.len() >= 2 * t - 1
    }
}

/// An ordered index mapping keys to heap offsets.
pub struct BTree {
    root: RwLock<NodeRef>,
    t: usize,
}

impl BTree {
    /// Builds an empty tree with minimum degree `t` (`t − 1 ≤ N ≤ 2t − 1`
    /// keys per non-root node).
    pub fn new(t: usize) -> Self {
        assert!(t >= 2, "minimum degree must be at least 2");
        let root = Arc::new(RwLock::new(Node::Leaf(Leaf {
            keys: Vec::new(),
            offsets: Vec::new(),
            next: None,
        })));
        Self { root: RwLock::new(root), t }
    }

    pub fn degree(&self) -> usize {
        self.t
    }

    pub(crate) fn root_ref(&self) -> NodeRef {
        self.root.read().clone()
    }

    /// Replaces the tree's root wholesale. Used by recovery and checkpoint
    /// loading to install a tree reconstructed from a serialized snapshot;
    /// never called from ordinary read/write paths.
    pub(crate) fn install_root(&self, root: NodeRef) {
        *self.root.write() = root;
    }

    /// Point lookup.
    pub fn get(&self, key: &Key) -> Option<i64> {
        let mut current = self.root.read().clone();
        loop {
            let next = {
                let guard = current.read();
                match &*guard {
                    Node::Leaf(leaf) => {
                        return leaf.keys.binary_search(key).ok().map(|i| leaf.offsets[i]);
                    }
                    Node::Internal(internal) => {
                        let idx = internal.keys.partition_point(|k| k <= key);
                        internal.children[idx].clone()
                    }
                }
            };
            current = next;
        }
    }

    /// Inserts `offset` under `key`. When `unique` is true and the key is
    /// already present, the tree is left unchanged and `Ok(false)` is
    /// returned (the catalog layer turns that into a `DuplicateKey` error,
    /// since only it knows the index's name).
    pub fn insert(&self, key: Key, offset: i64, unique: bool) -> DbResult<bool> {
        let mut rejected = false;
        self.upsert(&key, |old| {
            if unique && old.is_some() {
                rejected = true;
                Ok(old)
            } else {
                Ok(Some(offset))
            }
        })?;
        Ok(!rejected)
    }

    /// Atomic read-modify-write of the leaf slot for `key`. `f` is invoked
    /// exactly once, under the target leaf's write latch, with the existing
    /// offset if the key is present; its return value is installed in the
    /// same latch section — the pivot for crash-safe writes, since callers
    /// perform the heap append inside `f`.
    ///
    /// `f` returns `Ok(None)` to leave the slot exactly as it was (a true
    /// no-op — used by `Del` on a key that turns out not to exist, where a
    /// naive implementation would otherwise install a bogus offset) or
    /// `Ok(Some(offset))` to install `offset` as the key's new (or first)
    /// pointer.
    pub fn upsert<F>(&self, key: &Key, f: F) -> DbResult<()>
    where
        F: FnOnce(Option<i64>) -> DbResult<Option<i64>>,
    {
        let t = self.t;
        self.preemptive_split_root();

        let mut current = self.root.read().clone();
        let mut f = Some(f);
        loop {
            let mut guard = current.write();
            match &mut *guard {
                Node::Leaf(leaf) => {
                    let pos = leaf.keys.partition_point(|k| k < key);
                    let existed = pos < leaf.keys.len() && leaf.keys[pos] == *key;
                    let old = existed.then(|| leaf.offsets[pos]);
                    let callback = f.take().expect("upsert callback invoked exactly once");
                    match (existed, callback(old)?) {
                        (true, Some(new_offset)) => leaf.offsets[pos] = new_offset,
                        (true, None) => {
                            leaf.keys.remove(pos);
                            leaf.offsets.remove(pos);
                        }
                        (false, Some(new_offset)) => {
                            leaf.keys.insert(pos, key.clone());
                            leaf.offsets.insert(pos, new_offset);
                        }
                        (false, None) => {}
                    }
                    return Ok(());
                }
                Node::Internal(internal) => {
                    let mut idx = internal.keys.partition_point(|k| k <= key);
                    let child = internal.children[idx].clone();
                    let child_full = child.read().is_full(t);
                    if child_full {
                        let (sep, sibling) = Self::split_node(&mut child.write(), t);
                        internal.keys.insert(idx, sep.clone());
                        internal.children.insert(idx + 1, sibling);
                        if *key >= sep {
                            idx += 1;
                        }
                    }
                    let next = internal.children[idx].clone();
                    drop(guard);
                    current = next;
                }
            }
        }
    }

    /// Splits a preemptively-full child, returning the separator key to
    /// install in the parent and the new right sibling.
    fn split_node(node: &mut Node, t: usize) -> (Key, NodeRef) {
        match node {
            Node::Leaf(leaf) => {
                let mid = t - 1;
                let right_keys = leaf.keys.split_off(mid);
                let right_offsets = leaf.offsets.split_off(mid);
                let sep = right_keys[0].clone();
                let right_next = leaf.next.take();
                let right = Arc::new(RwLock::new(Node::Leaf(Leaf {
                    keys: right_keys,
                    offsets: right_offsets,
                    next: right_next,
                })));
                leaf.next = Some(right.clone());
                (sep, right)
            }
            Node::Internal(internal) => {
                let mid = internal.keys.len() / 2;
                let sep = internal.keys[mid].clone();
                let right_keys = internal.keys.split_off(mid + 1);
                internal.keys.truncate(mid);
                let right_children = internal.children.split_off(mid + 1);
                let right = Arc::new(RwLock::new(Node::Internal(Internal {
                    keys: right_keys,
                    children: right_children,
                })));
                (sep, right)
            }
        }
    }

    fn preemptive_split_root(&self) {
        let t = self.t;
        let mut root_guard = self.root.write();
        let full = root_guard.read().is_full(t);
        if !full {
            return;
        }
        let old_root = root_guard.clone();
        let (sep, sibling) = Self::split_node(&mut old_root.write(), t);
        let new_root = Arc::new(RwLock::new(Node::Internal(Internal {
            keys: vec![sep],
            children: vec![old_root, sibling],
        })));
        *root_guard = new_root;
    }

    /// Removes `key`, rebalancing on the way down so the child descended
    /// into always has more than `t − 1` keys. Returns whether the key was
    /// present.
    pub fn remove(&self, key: &Key) -> bool {
        let t = self.t;
        let mut current = self.root.read().clone();
        loop {
            let mut guard = current.write();
            match &mut *guard {
                Node::Leaf(leaf) => {
                    return match leaf.keys.binary_search(key) {
                        Ok(pos) => {
                            leaf.keys.remove(pos);
                            leaf.offsets.remove(pos);
                            true
                        }
                        Err(_) => false,
                    };
                }
                Node::Internal(internal) => {
                    let idx = internal.keys.partition_point(|k| k <= key);
                    let below_min = internal.children[idx].read().len() <= t - 1;
                    if below_min {
                        Self::fixup_child(internal, idx, t);
                    }
                    let idx = internal.keys.partition_point(|k| k <= key);
                    let next = internal.children[idx].clone();
                    let is_root = Arc::ptr_eq(&current, &self.root.read());
                    drop(guard);
                    if is_root {
                        self.maybe_collapse_root();
                    }
                    current = next;
                }
            }
        }
    }

    /// Ensures `internal.children[idx]` has more than `t − 1` keys, by
    /// borrowing from a sibling or merging with one.
    fn fixup_child(internal: &mut Internal, idx: usize, t: usize) {
        let has_left = idx > 0;
        let has_right = idx + 1 < internal.children.len();

        if has_left && internal.children[idx - 1].read().len() > t - 1 {
            Self::borrow_from_left(internal, idx);
            return;
        }
        if has_right && internal.children[idx + 1].read().len() > t - 1 {
            Self::borrow_from_right(internal, idx);
            return;
        }
        if has_left {
            Self::merge_with_left(internal, idx);
        } else if has_right {
            Self::merge_with_right(internal, idx);
        }
        // Neither sibling exists: `idx`'s child is the tree's sole node and
        // may legitimately be under-full; nothing to rebalance against.
    }

    fn borrow_from_left(internal: &mut Internal, idx: usize) {
        let left_arc = internal.children[idx - 1].clone();
        let child_arc = internal.children[idx].clone();
        let mut left_guard = left_arc.write();
        let mut child_guard = child_arc.write();
        match (&mut *left_guard, &mut *child_guard) {
            (Node::Leaf(left), Node::Leaf(child)) => {
                let k = left.keys.pop().expect("left sibling has spare keys");
                let o = left.offsets.pop().expect("left sibling has spare keys");
                child.keys.insert(0, k);
                child.offsets.insert(0, o);
                internal.keys[idx - 1] = child.keys[0].clone();
            }
            (Node::Internal(left), Node::Internal(child)) => {
                let sep = internal.keys[idx - 1].clone();
                let moved_child = left.children.pop().expect("left sibling has spare children");
                let promoted = left.keys.pop().expect("left sibling has spare keys");
                child.keys.insert(0, sep);
                child.children.insert(0, moved_child);
                internal.keys[idx - 1] = promoted;
            }
            _ => unreachable!("sibling nodes at the same level must share a variant"),
        }
    }

    fn borrow_from_right(internal: &mut Internal, idx: usize) {
        let child_arc = internal.children[idx].clone();
        let right_arc = internal.children[idx + 1].clone();
        let mut child_guard = child_arc.write();
        let mut right_guard = right_arc.write();
        match (&mut *child_guard, &mut *right_guard) {
            (Node::Leaf(child), Node::Leaf(right)) => {
                let k = right.keys.remove(0);
                let o = right.offsets.remove(0);
                child.keys.push(k);
                child.offsets.push(o);
                internal.keys[idx] = right.keys[0].clone();
            }
            (Node::Internal(child), Node::Internal(right)) => {
                let sep = internal.keys[idx].clone();
                let moved_child = right.children.remove(0);
                let promoted = right.keys.remove(0);
                child.keys.push(sep);
                child.children.push(moved_child);
                internal.keys[idx] = promoted;
            }
            _ => unreachable!("sibling nodes at the same level must share a variant"),
        }
    }

    fn merge_with_left(internal: &mut Internal, idx: usize) {
        let left_arc = internal.children[idx - 1].clone();
        let child_arc = internal.children.remove(idx);
        let sep = internal.keys.remove(idx - 1);
        let mut left_guard = left_arc.write();
        let mut child_guard = child_arc.write();
        match (&mut *left_guard, &mut *child_guard) {
            (Node::Leaf(left), Node::Leaf(child)) => {
                left.keys.append(&mut child.keys);
                left.offsets.append(&mut child.offsets);
                left.next = child.next.take();
            }
            (Node::Internal(left), Node::Internal(child)) => {
                left.keys.push(sep);
                left.keys.append(&mut child.keys);
                left.children.append(&mut child.children);
            }
            _ => unreachable!("sibling nodes at the same level must share a variant"),
        }
    }

    fn merge_with_right(internal: &mut Internal, idx: usize) {
        let child_arc = internal.children[idx].clone();
        let right_arc = internal.children.remove(idx + 1);
        let sep = internal.keys.remove(idx);
        let mut child_guard = child_arc.write();
        let mut right_guard = right_arc.write();
        match (&mut *child_guard, &mut *right_guard) {
            (Node::Leaf(child), Node::Leaf(right)) => {
                child.keys.append(&mut right.keys);
                child.offsets.append(&mut right.offsets);
                child.next = right.next.take();
            }
            (Node::Internal(child), Node::Internal(right)) => {
                child.keys.push(sep);
                child.keys.append(&mut right.keys);
                child.children.append(&mut right.children);
            }
            _ => unreachable!("sibling nodes at the same level must share a variant"),
        }
    }

    fn maybe_collapse_root(&self) {
        let mut root_guard = self.root.write();
        let sole_child = {
            let node = root_guard.read();
            match &*node {
                Node::Internal(i) if i.keys.is_empty() && i.children.len() == 1 => Some(i.children[0].clone()),
                _ => None,
            }
        };
        if let Some(child) = sole_child {
            *root_guard = child;
        }
    }

    /// A cursor over every `(key, offset)` pair, ascending from the start.
    pub fn cursor_full(&self) -> Cursor {
        let mut current = self.root.read().clone();
        loop {
            let next = {
                let guard = current.read();
                match &*guard {
                    Node::Leaf(_) => None,
                    Node::Internal(internal) => Some(internal.children[0].clone()),
                }
            };
            match next {
                Some(child) => current = child,
                None => return Cursor::new(current, 0),
            }
        }
    }

    /// A cursor positioned at the first entry `>= key` (the lower-bound
    /// leaf lookup range scans seek from).
    pub fn cursor_from(&self, key: &Key) -> Cursor {
        let mut current = self.root.read().clone();
        loop {
            let step = {
                let guard = current.read();
                match &*guard {
                    Node::Leaf(leaf) => {
                        let idx = leaf.keys.partition_point(|k| k < key);
                        Err(idx)
                    }
                    Node::Internal(internal) => {
                        let idx = internal.keys.partition_point(|k| k <= key);
                        Ok(internal.children[idx].clone())
                    }
                }
            };
            match step {
                Ok(child) => current = child,
                Err(idx) => return Cursor::new(current, idx),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(v: i64) -> Key {
        Key::Int64(v)
    }

    #[test]
    fn insert_and_get() {
        let tree = BTree::new(3);
        for i in 0..50 {
            tree.insert(k(i), i * 10, false).unwrap();
        }
        for i in 0..50 {
            assert_eq!(tree.get(&k(i)), Some(i * 10));
        }
        assert_eq!(tree.get(&k(999)), None);
    }

    #[test]
    fn unique_index_rejects_duplicates() {
        let tree = BTree::new(3);
        assert!(tree.insert(k(1), 100, true).unwrap());
        assert!(!tree.insert(k(1), 200, true).unwrap());
        assert_eq!(tree.get(&k(1)), Some(100));
    }

    #[test]
    fn non_unique_index_replaces_offset() {
        let tree = BTree::new(3);
        tree.insert(k(1), 100, false).unwrap();
        tree.insert(k(1), 200, false).unwrap();
        assert_eq!(tree.get(&k(1)), Some(200));
    }

    #[test]
    fn remove_across_many_splits() {
        let tree = BTree::new(3);
        for i in 0..200 {
            tree.insert(k(i), i, false).unwrap();
        }
        for i in (0..200).step_by(2) {
            assert!(tree.remove(&k(i)));
        }
        for i in 0..200 {
            if i % 2 == 0 {
                assert_eq!(tree.get(&k(i)), None);
            } else {
                assert_eq!(tree.get(&k(i)), Some(i));
            }
        }
    }

    #[test]
    fn remove_missing_key_returns_false() {
        let tree = BTree::new(3);
        tree.insert(k(1), 1, false).unwrap();
        assert!(!tree.remove(&k(2)));
    }

    #[test]
    fn cursor_yields_ascending_order() {
        let tree = BTree::new(3);
        for i in (0..30).rev() {
            tree.insert(k(i), i, false).unwrap();
        }
        let collected: Vec<_> = tree.cursor_full().map(|(k, _)| k).collect();
        let expected: Vec<_> = (0..30).map(Key::Int64).collect();
        assert_eq!(collected, expected);
    }

    #[test]
    fn cursor_from_seeks_lower_bound() {
        let tree = BTree::new(3);
        for i in (0..30).step_by(2) {
            tree.insert(k(i), i, false).unwrap();
        }
        let first = tree.cursor_from(&k(7)).next();
        assert_eq!(first, Some((k(8), 8)));
    }

    #[test]
    fn removing_all_keys_empties_tree() {
        let tree = BTree::new(3);
        for i in 0..100 {
            tree.insert(k(i), i, false).unwrap();
        }
        for i in 0..100 {
            assert!(tree.remove(&k(i)));
        }
        assert_eq!(tree.get(&k(0)), None);
        assert_eq!(tree.cursor_full().next(), None);
    }
}
