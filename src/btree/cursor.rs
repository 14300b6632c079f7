//! Range iteration over linked leaves.
//!
//! A cursor re-acquires a read latch on its current leaf for each step
//! rather than holding one across calls: cheaper to reason about than tying
//! the cursor's lifetime to an owning guard, at the cost of a latch per
//! step.

use crate::key::Key;

use super::core::{Node, NodeRef};

pub struct Cursor {
    leaf: Option<NodeRef>,
    index: usize,
}

impl Cursor {
    pub(crate) fn new(leaf: NodeRef, index: usize) -> Self {
        Self { leaf: Some(leaf), index }
    }
}

impl Iterator for Cursor {
    type Item = (Key, i64);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let leaf = self.leaf.clone()?;
            let guard = leaf.read();
            let Node::Leaf(l) = &*guard else {
                unreachable!("a leaf's `next` link always points at another leaf")
            };
            if self.index < l.keys.len() {
                let item = (l.keys[self.index].clone(), l.offsets[self.index]);
                self.index += 1;
                return Some(item);
            }
            let next = l.next.clone();
            drop(guard);
            self.leaf = next;
            self.index = 0;
        }
    }
}
