//! Scan conditions and the seek/stop predicates that let the engine choose
//! between an indexed and a full scan path.

use crate::key::Key;

#[derive(Debug, Clone)]
pub enum ScanCondition {
    Eq(Key),
    Ne(Key),
    Gt(Key),
    Ge(Key),
    Lt(Key),
    Le(Key),
    /// Inclusive on both ends.
    Between(Key, Key),
}

impl ScanCondition {
    /// True for `{=, >, >=, Between}`: the cursor seeks to the lower bound
    /// of the starting key rather than scanning from the beginning.
    pub fn should_seek(&self) -> bool {
        matches!(self, Self::Eq(_) | Self::Gt(_) | Self::Ge(_) | Self::Between(_, _))
    }

    pub fn seek_key(&self) -> Option<&Key> {
        match self {
            Self::Eq(k) | Self::Gt(k) | Self::Ge(k) => Some(k),
            Self::Between(lo, _) => Some(lo),
            Self::Ne(_) | Self::Lt(_) | Self::Le(_) => None,
        }
    }

    /// Whether a cursor positioned at `key` should stop *without* visiting
    /// it: for `=`/`<`/`<=`/`Between` iteration halts once the boundary is
    /// passed; `>`, `>=`, `!=` run to the end of the index.
    pub fn should_stop_before(&self, key: &Key) -> bool {
        match self {
            Self::Eq(k) => key > k,
            Self::Lt(k) => key >= k,
            Self::Le(k) => key > k,
            Self::Between(_, hi) => key > hi,
            Self::Gt(_) | Self::Ge(_) | Self::Ne(_) => false,
        }
    }

    pub fn matches(&self, key: &Key) -> bool {
        match self {
            Self::Eq(k) => key == k,
            Self::Ne(k) => key != k,
            Self::Gt(k) => key > k,
            Self::Ge(k) => key >= k,
            Self::Lt(k) => key < k,
            Self::Le(k) => key <= k,
            Self::Between(lo, hi) => key >= lo && key <= hi,
        }
    }
}
