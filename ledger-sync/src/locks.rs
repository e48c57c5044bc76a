//! Per-key write locks
//!
//! Reconciliations and optimistic submission writes take the locks of every
//! row they touch (transaction, asset, holders) before reading state. Keys are
//! acquired in sorted order so two writers never deadlock; writers on
//! disjoint keys proceed in parallel.

use dashmap::DashMap;
use parking_lot::{Mutex, RawMutex};
use std::collections::BTreeSet;
use std::sync::Arc;

type ArcGuard = parking_lot::lock_api::ArcMutexGuard<RawMutex, ()>;

/// Entries kept before idle locks are pruned
const PRUNE_THRESHOLD: usize = 4_096;

/// Lock key of a ledger row
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKey {
    /// Transaction row and its dedup records
    Transaction(String),
    /// Asset row
    Asset(String),
    /// Holder row `(asset_id, holder)`
    Holder(String, String),
}

/// Registry of row locks
#[derive(Default)]
pub struct KeyLocks {
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
}

impl KeyLocks {
    /// Create empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until every key in `keys` is held
    pub fn acquire(&self, keys: impl IntoIterator<Item = LockKey>) -> KeyGuard {
        let ordered: BTreeSet<LockKey> = keys.into_iter().collect();

        if self.locks.len() > PRUNE_THRESHOLD {
            self.prune();
        }

        let guards = ordered
            .into_iter()
            .map(|key| {
                let lock = self
                    .locks
                    .entry(key)
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .clone();
                lock.lock_arc()
            })
            .collect();

        KeyGuard { _guards: guards }
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// No tracked keys
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Drop locks nobody holds or waits on
    fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

/// Held locks; released on drop
pub struct KeyGuard {
    _guards: Vec<ArcGuard>,
}
