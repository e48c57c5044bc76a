//! Ledger write path
//!
//! Every ledger mutation goes through [`Ledger`]: it takes the row locks of
//! the movement, consults the dedup ledger, computes the transition and
//! commits the rows together with the dedup record in one RocksDB batch.
//! A crash therefore leaves an event either fully applied and marked
//! processed, or not applied and still claimable.

use crate::{
    dedup::{Claim, DedupLedger},
    error::{Error, InvariantViolation, Result},
    locks::{KeyLocks, LockKey},
    state::{self, Effect, LedgerView, Movement},
    storage::{LedgerBatch, Storage},
    types::{BlockchainEvent, Transaction, TransactionStatus},
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

/// Result of [`Ledger::commit_movement`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Supply and balances changed
    Applied,
    /// The other path had already applied it; status merged
    Merged,
    /// This log was processed before
    Duplicate,
    /// Effect would break non-negativity; kept for retry
    Unresolved(InvariantViolation),
}

/// Run ledger work on the blocking pool
///
/// Commits hold row locks across RocksDB writes; async callers go through
/// here so they never park a runtime worker.
pub async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Concurrency(format!("ledger task failed: {}", e)))?
}

/// Serialized, atomic writer over [`Storage`]
#[derive(Clone)]
pub struct Ledger {
    storage: Storage,
    dedup: DedupLedger,
    locks: Arc<KeyLocks>,
}

impl Ledger {
    /// Create ledger over `storage`
    pub fn new(storage: Storage) -> Self {
        Self {
            dedup: DedupLedger::new(storage.clone()),
            storage,
            locks: Arc::new(KeyLocks::new()),
        }
    }

    /// Underlying storage
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Apply `movement`, claiming `event` in the same batch when given
    pub fn commit_movement(
        &self,
        movement: &Movement,
        event: Option<&BlockchainEvent>,
    ) -> Result<CommitOutcome> {
        let _guard = self.locks.acquire(movement.lock_keys());

        let previous = match event {
            Some(ev) => match self.dedup.try_claim(&ev.key())? {
                Claim::AlreadyProcessed => return Ok(CommitOutcome::Duplicate),
                Claim::Claimed { previous } => previous,
            },
            None => None,
        };

        let view = self.load_view(movement)?;
        let now = Utc::now();
        let mut batch = LedgerBatch::new();

        match state::transition(&view, movement, now) {
            Ok(change) => {
                if let Some(asset) = &change.asset {
                    batch.put_asset(asset)?;
                }
                for holder in &change.holders {
                    batch.put_holder(holder)?;
                }
                if let Some(tx) = &change.transaction {
                    batch.put_transaction(tx)?;
                }
                if let Some(ev) = event {
                    self.dedup
                        .mark_processed(&mut batch, ev, previous.as_ref(), now)?;
                }
                self.storage.write(batch)?;

                Ok(match change.effect {
                    Effect::Applied => CommitOutcome::Applied,
                    Effect::Merged => CommitOutcome::Merged,
                })
            }
            Err(violation) => {
                match event {
                    Some(ev) => {
                        self.dedup.record_unresolved(
                            &mut batch,
                            ev,
                            previous.as_ref(),
                            &violation.to_string(),
                        )?;
                    }
                    None => {
                        // Keep the submission visible without a ledger effect
                        if view.transaction.as_ref().map_or(true, |tx| !tx.ledger_applied) {
                            let tx = state::unapplied_record(view.transaction.as_ref(), movement, now);
                            batch.put_transaction(&tx)?;
                        }
                    }
                }
                self.storage.write(batch)?;
                Ok(CommitOutcome::Unresolved(violation))
            }
        }
    }

    /// Mark a log with no ledger effect as processed; `false` if seen before
    pub fn record_observation(&self, event: &BlockchainEvent) -> Result<bool> {
        let _guard = self
            .locks
            .acquire([LockKey::Transaction(event.transaction_hash.to_string())]);

        let previous = match self.dedup.try_claim(&event.key())? {
            Claim::AlreadyProcessed => return Ok(false),
            Claim::Claimed { previous } => previous,
        };

        let mut batch = LedgerBatch::new();
        self.dedup
            .mark_processed(&mut batch, event, previous.as_ref(), Utc::now())?;
        self.storage.write(batch)?;
        Ok(true)
    }

    /// Write a PENDING/FAILED submission record
    ///
    /// Never overwrites a record whose effect is already applied, so a
    /// CONFIRMED row stays CONFIRMED. Returns the row as stored.
    pub fn record_submission_status(&self, draft: Transaction) -> Result<Transaction> {
        let _guard = self
            .locks
            .acquire([LockKey::Transaction(draft.transaction_hash.to_string())]);

        if let Some(existing) = self.storage.get_transaction(&draft.transaction_hash)? {
            if existing.ledger_applied || existing.status == TransactionStatus::Confirmed {
                tracing::debug!(
                    tx_hash = %existing.transaction_hash,
                    status = %existing.status,
                    "Keeping reconciled transaction record"
                );
                return Ok(existing);
            }
            let mut merged = draft;
            merged.created_at = existing.created_at;
            merged.gas_used = merged.gas_used.or(existing.gas_used);
            return self.put_transaction(merged);
        }

        self.put_transaction(draft)
    }

    fn put_transaction(&self, tx: Transaction) -> Result<Transaction> {
        let mut batch = LedgerBatch::new();
        batch.put_transaction(&tx)?;
        self.storage.write(batch)?;
        Ok(tx)
    }

    fn load_view(&self, movement: &Movement) -> Result<LedgerView> {
        let mut holders = HashMap::new();
        for addr in movement.kind.holders() {
            if let Some(row) = self.storage.get_holder(&movement.asset_id, &addr)? {
                holders.insert(addr, row);
            }
        }
        Ok(LedgerView {
            asset: self.storage.get_asset(&movement.asset_id)?,
            holders,
            transaction: self.storage.get_transaction(&movement.transaction_hash)?,
        })
    }
}
