//! Event dedup ledger
//!
//! Durable record of which `(transaction_hash, log_index)` pairs have already
//! produced their ledger effect. A claim is only a read; it becomes durable
//! when [`DedupLedger::mark_processed`] is written in the same
//! [`LedgerBatch`] as the effect itself, while the caller holds the
//! transaction's row lock.

use crate::error::Result;
use crate::storage::{LedgerBatch, Storage};
use crate::types::{BlockchainEvent, EventKey};
use chrono::{DateTime, Utc};

/// Result of [`DedupLedger::try_claim`]
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// Effect not yet applied; `previous` is an earlier unresolved record
    Claimed {
        /// Earlier record of this log, if it was seen before
        previous: Option<BlockchainEvent>,
    },
    /// Effect already committed
    AlreadyProcessed,
}

/// Dedup ledger over the `events` column family
#[derive(Clone)]
pub struct DedupLedger {
    storage: Storage,
}

impl DedupLedger {
    /// Create ledger over `storage`
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Check whether `key` may still produce an effect
    pub fn try_claim(&self, key: &EventKey) -> Result<Claim> {
        match self.storage.get_event(key)? {
            Some(event) if event.processed => Ok(Claim::AlreadyProcessed),
            previous => Ok(Claim::Claimed { previous }),
        }
    }

    /// Queue the terminal processed record of `event`
    pub fn mark_processed(
        &self,
        batch: &mut LedgerBatch,
        event: &BlockchainEvent,
        previous: Option<&BlockchainEvent>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut record = event.clone();
        if let Some(prev) = previous {
            record.observed_at = prev.observed_at;
        }
        record.processed = true;
        record.processed_at = Some(at);
        record.unresolved_reason = None;
        batch.put_event(&record)
    }

    /// Queue an unprocessed record kept for retry
    pub fn record_unresolved(
        &self,
        batch: &mut LedgerBatch,
        event: &BlockchainEvent,
        previous: Option<&BlockchainEvent>,
        reason: &str,
    ) -> Result<()> {
        let mut record = event.clone();
        if let Some(prev) = previous {
            record.observed_at = prev.observed_at;
        }
        record.processed = false;
        record.processed_at = None;
        record.unresolved_reason = Some(reason.to_string());
        batch.put_event(&record)
    }
}
