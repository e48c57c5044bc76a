//! Ledger reconciler
//!
//! Turns one raw log into at most one ledger effect: decode, build the
//! audit record, map the event to a [`Movement`] and commit it through the
//! [`Ledger`], which dedups by `(transaction_hash, log_index)`.
//!
//! Events that would drive a balance negative are kept unresolved. Every
//! applied event retries the held-back events of its asset, so a burn seen
//! before its mint settles as soon as the mint lands.

use crate::{
    decoder::{ChainEvent, EventDecoder},
    error::{Error, Result},
    ledger::{self, CommitOutcome, Ledger},
    metrics,
    state::{Movement, MovementKind, Origin},
    types::{BlockchainEvent, RawLog, ZERO_ADDRESS},
};
use alloy_primitives::Address;
use chrono::Utc;
use tracing::{debug, error, info, warn};

/// What happened to one log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Supply and balances changed
    Applied,
    /// Matched an optimistic submission write; status confirmed only
    Merged,
    /// Already processed
    Duplicate,
    /// Audit record only, no balance effect
    Recorded,
    /// Would break non-negativity; kept for retry
    Unresolved,
    /// Foreign contract or unknown signature
    Ignored,
}

impl ApplyOutcome {
    /// Label for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Applied => "applied",
            ApplyOutcome::Merged => "merged",
            ApplyOutcome::Duplicate => "duplicate",
            ApplyOutcome::Recorded => "recorded",
            ApplyOutcome::Unresolved => "unresolved",
            ApplyOutcome::Ignored => "ignored",
        }
    }
}

/// Counts from [`Reconciler::retry_unresolved`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    /// Unresolved events retried
    pub attempted: usize,
    /// Events that applied this time
    pub resolved: usize,
}

/// Applies decoded contract events to the ledger
#[derive(Clone)]
pub struct Reconciler {
    decoder: EventDecoder,
    ledger: Ledger,
    contract: Address,
    transfer_asset_id: Option<String>,
}

impl Reconciler {
    /// Create reconciler for events of `contract`
    pub fn new(
        decoder: EventDecoder,
        ledger: Ledger,
        contract: Address,
        transfer_asset_id: Option<String>,
    ) -> Self {
        Self {
            decoder,
            ledger,
            contract,
            transfer_asset_id,
        }
    }

    /// Token contract
    pub fn contract(&self) -> Address {
        self.contract
    }

    /// Apply one log
    ///
    /// Decode failures are returned as [`Error::Decode`]; callers log and
    /// move on to the next log.
    pub fn process_log(&self, log: &RawLog) -> Result<ApplyOutcome> {
        let (outcome, asset_id) = self.reconcile(log)?;
        if let (ApplyOutcome::Applied | ApplyOutcome::Merged, Some(asset_id)) = (outcome, asset_id) {
            if let Err(e) = self.settle_asset(&asset_id) {
                warn!(asset_id = %asset_id, error = %e, "Retry of held-back events failed");
            }
        }
        Ok(outcome)
    }

    /// [`Reconciler::process_log`] for async callers
    pub async fn process_log_blocking(&self, log: RawLog) -> Result<ApplyOutcome> {
        let reconciler = self.clone();
        ledger::blocking(move || reconciler.process_log(&log)).await
    }

    /// [`Reconciler::retry_unresolved`] for async callers
    pub async fn retry_unresolved_blocking(&self) -> Result<RetryReport> {
        let reconciler = self.clone();
        ledger::blocking(move || reconciler.retry_unresolved()).await
    }

    /// Apply one log without touching other held-back events
    fn reconcile(&self, log: &RawLog) -> Result<(ApplyOutcome, Option<String>)> {
        if log.address != self.contract {
            debug!(address = %log.address, "Ignoring log from foreign contract");
            return Ok((ApplyOutcome::Ignored, None));
        }

        let event = match self.decoder.decode(log) {
            Ok(event) => event,
            Err(e) => {
                metrics::EVENTS_TOTAL
                    .with_label_values(&["undecodable", "decode_error"])
                    .inc();
                return Err(Error::Decode(e));
            }
        };
        let label = event.kind().map_or("unknown", |k| k.as_str());

        let (outcome, asset_id) = self.apply(log, &event)?;
        metrics::EVENTS_TOTAL
            .with_label_values(&[label, outcome.as_str()])
            .inc();

        match outcome {
            ApplyOutcome::Applied | ApplyOutcome::Merged => info!(
                tx_hash = %log.transaction_hash,
                log_index = log.log_index,
                block = log.block_number,
                event = event.name(),
                outcome = outcome.as_str(),
                "Event reconciled"
            ),
            ApplyOutcome::Duplicate => debug!(
                tx_hash = %log.transaction_hash,
                log_index = log.log_index,
                "Event already processed"
            ),
            _ => {}
        }

        Ok((outcome, asset_id))
    }

    fn apply(&self, log: &RawLog, event: &ChainEvent) -> Result<(ApplyOutcome, Option<String>)> {
        let (asset_id, kind, amount, asset_type, issuer) = match event {
            ChainEvent::Minted {
                asset_id,
                issuer,
                amount,
                asset_type,
            } => (
                asset_id.clone(),
                MovementKind::Mint { to: *issuer },
                *amount,
                Some(asset_type.clone()),
                Some(issuer.to_string()),
            ),
            ChainEvent::Burned {
                asset_id,
                burner,
                amount,
            } => (
                asset_id.clone(),
                MovementKind::Burn { from: *burner },
                *amount,
                None,
                None,
            ),
            ChainEvent::Transferred { from, to, amount } => {
                // Mint/burn companions are covered by AssetMinted/AssetBurned
                if *from == ZERO_ADDRESS || *to == ZERO_ADDRESS {
                    return self.record_only(log, event);
                }
                let Some(asset_id) = self.transfer_asset_id.clone() else {
                    return self.record_only(log, event);
                };
                (
                    asset_id,
                    MovementKind::Transfer {
                        from: *from,
                        to: *to,
                    },
                    *amount,
                    None,
                    None,
                )
            }
            ChainEvent::Unknown { topic0 } => {
                debug!(topic0 = %topic0, tx_hash = %log.transaction_hash, "Unknown event signature");
                return Ok((ApplyOutcome::Ignored, None));
            }
        };

        let movement = Movement {
            transaction_hash: log.transaction_hash,
            asset_id,
            kind,
            amount,
            asset_type,
            issuer,
            contract: self.contract,
            origin: Origin::Chain {
                block_number: log.block_number,
                log_index: log.log_index,
            },
        };

        let mut record = audit_record(log, event);
        record.asset_id = Some(movement.asset_id.clone());
        let outcome = match self.ledger.commit_movement(&movement, Some(&record))? {
            CommitOutcome::Applied => ApplyOutcome::Applied,
            CommitOutcome::Merged => ApplyOutcome::Merged,
            CommitOutcome::Duplicate => ApplyOutcome::Duplicate,
            CommitOutcome::Unresolved(violation) => {
                metrics::INVARIANT_VIOLATIONS_TOTAL
                    .with_label_values(&[event.kind().map_or("unknown", |k| k.as_str())])
                    .inc();
                error!(
                    tx_hash = %log.transaction_hash,
                    log_index = log.log_index,
                    asset_id = %movement.asset_id,
                    violation = %violation,
                    "Event left unresolved"
                );
                ApplyOutcome::Unresolved
            }
        };
        Ok((outcome, Some(movement.asset_id)))
    }

    fn record_only(&self, log: &RawLog, event: &ChainEvent) -> Result<(ApplyOutcome, Option<String>)> {
        if self.ledger.record_observation(&audit_record(log, event))? {
            debug!(
                tx_hash = %log.transaction_hash,
                log_index = log.log_index,
                "Transfer recorded without balance effect"
            );
            Ok((ApplyOutcome::Recorded, None))
        } else {
            Ok((ApplyOutcome::Duplicate, None))
        }
    }

    /// Retry held-back events of `asset_id` until a pass resolves nothing
    fn settle_asset(&self, asset_id: &str) -> Result<usize> {
        let mut resolved = 0;
        loop {
            let mut progressed = false;
            for event in self.ledger.storage().unresolved_events_for_asset(asset_id)? {
                match self.reconcile(&event.raw) {
                    Ok((ApplyOutcome::Applied | ApplyOutcome::Merged, _)) => {
                        resolved += 1;
                        progressed = true;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(
                        tx_hash = %event.transaction_hash,
                        log_index = event.log_index,
                        error = %e,
                        "Retry of unresolved event failed"
                    ),
                }
            }
            if !progressed {
                break;
            }
        }

        if resolved > 0 {
            info!(asset_id = %asset_id, resolved, "Held-back events settled");
        }
        Ok(resolved)
    }

    /// Re-run every unresolved event; later events may have made them valid
    pub fn retry_unresolved(&self) -> Result<RetryReport> {
        let pending = self.ledger.storage().unresolved_events()?;
        let mut report = RetryReport {
            attempted: pending.len(),
            resolved: 0,
        };

        for event in pending {
            match self.reconcile(&event.raw) {
                Ok((ApplyOutcome::Applied | ApplyOutcome::Merged, _)) => report.resolved += 1,
                Ok(_) => {}
                Err(e) => warn!(
                    tx_hash = %event.transaction_hash,
                    log_index = event.log_index,
                    error = %e,
                    "Retry of unresolved event failed"
                ),
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                resolved = report.resolved,
                "Retried unresolved events"
            );
        }
        Ok(report)
    }
}

fn audit_record(log: &RawLog, event: &ChainEvent) -> BlockchainEvent {
    BlockchainEvent {
        transaction_hash: log.transaction_hash,
        log_index: log.log_index,
        event_name: event.name().to_string(),
        asset_id: None,
        contract_address: log.address,
        block_number: log.block_number,
        payload: event.payload(),
        raw: log.clone(),
        processed: false,
        processed_at: None,
        observed_at: Utc::now(),
        unresolved_reason: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{burned_log, foreign_log, minted_log, transfer_log, LogPosition};
    use crate::storage::Storage;
    use crate::types::{TransactionStatus, TransactionType};
    use crate::Config;
    use alloy_primitives::{Bytes, B256, U256};
    use std::sync::Arc;
    use tempfile::TempDir;

    const CONTRACT: Address = Address::repeat_byte(0xcc);
    const ALICE: Address = Address::repeat_byte(0xaa);
    const BOB: Address = Address::repeat_byte(0xbb);

    fn setup(transfer_asset: Option<&str>) -> (Reconciler, Storage, TempDir) {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        let storage = Storage::open(&config).unwrap();
        storage.register_asset_id("BOND-1").unwrap();
        let reconciler = Reconciler::new(
            EventDecoder::new(Arc::new(storage.clone())),
            Ledger::new(storage.clone()),
            CONTRACT,
            transfer_asset.map(str::to_string),
        );
        (reconciler, storage, temp)
    }

    fn at(tx: u8, block: u64, log_index: u64) -> LogPosition {
        LogPosition {
            contract: CONTRACT,
            transaction_hash: B256::repeat_byte(tx),
            block_number: block,
            log_index,
        }
    }

    #[test]
    fn test_mint_then_burn() {
        let (reconciler, storage, _temp) = setup(None);

        let mint = minted_log(at(1, 10, 0), "BOND-1", ALICE, U256::from(1000u64), "CORPORATE_BOND");
        let burn = burned_log(at(2, 11, 0), "BOND-1", ALICE, U256::from(300u64));
        assert_eq!(reconciler.process_log(&mint).unwrap(), ApplyOutcome::Applied);
        assert_eq!(reconciler.process_log(&burn).unwrap(), ApplyOutcome::Applied);

        let asset = storage.get_asset("BOND-1").unwrap().unwrap();
        assert_eq!(asset.total_supply, U256::from(700u64));
        assert_eq!(asset.contract_address, CONTRACT);
        let holder = storage.get_holder("BOND-1", &ALICE).unwrap().unwrap();
        assert_eq!(holder.balance, U256::from(700u64));

        let txs = storage.transactions_by_asset("BOND-1").unwrap();
        assert_eq!(txs.len(), 2);
        assert!(txs.iter().all(|t| t.status == TransactionStatus::Confirmed));
        let burn_tx = storage.get_transaction(&B256::repeat_byte(2)).unwrap().unwrap();
        assert_eq!(burn_tx.transaction_type, TransactionType::Burn);
        assert_eq!(burn_tx.block_number, Some(11));
    }

    #[test]
    fn test_duplicate_delivery() {
        let (reconciler, storage, _temp) = setup(None);
        let mint = minted_log(at(1, 10, 0), "BOND-1", ALICE, U256::from(5u64), "T");

        assert_eq!(reconciler.process_log(&mint).unwrap(), ApplyOutcome::Applied);
        assert_eq!(reconciler.process_log(&mint).unwrap(), ApplyOutcome::Duplicate);
        assert_eq!(
            storage.get_asset("BOND-1").unwrap().unwrap().total_supply,
            U256::from(5u64)
        );
    }

    #[test]
    fn test_zero_side_transfer_is_recorded_only() {
        let (reconciler, storage, _temp) = setup(Some("BOND-1"));
        let companion = transfer_log(at(1, 10, 1), ZERO_ADDRESS, ALICE, U256::from(5u64));

        assert_eq!(reconciler.process_log(&companion).unwrap(), ApplyOutcome::Recorded);
        assert_eq!(reconciler.process_log(&companion).unwrap(), ApplyOutcome::Duplicate);
        assert!(storage.get_holder("BOND-1", &ALICE).unwrap().is_none());
        assert!(storage.get_event(&companion.key()).unwrap().unwrap().processed);
    }

    #[test]
    fn test_transfer_without_configured_asset_is_recorded_only() {
        let (reconciler, storage, _temp) = setup(None);
        let transfer = transfer_log(at(3, 12, 0), ALICE, BOB, U256::from(5u64));
        assert_eq!(reconciler.process_log(&transfer).unwrap(), ApplyOutcome::Recorded);
        assert!(storage.get_transaction(&B256::repeat_byte(3)).unwrap().is_none());
    }

    #[test]
    fn test_transfer_moves_configured_asset() {
        let (reconciler, storage, _temp) = setup(Some("BOND-1"));
        reconciler
            .process_log(&minted_log(at(1, 10, 0), "BOND-1", ALICE, U256::from(10u64), "T"))
            .unwrap();
        reconciler
            .process_log(&transfer_log(at(2, 11, 0), ALICE, BOB, U256::from(4u64)))
            .unwrap();

        assert_eq!(storage.get_holder("BOND-1", &ALICE).unwrap().unwrap().balance, U256::from(6u64));
        assert_eq!(storage.get_holder("BOND-1", &BOB).unwrap().unwrap().balance, U256::from(4u64));
        assert_eq!(
            storage.get_asset("BOND-1").unwrap().unwrap().total_supply,
            U256::from(10u64)
        );
    }

    #[test]
    fn test_out_of_order_burn_settles_when_mint_lands() {
        let (reconciler, storage, _temp) = setup(None);
        let burn = burned_log(at(2, 11, 0), "BOND-1", ALICE, U256::from(300u64));
        let mint = minted_log(at(1, 10, 0), "BOND-1", ALICE, U256::from(1000u64), "T");

        assert_eq!(reconciler.process_log(&burn).unwrap(), ApplyOutcome::Unresolved);
        assert_eq!(storage.unresolved_events_for_asset("BOND-1").unwrap().len(), 1);
        assert_eq!(reconciler.process_log(&mint).unwrap(), ApplyOutcome::Applied);

        assert!(storage.unresolved_events().unwrap().is_empty());
        assert_eq!(
            storage.get_asset("BOND-1").unwrap().unwrap().total_supply,
            U256::from(700u64)
        );
        assert!(storage.get_event(&burn.key()).unwrap().unwrap().processed);
        assert_eq!(reconciler.retry_unresolved().unwrap(), RetryReport::default());
    }

    #[test]
    fn test_settling_stays_within_the_asset() {
        let (reconciler, storage, _temp) = setup(None);
        storage.register_asset_id("BOND-2").unwrap();
        let stray = burned_log(at(3, 12, 0), "BOND-2", ALICE, U256::from(5u64));
        let mint = minted_log(at(1, 10, 0), "BOND-1", ALICE, U256::from(10u64), "T");

        assert_eq!(reconciler.process_log(&stray).unwrap(), ApplyOutcome::Unresolved);
        assert_eq!(reconciler.process_log(&mint).unwrap(), ApplyOutcome::Applied);

        let held = storage.unresolved_events().unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].asset_id.as_deref(), Some("BOND-2"));
    }

    #[test]
    fn test_retry_picks_up_effects_applied_elsewhere() {
        let (reconciler, storage, _temp) = setup(None);
        let burn = burned_log(at(2, 11, 0), "BOND-1", ALICE, U256::from(3u64));
        assert_eq!(reconciler.process_log(&burn).unwrap(), ApplyOutcome::Unresolved);

        // A submission commit does not pass through the reconciler
        let submitted = Movement {
            transaction_hash: B256::repeat_byte(1),
            asset_id: "BOND-1".to_string(),
            kind: MovementKind::Mint { to: ALICE },
            amount: U256::from(10u64),
            asset_type: Some("T".to_string()),
            issuer: Some(ALICE.to_string()),
            contract: CONTRACT,
            origin: Origin::Submission { gas_used: 21_000 },
        };
        reconciler.ledger.commit_movement(&submitted, None).unwrap();
        assert_eq!(storage.unresolved_events().unwrap().len(), 1);

        let report = reconciler.retry_unresolved().unwrap();
        assert_eq!(report, RetryReport { attempted: 1, resolved: 1 });
        assert_eq!(
            storage.get_holder("BOND-1", &ALICE).unwrap().unwrap().balance,
            U256::from(7u64)
        );
    }

    #[test]
    fn test_foreign_and_malformed_logs() {
        let (reconciler, _storage, _temp) = setup(None);

        let mut foreign = minted_log(at(1, 1, 0), "BOND-1", ALICE, U256::from(1u64), "T");
        foreign.address = Address::repeat_byte(0x01);
        assert_eq!(reconciler.process_log(&foreign).unwrap(), ApplyOutcome::Ignored);

        let unknown = foreign_log(at(1, 1, 1), B256::repeat_byte(0x77));
        assert_eq!(reconciler.process_log(&unknown).unwrap(), ApplyOutcome::Ignored);

        let mut broken = minted_log(at(1, 1, 2), "BOND-1", ALICE, U256::from(1u64), "T");
        broken.data = Bytes::from_static(&[1, 2, 3]);
        assert!(matches!(reconciler.process_log(&broken), Err(Error::Decode(_))));
    }
}
