//! Replay coordinator
//!
//! Fetches historical logs of the token contract in chunks of
//! `max_block_range` blocks, orders them by `(block_number, log_index)` and
//! feeds them through the reconciler. Re-running a range is harmless: the
//! dedup ledger turns already-processed logs into no-ops.

use crate::{
    chain::ChainClient,
    error::Result,
    metrics,
    reconciler::{ApplyOutcome, Reconciler},
    storage::Storage,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Where a replay starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    /// From the configured start block
    Full,
    /// From the last replay checkpoint (falls back to the start block)
    Resume,
}

/// Counts from one replay
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// First block fetched
    pub from_block: u64,
    /// Last block fetched (chain head at start)
    pub to_block: u64,
    /// Logs fetched
    pub fetched: usize,
    /// Logs that changed balances
    pub applied: usize,
    /// Logs merged into optimistic submission writes
    pub merged: usize,
    /// Logs already processed
    pub duplicates: usize,
    /// Logs recorded without balance effect
    pub recorded: usize,
    /// Logs left unresolved
    pub unresolved: usize,
    /// Foreign or unknown logs
    pub ignored: usize,
    /// Logs that failed to decode or apply
    pub skipped: usize,
    /// Earlier unresolved events applied at the end of this run
    pub resolved_on_retry: usize,
}

impl ReplayReport {
    /// Logs handled without error
    pub fn processed(&self) -> usize {
        self.fetched - self.skipped
    }

    /// Fold in a later run that continued from this one
    pub fn extend(&mut self, later: &ReplayReport) {
        self.to_block = self.to_block.max(later.to_block);
        self.fetched += later.fetched;
        self.applied += later.applied;
        self.merged += later.merged;
        self.duplicates += later.duplicates;
        self.recorded += later.recorded;
        self.unresolved += later.unresolved;
        self.ignored += later.ignored;
        self.skipped += later.skipped;
        self.resolved_on_retry += later.resolved_on_retry;
    }

    fn count(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied => self.applied += 1,
            ApplyOutcome::Merged => self.merged += 1,
            ApplyOutcome::Duplicate => self.duplicates += 1,
            ApplyOutcome::Recorded => self.recorded += 1,
            ApplyOutcome::Unresolved => self.unresolved += 1,
            ApplyOutcome::Ignored => self.ignored += 1,
        }
    }
}

/// Replays historical logs through the reconciler
#[derive(Clone)]
pub struct ReplayCoordinator {
    chain: Arc<dyn ChainClient>,
    reconciler: Reconciler,
    storage: Storage,
    start_block: u64,
    max_block_range: u64,
}

impl ReplayCoordinator {
    /// Create coordinator
    pub fn new(
        chain: Arc<dyn ChainClient>,
        reconciler: Reconciler,
        storage: Storage,
        start_block: u64,
        max_block_range: u64,
    ) -> Self {
        Self {
            chain,
            reconciler,
            storage,
            start_block,
            max_block_range: max_block_range.max(1),
        }
    }

    /// Replay up to the current head
    ///
    /// Per-log failures are counted as skipped; only a failure to reach the
    /// chain aborts the run.
    pub async fn run(&self, mode: ReplayMode) -> Result<ReplayReport> {
        let started = Instant::now();
        let result = self.replay(mode).await;
        metrics::REPLAY_DURATION.observe(started.elapsed().as_secs_f64());

        match &result {
            Ok(report) => {
                metrics::REPLAY_RUNS_TOTAL.with_label_values(&["ok"]).inc();
                info!(
                    from_block = report.from_block,
                    to_block = report.to_block,
                    fetched = report.fetched,
                    processed = report.processed(),
                    applied = report.applied,
                    duplicates = report.duplicates,
                    unresolved = report.unresolved,
                    skipped = report.skipped,
                    "Replay completed"
                );
            }
            Err(e) => {
                metrics::REPLAY_RUNS_TOTAL.with_label_values(&["failed"]).inc();
                warn!(error = %e, "Replay aborted");
            }
        }
        result
    }

    async fn replay(&self, mode: ReplayMode) -> Result<ReplayReport> {
        let head = self.chain.block_number().await?;
        let from_block = match mode {
            ReplayMode::Full => self.start_block,
            ReplayMode::Resume => self
                .storage
                .replay_checkpoint()?
                .map_or(self.start_block, |checkpoint| checkpoint.max(self.start_block)),
        };

        let mut report = ReplayReport {
            from_block,
            to_block: head,
            ..Default::default()
        };

        let contract = self.reconciler.contract();
        let mut chunk_start = from_block;
        while chunk_start <= head {
            let chunk_end = chunk_start
                .saturating_add(self.max_block_range - 1)
                .min(head);

            let mut logs = self.chain.get_logs(contract, chunk_start, chunk_end).await?;
            logs.sort_by_key(|log| (log.block_number, log.log_index));
            report.fetched += logs.len();

            for log in &logs {
                match self.reconciler.process_log_blocking(log.clone()).await {
                    Ok(outcome) => report.count(outcome),
                    Err(e) => {
                        report.skipped += 1;
                        warn!(
                            tx_hash = %log.transaction_hash,
                            log_index = log.log_index,
                            block = log.block_number,
                            error = %e,
                            "Skipping log during replay"
                        );
                    }
                }
            }

            if chunk_end == u64::MAX {
                break;
            }
            chunk_start = chunk_end + 1;
        }

        report.resolved_on_retry = self.reconciler.retry_unresolved_blocking().await?.resolved;
        self.storage.set_replay_checkpoint(head)?;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChain;
    use crate::decoder::{burned_log, minted_log, EventDecoder, LogPosition};
    use crate::ledger::Ledger;
    use crate::Config;
    use alloy_primitives::{Address, Bytes, B256, U256};
    use tempfile::TempDir;

    const CONTRACT: Address = Address::repeat_byte(0xcc);
    const ALICE: Address = Address::repeat_byte(0xaa);

    fn at(tx: u8, block: u64, log_index: u64) -> LogPosition {
        LogPosition {
            contract: CONTRACT,
            transaction_hash: B256::repeat_byte(tx),
            block_number: block,
            log_index,
        }
    }

    fn setup(range: u64) -> (ReplayCoordinator, Arc<MockChain>, Storage, TempDir) {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        let storage = Storage::open(&config).unwrap();
        storage.register_asset_id("BOND-1").unwrap();
        let chain = Arc::new(MockChain::new());
        let reconciler = Reconciler::new(
            EventDecoder::new(Arc::new(storage.clone())),
            Ledger::new(storage.clone()),
            CONTRACT,
            None,
        );
        let replay = ReplayCoordinator::new(chain.clone(), reconciler, storage.clone(), 0, range);
        (replay, chain, storage, temp)
    }

    #[tokio::test]
    async fn test_replay_orders_and_counts() {
        let (replay, chain, storage, _temp) = setup(3);
        // Burn is pushed first but sits in a later block
        chain.push_historical_log(burned_log(at(2, 7, 0), "BOND-1", ALICE, U256::from(300u64)));
        chain.push_historical_log(minted_log(at(1, 2, 0), "BOND-1", ALICE, U256::from(1000u64), "T"));
        let mut broken = minted_log(at(3, 8, 0), "BOND-1", ALICE, U256::from(1u64), "T");
        broken.data = Bytes::from_static(&[0xde, 0xad]);
        chain.push_historical_log(broken);

        let report = replay.run(ReplayMode::Full).await.unwrap();
        assert_eq!(report.from_block, 0);
        assert_eq!(report.to_block, 8);
        assert_eq!(report.fetched, 3);
        assert_eq!(report.applied, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.processed(), 2);
        assert_eq!(storage.replay_checkpoint().unwrap(), Some(8));
        assert_eq!(
            storage.get_asset("BOND-1").unwrap().unwrap().total_supply,
            U256::from(700u64)
        );
    }

    #[tokio::test]
    async fn test_replay_twice_is_idempotent() {
        let (replay, chain, storage, _temp) = setup(5_000);
        chain.push_historical_log(minted_log(at(1, 1, 0), "BOND-1", ALICE, U256::from(10u64), "T"));

        replay.run(ReplayMode::Full).await.unwrap();
        let second = replay.run(ReplayMode::Full).await.unwrap();
        assert_eq!(second.applied, 0);
        assert_eq!(second.duplicates, 1);
        assert_eq!(
            storage.get_holder("BOND-1", &ALICE).unwrap().unwrap().balance,
            U256::from(10u64)
        );
    }

    #[tokio::test]
    async fn test_resume_starts_at_checkpoint() {
        let (replay, chain, _storage, _temp) = setup(5_000);
        chain.set_head(50);
        replay.run(ReplayMode::Full).await.unwrap();

        chain.push_historical_log(minted_log(at(1, 60, 0), "BOND-1", ALICE, U256::from(1u64), "T"));
        let report = replay.run(ReplayMode::Resume).await.unwrap();
        assert_eq!(report.from_block, 50);
        assert_eq!(report.to_block, 60);
        assert_eq!(report.applied, 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_aborts() {
        let (replay, chain, storage, _temp) = setup(5_000);
        chain.set_head(10);
        chain.fail_next_get_logs(1);
        assert!(replay.run(ReplayMode::Full).await.is_err());
        assert_eq!(storage.replay_checkpoint().unwrap(), None);
    }
}
