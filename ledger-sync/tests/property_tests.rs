//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify:
//! - Idempotence: processing a log twice equals processing it once
//! - Order independence: any delivery order converges without a manual retry
//! - Non-negativity: supply always equals the sum of holder balances

use alloy_primitives::{Address, B256, U256};
use ledger_sync::{
    decoder::{burned_log, minted_log, EventDecoder, LogPosition},
    ledger::Ledger,
    query::LedgerQueries,
    reconciler::{ApplyOutcome, Reconciler},
    storage::Storage,
    Config, RawLog,
};
use proptest::prelude::*;
use std::sync::Arc;
use tempfile::TempDir;

const CONTRACT: Address = Address::repeat_byte(0xcc);
const ASSET: &str = "BOND-1";

/// One mint or burn against one of three holders
#[derive(Debug, Clone, Copy)]
struct Op {
    mint: bool,
    holder: u8,
    amount: u64,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    (any::<bool>(), 0u8..3, 1u64..1_000).prop_map(|(mint, holder, amount)| Op {
        mint,
        holder,
        amount,
    })
}

/// Mints plus burns that never exceed what the same holder was minted
fn balanced_strategy() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec((0u8..3, 2u64..1_000, any::<bool>()), 1..12).prop_map(|mints| {
        let mut ops = Vec::new();
        for (holder, amount, burn_half) in mints {
            ops.push(Op {
                mint: true,
                holder,
                amount,
            });
            if burn_half {
                ops.push(Op {
                    mint: false,
                    holder,
                    amount: amount / 2,
                });
            }
        }
        ops
    })
}

fn holder(idx: u8) -> Address {
    Address::repeat_byte(0xa0 + idx)
}

fn to_logs(ops: &[Op]) -> Vec<RawLog> {
    ops.iter()
        .enumerate()
        .map(|(i, op)| {
            let mut hash = [0u8; 32];
            hash[24..].copy_from_slice(&(i as u64 + 1).to_be_bytes());
            let at = LogPosition {
                contract: CONTRACT,
                transaction_hash: B256::from(hash),
                block_number: i as u64 + 1,
                log_index: 0,
            };
            let amount = U256::from(op.amount);
            if op.mint {
                minted_log(at, ASSET, holder(op.holder), amount, "CORPORATE_BOND")
            } else {
                burned_log(at, ASSET, holder(op.holder), amount)
            }
        })
        .collect()
}

struct Fixture {
    reconciler: Reconciler,
    queries: LedgerQueries,
    _temp: TempDir,
}

fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.data_dir = temp.path().to_path_buf();
    let storage = Storage::open(&config).unwrap();
    storage.register_asset_id(ASSET).unwrap();
    Fixture {
        reconciler: Reconciler::new(
            EventDecoder::new(Arc::new(storage.clone())),
            Ledger::new(storage.clone()),
            CONTRACT,
            None,
        ),
        queries: LedgerQueries::new(storage),
        _temp: temp,
    }
}

/// Supply followed by the three holder balances
fn snapshot(f: &Fixture) -> Vec<U256> {
    let supply = f
        .queries
        .asset(ASSET)
        .unwrap()
        .map_or(U256::ZERO, |a| a.total_supply);
    let mut out = vec![supply];
    out.extend((0..3).map(|i| f.queries.holder_balance(ASSET, &holder(i)).unwrap()));
    out
}

fn assert_consistent(f: &Fixture) {
    if f.queries.asset(ASSET).unwrap().is_some() {
        assert!(f.queries.supply_check(ASSET).unwrap().is_consistent());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Redelivering every log after a settled pass changes nothing
    #[test]
    fn prop_reprocessing_is_idempotent(ops in prop::collection::vec(op_strategy(), 1..20)) {
        let f = fixture();
        let logs = to_logs(&ops);

        for log in &logs {
            f.reconciler.process_log(log).unwrap();
        }
        while f.reconciler.retry_unresolved().unwrap().resolved > 0 {}
        let once = snapshot(&f);

        for log in &logs {
            let outcome = f.reconciler.process_log(log).unwrap();
            prop_assert!(matches!(
                outcome,
                ApplyOutcome::Duplicate | ApplyOutcome::Unresolved
            ));
        }
        prop_assert_eq!(snapshot(&f), once);
    }

    /// Shuffled delivery reaches the in-order state on its own
    #[test]
    fn prop_delivery_order_does_not_matter(
        (ops, order) in balanced_strategy().prop_flat_map(|ops| {
            let n = ops.len();
            (Just(ops), Just((0..n).collect::<Vec<_>>()).prop_shuffle())
        })
    ) {
        let logs = to_logs(&ops);

        let ordered = fixture();
        for log in &logs {
            prop_assert_eq!(ordered.reconciler.process_log(log).unwrap(), ApplyOutcome::Applied);
        }

        let shuffled = fixture();
        for &i in &order {
            shuffled.reconciler.process_log(&logs[i]).unwrap();
        }

        prop_assert!(shuffled.queries.unresolved_events().unwrap().is_empty());
        prop_assert_eq!(snapshot(&shuffled), snapshot(&ordered));
        assert_consistent(&shuffled);
    }

    /// Over-burns are held back instead of driving anything below zero
    #[test]
    fn prop_supply_matches_balances(ops in prop::collection::vec(op_strategy(), 1..20)) {
        let f = fixture();
        let mut unresolved = 0usize;
        for log in &to_logs(&ops) {
            if f.reconciler.process_log(log).unwrap() == ApplyOutcome::Unresolved {
                unresolved += 1;
            }
            assert_consistent(&f);
        }
        // Held-back burns only settle, never appear out of nowhere
        prop_assert!(f.queries.unresolved_events().unwrap().len() <= unresolved);
        // Everything that could apply already did
        prop_assert_eq!(f.reconciler.retry_unresolved().unwrap().resolved, 0);
    }
}
