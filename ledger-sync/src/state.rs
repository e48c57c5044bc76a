//! Ledger state transitions
//!
//! [`transition`] is a pure function from the rows a movement touches to the
//! rows it writes. Both the reconciler (on-chain events) and the submission
//! workflow (receipts) go through it, so whichever arrives second for the
//! same transaction hash sees `ledger_applied` and only merges status.

use crate::error::InvariantViolation;
use crate::locks::LockKey;
use crate::types::{
    Asset, AssetHolder, Transaction, TransactionStatus, TransactionType, ZERO_ADDRESS,
};
use alloy_primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Asset type recorded when a mint carries none
pub const UNKNOWN_ASSET_TYPE: &str = "UNKNOWN";

/// Balance effect of a movement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementKind {
    /// Credit `to`, grow supply
    Mint {
        /// Credited holder
        to: Address,
    },
    /// Debit `from`, shrink supply
    Burn {
        /// Debited holder
        from: Address,
    },
    /// Debit `from`, credit `to`
    Transfer {
        /// Debited holder
        from: Address,
        /// Credited holder
        to: Address,
    },
}

impl MovementKind {
    /// Stored transaction type
    pub fn transaction_type(&self) -> TransactionType {
        match self {
            MovementKind::Mint { .. } => TransactionType::Mint,
            MovementKind::Burn { .. } => TransactionType::Burn,
            MovementKind::Transfer { .. } => TransactionType::Transfer,
        }
    }

    /// `(from, to)` as stored on the transaction row
    pub fn endpoints(&self) -> (Address, Address) {
        match *self {
            MovementKind::Mint { to } => (ZERO_ADDRESS, to),
            MovementKind::Burn { from } => (from, ZERO_ADDRESS),
            MovementKind::Transfer { from, to } => (from, to),
        }
    }

    /// Holders whose balance changes
    pub fn holders(&self) -> Vec<Address> {
        match *self {
            MovementKind::Mint { to } => vec![to],
            MovementKind::Burn { from } => vec![from],
            MovementKind::Transfer { from, to } if from == to => vec![from],
            MovementKind::Transfer { from, to } => vec![from, to],
        }
    }
}

/// Where a movement was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Decoded on-chain log
    Chain {
        /// Block of the log
        block_number: u64,
        /// Index of the log
        log_index: u64,
    },
    /// Successful receipt of our own submission
    Submission {
        /// Gas used by the transaction
        gas_used: u64,
    },
}

/// One supply/balance movement keyed by transaction hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Movement {
    /// Transaction that caused the movement
    pub transaction_hash: B256,
    /// Asset moved
    pub asset_id: String,
    /// Balance effect
    pub kind: MovementKind,
    /// Amount moved
    pub amount: U256,
    /// Asset type, used when a mint creates the asset
    pub asset_type: Option<String>,
    /// Issuer, used when a mint creates the asset
    pub issuer: Option<String>,
    /// Token contract
    pub contract: Address,
    /// Observation source
    pub origin: Origin,
}

impl Movement {
    /// Row locks covering every row this movement may write
    ///
    /// Transfers leave supply alone, so only mints and burns take the asset lock.
    pub fn lock_keys(&self) -> Vec<LockKey> {
        let mut keys = vec![LockKey::Transaction(self.transaction_hash.to_string())];
        if !matches!(self.kind, MovementKind::Transfer { .. }) {
            keys.push(LockKey::Asset(self.asset_id.clone()));
        }
        keys.extend(
            self.kind
                .holders()
                .into_iter()
                .map(|h| LockKey::Holder(self.asset_id.clone(), h.to_string())),
        );
        keys
    }

    /// Whether `tx` records this same movement
    fn matches(&self, tx: &Transaction) -> bool {
        tx.transaction_type == self.kind.transaction_type()
            && tx.asset_id == self.asset_id
            && tx.amount == self.amount
    }
}

/// Current rows touched by a movement
#[derive(Debug, Clone, Default)]
pub struct LedgerView {
    /// Asset row
    pub asset: Option<Asset>,
    /// Holder rows by address
    pub holders: HashMap<Address, AssetHolder>,
    /// Transaction row
    pub transaction: Option<Transaction>,
}

/// How the movement affected balances
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Supply and balances changed
    Applied,
    /// Already applied by the other path; only the transaction row changed
    Merged,
}

/// Rows to write
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    /// Balance effect
    pub effect: Effect,
    /// Updated asset row
    pub asset: Option<Asset>,
    /// Updated holder rows
    pub holders: Vec<AssetHolder>,
    /// Updated transaction row
    pub transaction: Option<Transaction>,
}

/// Compute the rows `movement` writes on top of `view`
pub fn transition(
    view: &LedgerView,
    movement: &Movement,
    now: DateTime<Utc>,
) -> Result<StateChange, InvariantViolation> {
    let existing = view.transaction.as_ref();

    // The other path already wrote this movement: merge status only
    if let Some(tx) = existing.filter(|tx| tx.ledger_applied && movement.matches(tx)) {
        let confirmed_by_other_log = matches!(
            movement.origin,
            Origin::Chain { log_index, .. }
                if tx.status == TransactionStatus::Confirmed && tx.log_index != Some(log_index)
        );
        if !confirmed_by_other_log {
            return Ok(StateChange {
                effect: Effect::Merged,
                asset: None,
                holders: Vec::new(),
                transaction: Some(merge_status(tx, movement.origin, now)),
            });
        }
    }

    let (asset, holders) = apply_balances(view, movement, now)?;

    // A distinct movement sharing the hash keeps the row it found
    let owns_row = existing.map_or(true, |tx| !tx.ledger_applied);
    let transaction = owns_row.then(|| applied_record(existing, movement, now));

    Ok(StateChange {
        effect: Effect::Applied,
        asset,
        holders,
        transaction,
    })
}

/// Transaction row written when the effect could not be applied
pub fn unapplied_record(
    existing: Option<&Transaction>,
    movement: &Movement,
    now: DateTime<Utc>,
) -> Transaction {
    let mut tx = applied_record(existing, movement, now);
    tx.ledger_applied = false;
    tx
}

fn merge_status(tx: &Transaction, origin: Origin, now: DateTime<Utc>) -> Transaction {
    let mut merged = tx.clone();
    match origin {
        Origin::Chain {
            block_number,
            log_index,
        } => {
            merged.status = TransactionStatus::Confirmed;
            merged.block_number = Some(block_number);
            merged.log_index = Some(log_index);
            merged.error_message = None;
        }
        Origin::Submission { gas_used } => {
            if merged.status != TransactionStatus::Confirmed {
                merged.status = TransactionStatus::Success;
            }
            merged.gas_used = Some(gas_used);
        }
    }
    merged.updated_at = now;
    merged
}

fn applied_record(
    existing: Option<&Transaction>,
    movement: &Movement,
    now: DateTime<Utc>,
) -> Transaction {
    let (from_address, to_address) = movement.kind.endpoints();
    let (status, block_number, log_index, gas_used) = match movement.origin {
        Origin::Chain {
            block_number,
            log_index,
        } => (
            TransactionStatus::Confirmed,
            Some(block_number),
            Some(log_index),
            existing.and_then(|tx| tx.gas_used),
        ),
        Origin::Submission { gas_used } => (TransactionStatus::Success, None, None, Some(gas_used)),
    };

    Transaction {
        transaction_hash: movement.transaction_hash,
        asset_id: movement.asset_id.clone(),
        from_address,
        to_address,
        amount: movement.amount,
        transaction_type: movement.kind.transaction_type(),
        status,
        block_number,
        log_index,
        gas_used,
        error_message: None,
        ledger_applied: true,
        created_at: existing.map_or(now, |tx| tx.created_at),
        updated_at: now,
    }
}

fn apply_balances(
    view: &LedgerView,
    movement: &Movement,
    now: DateTime<Utc>,
) -> Result<(Option<Asset>, Vec<AssetHolder>), InvariantViolation> {
    let asset_id = &movement.asset_id;
    let amount = movement.amount;
    let mut holders = view.holders.clone();

    let asset = match movement.kind {
        MovementKind::Mint { to } => {
            let asset = match &view.asset {
                Some(existing) => {
                    let mut asset = existing.clone();
                    asset.total_supply = asset
                        .total_supply
                        .checked_add(amount)
                        .ok_or_else(|| InvariantViolation::Overflow(format!("supply of {}", asset_id)))?;
                    asset.updated_at = now;
                    asset
                }
                None => Asset {
                    asset_id: asset_id.clone(),
                    asset_type: movement
                        .asset_type
                        .clone()
                        .unwrap_or_else(|| UNKNOWN_ASSET_TYPE.to_string()),
                    total_supply: amount,
                    issuer: movement.issuer.clone().unwrap_or_else(|| to.to_string()),
                    contract_address: movement.contract,
                    issuance_date: now,
                    updated_at: now,
                },
            };
            credit(&mut holders, asset_id, to, amount, now)?;
            Some(asset)
        }
        MovementKind::Burn { from } => {
            let supply = view.asset.as_ref().map_or(U256::ZERO, |a| a.total_supply);
            let remaining = supply
                .checked_sub(amount)
                .ok_or_else(|| InvariantViolation::NegativeSupply {
                    asset_id: asset_id.clone(),
                    supply,
                    amount,
                })?;
            debit(&mut holders, asset_id, from, amount, now)?;
            view.asset.as_ref().map(|existing| {
                let mut asset = existing.clone();
                asset.total_supply = remaining;
                asset.updated_at = now;
                asset
            })
        }
        MovementKind::Transfer { from, to } => {
            debit(&mut holders, asset_id, from, amount, now)?;
            credit(&mut holders, asset_id, to, amount, now)?;
            None
        }
    };

    let touched = movement
        .kind
        .holders()
        .into_iter()
        .filter_map(|addr| holders.remove(&addr))
        .collect();

    Ok((asset, touched))
}

fn credit(
    holders: &mut HashMap<Address, AssetHolder>,
    asset_id: &str,
    holder: Address,
    amount: U256,
    now: DateTime<Utc>,
) -> Result<(), InvariantViolation> {
    let row = holders.entry(holder).or_insert_with(|| AssetHolder {
        asset_id: asset_id.to_string(),
        holder_address: holder,
        balance: U256::ZERO,
        first_acquired: now,
        last_updated: now,
    });
    row.balance = row
        .balance
        .checked_add(amount)
        .ok_or_else(|| InvariantViolation::Overflow(format!("balance of {} in {}", holder, asset_id)))?;
    row.last_updated = now;
    Ok(())
}

fn debit(
    holders: &mut HashMap<Address, AssetHolder>,
    asset_id: &str,
    holder: Address,
    amount: U256,
    now: DateTime<Utc>,
) -> Result<(), InvariantViolation> {
    let balance = holders.get(&holder).map_or(U256::ZERO, |h| h.balance);
    let remaining = balance
        .checked_sub(amount)
        .ok_or_else(|| InvariantViolation::NegativeBalance {
            asset_id: asset_id.to_string(),
            holder: holder.to_string(),
            balance,
            amount,
        })?;
    if let Some(row) = holders.get_mut(&holder) {
        row.balance = remaining;
        row.last_updated = now;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: Address = Address::repeat_byte(0xaa);
    const BOB: Address = Address::repeat_byte(0xbb);

    fn movement(kind: MovementKind, amount: u64, origin: Origin) -> Movement {
        Movement {
            transaction_hash: B256::repeat_byte(1),
            asset_id: "BOND-1".to_string(),
            kind,
            amount: U256::from(amount),
            asset_type: Some("CORPORATE_BOND".to_string()),
            issuer: Some("Acme".to_string()),
            contract: Address::repeat_byte(0xcc),
            origin,
        }
    }

    fn chain(log_index: u64) -> Origin {
        Origin::Chain {
            block_number: 5,
            log_index,
        }
    }

    fn apply(view: &mut LedgerView, change: StateChange) {
        if let Some(asset) = change.asset {
            view.asset = Some(asset);
        }
        for h in change.holders {
            view.holders.insert(h.holder_address, h);
        }
        if let Some(tx) = change.transaction {
            view.transaction = Some(tx);
        }
    }

    #[test]
    fn test_mint_creates_asset_and_holder() {
        let view = LedgerView::default();
        let change = transition(&view, &movement(MovementKind::Mint { to: ALICE }, 1000, chain(0)), Utc::now())
            .unwrap();

        assert_eq!(change.effect, Effect::Applied);
        let asset = change.asset.unwrap();
        assert_eq!(asset.total_supply, U256::from(1000u64));
        assert_eq!(asset.asset_type, "CORPORATE_BOND");
        assert_eq!(change.holders[0].balance, U256::from(1000u64));
        let tx = change.transaction.unwrap();
        assert_eq!(tx.status, TransactionStatus::Confirmed);
        assert_eq!(tx.block_number, Some(5));
        assert!(tx.ledger_applied);
    }

    #[test]
    fn test_burn_below_zero_is_violation() {
        let mut view = LedgerView::default();
        let mint = transition(&view, &movement(MovementKind::Mint { to: ALICE }, 100, chain(0)), Utc::now())
            .unwrap();
        apply(&mut view, mint);
        view.transaction = None;

        let err = transition(&view, &movement(MovementKind::Burn { from: BOB }, 50, chain(1)), Utc::now())
            .unwrap_err();
        assert!(matches!(err, InvariantViolation::NegativeBalance { .. }));

        let err = transition(&view, &movement(MovementKind::Burn { from: ALICE }, 150, chain(1)), Utc::now())
            .unwrap_err();
        assert!(matches!(err, InvariantViolation::NegativeSupply { .. }));
    }

    #[test]
    fn test_submission_then_chain_merges_without_double_count() {
        let mut view = LedgerView::default();
        let submitted = transition(
            &view,
            &movement(MovementKind::Mint { to: ALICE }, 1000, Origin::Submission { gas_used: 21_000 }),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(submitted.transaction.as_ref().unwrap().status, TransactionStatus::Success);
        apply(&mut view, submitted);

        let confirmed = transition(&view, &movement(MovementKind::Mint { to: ALICE }, 1000, chain(3)), Utc::now())
            .unwrap();
        assert_eq!(confirmed.effect, Effect::Merged);
        assert!(confirmed.asset.is_none());
        assert!(confirmed.holders.is_empty());
        let tx = confirmed.transaction.unwrap();
        assert_eq!(tx.status, TransactionStatus::Confirmed);
        assert_eq!(tx.log_index, Some(3));
        assert_eq!(tx.gas_used, Some(21_000));
    }

    #[test]
    fn test_chain_then_submission_keeps_confirmed() {
        let mut view = LedgerView::default();
        let confirmed = transition(&view, &movement(MovementKind::Mint { to: ALICE }, 10, chain(0)), Utc::now())
            .unwrap();
        apply(&mut view, confirmed);

        let late = transition(
            &view,
            &movement(MovementKind::Mint { to: ALICE }, 10, Origin::Submission { gas_used: 7 }),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(late.effect, Effect::Merged);
        let tx = late.transaction.unwrap();
        assert_eq!(tx.status, TransactionStatus::Confirmed);
        assert_eq!(tx.gas_used, Some(7));
    }

    #[test]
    fn test_second_log_in_same_transaction_applies() {
        let mut view = LedgerView::default();
        let first = transition(&view, &movement(MovementKind::Mint { to: ALICE }, 10, chain(0)), Utc::now())
            .unwrap();
        apply(&mut view, first);

        let second = transition(&view, &movement(MovementKind::Mint { to: ALICE }, 10, chain(1)), Utc::now())
            .unwrap();
        assert_eq!(second.effect, Effect::Applied);
        assert_eq!(second.asset.unwrap().total_supply, U256::from(20u64));
        assert!(second.transaction.is_none());
    }

    #[test]
    fn test_transfer_to_self_is_neutral() {
        let mut view = LedgerView::default();
        let mint = transition(&view, &movement(MovementKind::Mint { to: ALICE }, 10, chain(0)), Utc::now())
            .unwrap();
        apply(&mut view, mint);

        let mut self_transfer = movement(MovementKind::Transfer { from: ALICE, to: ALICE }, 4, chain(1));
        self_transfer.transaction_hash = B256::repeat_byte(2);
        let change = transition(&view, &self_transfer, Utc::now()).unwrap();
        assert!(change.asset.is_none());
        assert_eq!(change.holders.len(), 1);
        assert_eq!(change.holders[0].balance, U256::from(10u64));
    }

    #[test]
    fn test_only_supply_changes_take_asset_lock() {
        let asset_lock = LockKey::Asset("BOND-1".to_string());

        let mint = movement(MovementKind::Mint { to: ALICE }, 1, chain(0));
        assert!(mint.lock_keys().contains(&asset_lock));
        let burn = movement(MovementKind::Burn { from: ALICE }, 1, chain(0));
        assert!(burn.lock_keys().contains(&asset_lock));

        let transfer = movement(MovementKind::Transfer { from: ALICE, to: BOB }, 1, chain(0));
        let keys = transfer.lock_keys();
        assert!(!keys.contains(&asset_lock));
        assert_eq!(keys.len(), 3);
        assert!(keys.contains(&LockKey::Holder("BOND-1".to_string(), BOB.to_string())));
    }

    #[test]
    fn test_pending_record_is_applied_not_merged() {
        let mut view = LedgerView::default();
        let mut pending = unapplied_record(
            None,
            &movement(MovementKind::Burn { from: ALICE }, 5, Origin::Submission { gas_used: 0 }),
            Utc::now(),
        );
        pending.status = TransactionStatus::Pending;
        let created = pending.created_at;
        view.transaction = Some(pending);
        view.asset = transition(&LedgerView::default(), &movement(MovementKind::Mint { to: ALICE }, 10, chain(0)), Utc::now())
            .unwrap()
            .asset;
        view.holders.insert(
            ALICE,
            AssetHolder {
                asset_id: "BOND-1".into(),
                holder_address: ALICE,
                balance: U256::from(10u64),
                first_acquired: Utc::now(),
                last_updated: Utc::now(),
            },
        );

        let change = transition(&view, &movement(MovementKind::Burn { from: ALICE }, 5, chain(2)), Utc::now())
            .unwrap();
        assert_eq!(change.effect, Effect::Applied);
        assert_eq!(change.holders[0].balance, U256::from(5u64));
        let tx = change.transaction.unwrap();
        assert_eq!(tx.status, TransactionStatus::Confirmed);
        assert_eq!(tx.created_at, created);
    }
}
