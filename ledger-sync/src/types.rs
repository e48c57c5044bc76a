//! Core types for the ledger
//!
//! Row types mirror the persisted tables: [`Asset`], [`AssetHolder`],
//! [`Transaction`] and the dedup/audit record [`BlockchainEvent`].
//! Amounts are `uint256` values exactly as emitted on chain.

use alloy_primitives::{Address, Bytes, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Address used as the counterparty of mints and burns
pub const ZERO_ADDRESS: Address = Address::ZERO;

/// A log exactly as delivered by the chain client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    /// Emitting contract
    pub address: Address,
    /// Topics; `topics[0]` is the event signature hash
    pub topics: Vec<B256>,
    /// ABI-encoded non-indexed fields
    pub data: Bytes,
    /// Block containing the log
    pub block_number: u64,
    /// Transaction that emitted the log
    pub transaction_hash: B256,
    /// Position of the log within its block
    pub log_index: u64,
}

impl RawLog {
    /// Dedup key of this log
    pub fn key(&self) -> EventKey {
        EventKey::new(self.transaction_hash, self.log_index)
    }

    /// Event signature hash, if any
    pub fn topic0(&self) -> Option<&B256> {
        self.topics.first()
    }
}

/// Dedup key: one emitted log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    /// Transaction hash
    pub transaction_hash: B256,
    /// Log index
    pub log_index: u64,
}

impl EventKey {
    /// Create new key
    pub fn new(transaction_hash: B256, log_index: u64) -> Self {
        Self {
            transaction_hash,
            log_index,
        }
    }

    /// Storage key: hash bytes followed by big-endian log index
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(40);
        key.extend_from_slice(self.transaction_hash.as_slice());
        key.extend_from_slice(&self.log_index.to_be_bytes());
        key
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transaction_hash, self.log_index)
    }
}

/// Kind of supply-affecting movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    /// Tokens created
    Mint,
    /// Tokens destroyed
    Burn,
    /// Tokens moved between holders
    Transfer,
}

impl TransactionType {
    /// Upper-case name as stored
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Mint => "MINT",
            TransactionType::Burn => "BURN",
            TransactionType::Transfer => "TRANSFER",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Submitted, receipt not yet seen
    Pending,
    /// Receipt succeeded; on-chain event not yet reconciled
    Success,
    /// Reverted or timed out
    Failed,
    /// Reconciled from the on-chain event
    Confirmed,
}

impl TransactionStatus {
    /// Upper-case name as stored
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Success => "SUCCESS",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::Confirmed => "CONFIRMED",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tokenized asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Unique asset identifier (e.g. "BOND-1")
    pub asset_id: String,
    /// Asset class (e.g. "CORPORATE_BOND")
    pub asset_type: String,
    /// Outstanding supply
    pub total_supply: U256,
    /// Issuer identifier
    pub issuer: String,
    /// Token contract
    pub contract_address: Address,
    /// First mint
    pub issuance_date: DateTime<Utc>,
    /// Last supply change
    pub updated_at: DateTime<Utc>,
}

/// Balance of one holder in one asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetHolder {
    /// Asset
    pub asset_id: String,
    /// Holder
    pub holder_address: Address,
    /// Current balance
    pub balance: U256,
    /// First credit
    pub first_acquired: DateTime<Utc>,
    /// Last balance change
    pub last_updated: DateTime<Utc>,
}

/// One logical transaction, shared by the submission and reconciliation paths
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique key
    pub transaction_hash: B256,
    /// Asset moved
    pub asset_id: String,
    /// Debited side (zero address for mints)
    pub from_address: Address,
    /// Credited side (zero address for burns)
    pub to_address: Address,
    /// Amount moved
    pub amount: U256,
    /// Movement kind
    pub transaction_type: TransactionType,
    /// Lifecycle status
    pub status: TransactionStatus,
    /// Block, once known
    pub block_number: Option<u64>,
    /// Log that confirmed this transaction
    pub log_index: Option<u64>,
    /// Gas used, from the receipt
    pub gas_used: Option<u64>,
    /// Failure description
    pub error_message: Option<String>,
    /// Whether the balance/supply effect has been written
    pub ledger_applied: bool,
    /// Row creation
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

/// Dedup and audit record of one observed log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockchainEvent {
    /// Emitting transaction
    pub transaction_hash: B256,
    /// Log index
    pub log_index: u64,
    /// Decoded event name
    pub event_name: String,
    /// Asset whose ledger rows the event moves
    #[serde(default)]
    pub asset_id: Option<String>,
    /// Emitting contract
    pub contract_address: Address,
    /// Block
    pub block_number: u64,
    /// Decoded event as JSON
    pub payload: serde_json::Value,
    /// Original log, kept so unresolved events can be retried
    pub raw: RawLog,
    /// Ledger effect committed
    pub processed: bool,
    /// When the effect was committed
    pub processed_at: Option<DateTime<Utc>>,
    /// First time the log was seen
    pub observed_at: DateTime<Utc>,
    /// Why the effect could not be applied yet
    pub unresolved_reason: Option<String>,
}

impl BlockchainEvent {
    /// Dedup key
    pub fn key(&self) -> EventKey {
        EventKey::new(self.transaction_hash, self.log_index)
    }
}

/// Receipt returned by the chain client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Transaction
    pub transaction_hash: B256,
    /// Execution status
    pub success: bool,
    /// Including block
    pub block_number: Option<u64>,
    /// Gas consumed
    pub gas_used: u64,
}

/// Supply vs. holder balances for one asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplyCheck {
    /// Asset
    pub asset_id: String,
    /// Tracked supply
    pub total_supply: U256,
    /// Σ holder balances
    pub holder_sum: U256,
}

impl SupplyCheck {
    /// Supply equals the sum of balances
    pub fn is_consistent(&self) -> bool {
        self.total_supply == self.holder_sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_key_bytes_order_by_log_index() {
        let hash = B256::repeat_byte(0xab);
        let a = EventKey::new(hash, 2).to_bytes();
        let b = EventKey::new(hash, 10).to_bytes();
        assert_eq!(a.len(), 40);
        assert!(a < b);
    }

    #[test]
    fn test_status_serializes_upper_case() {
        let json = serde_json::to_string(&TransactionStatus::Confirmed).unwrap();
        assert_eq!(json, "\"CONFIRMED\"");
        let ty: TransactionType = serde_json::from_str("\"BURN\"").unwrap();
        assert_eq!(ty, TransactionType::Burn);
    }

    #[test]
    fn test_supply_check() {
        let check = SupplyCheck {
            asset_id: "BOND-1".to_string(),
            total_supply: U256::from(700u64),
            holder_sum: U256::from(700u64),
        };
        assert!(check.is_consistent());
    }
}
