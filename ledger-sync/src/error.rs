//! Error types for the synchronization engine

use alloy_primitives::{B256, U256};
use thiserror::Error;

/// Result type for ledger-sync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed log payload; the log is skipped and the batch continues
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Would-be negative balance or supply
    #[error("Invariant violation: {0}")]
    InvariantViolation(#[from] InvariantViolation),

    /// RPC or subscription failure
    #[error("Chain unavailable: {0}")]
    ChainUnavailable(String),

    /// No receipt within the polling bound
    #[error("No receipt for transaction {tx_hash} after {attempts} attempts")]
    SubmissionTimeout {
        /// Submitted transaction
        tx_hash: B256,
        /// Polls performed
        attempts: u32,
    },

    /// Receipt arrived with a failure status
    #[error("Transaction {tx_hash} reverted")]
    TransactionReverted {
        /// Reverted transaction
        tx_hash: B256,
    },

    /// Burn pre-check failed
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        /// Requested burn amount
        required: U256,
        /// Balance the check was made against
        available: U256,
    },

    /// Malformed request
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation abandoned because the engine is shutting down
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A log that could not be turned into a typed event
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Log carries no topics at all
    #[error("log has no topics")]
    MissingTopics,

    /// Topic count does not match the event signature
    #[error("{event}: expected {expected} topics, got {actual}")]
    TopicCount {
        /// Event name
        event: &'static str,
        /// Topics required by the signature
        expected: usize,
        /// Topics present
        actual: usize,
    },

    /// ABI decoding of topics or data failed
    #[error("{event}: {reason}")]
    Abi {
        /// Event name
        event: &'static str,
        /// Decoder message
        reason: String,
    },
}

/// A state transition that would drive a supply or balance below zero
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// Burn larger than the asset's tracked supply
    #[error("supply of {asset_id} is {supply}, cannot remove {amount}")]
    NegativeSupply {
        /// Asset
        asset_id: String,
        /// Current supply
        supply: U256,
        /// Amount removed
        amount: U256,
    },

    /// Debit larger than the holder's tracked balance
    #[error("balance of {holder} in {asset_id} is {balance}, cannot debit {amount}")]
    NegativeBalance {
        /// Asset
        asset_id: String,
        /// Holder address
        holder: String,
        /// Current balance
        balance: U256,
        /// Amount debited
        amount: U256,
    },

    /// Supply or balance exceeds 256 bits
    #[error("{0} overflows uint256")]
    Overflow(String),
}

impl Error {
    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Decode(_) => "decode",
            Error::InvariantViolation(_) => "invariant_violation",
            Error::ChainUnavailable(_) => "chain_unavailable",
            Error::SubmissionTimeout { .. } => "submission_timeout",
            Error::TransactionReverted { .. } => "reverted",
            Error::InsufficientBalance { .. } => "insufficient_balance",
            Error::Validation(_) => "validation",
            Error::Cancelled(_) => "cancelled",
            Error::NotFound(_) => "not_found",
            Error::Storage(_) => "storage",
            Error::Serialization(_) => "serialization",
            Error::Concurrency(_) => "concurrency",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Error::Validation(err.to_string())
    }
}
