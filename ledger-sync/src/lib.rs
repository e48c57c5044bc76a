//! Ledger Sync
//!
//! Keeps an off-chain asset ledger consistent with the events of an ERC-20
//! style token contract.
//!
//! # Architecture
//!
//! - **Event Decoder**: raw logs to typed mint/burn/transfer events
//! - **Dedup Ledger**: at-most-once application per `(tx hash, log index)`
//! - **Reconciler**: applies events to assets, holders and transactions
//! - **Replay**: chunked historical catch-up on every (re)start
//! - **Subscription Manager**: live filters with a single reconnect timer
//! - **Submission**: mint/burn calls with receipt polling
//!
//! # Invariants
//!
//! - Non-negativity: supply and balances never go below zero
//! - Idempotence: applying a log twice equals applying it once
//! - Atomicity: rows and the dedup record commit in one batch
//! - Convergence: submission and reconciliation of the same tx apply once

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod chain;
pub mod config;
pub mod decoder;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod locks;
pub mod metrics;
pub mod query;
pub mod reconciler;
pub mod replay;
pub mod state;
pub mod storage;
pub mod submission;
pub mod subscription;
pub mod types;

// Re-exports
pub use chain::{ChainClient, MockChain, ReceiptMode};
pub use config::Config;
pub use engine::{SyncEngine, SyncStatus};
pub use error::{Error, Result};
pub use query::LedgerQueries;
pub use replay::{ReplayMode, ReplayReport};
pub use submission::{BurnRequest, MintRequest, SubmissionResult};
pub use subscription::ListenerState;
pub use types::{
    Asset, AssetHolder, BlockchainEvent, EventKey, RawLog, Receipt, SupplyCheck, Transaction,
    TransactionStatus, TransactionType,
};

#[cfg(feature = "rpc")]
pub use chain::RpcChainClient;
