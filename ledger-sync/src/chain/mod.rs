//! Chain client interface
//!
//! Everything the engine needs from a node: historical logs, live log
//! subscriptions, transaction submission, receipts and token balances.

pub mod mock;
#[cfg(feature = "rpc")]
pub mod rpc;

use crate::types::{RawLog, Receipt};
use crate::Result;
use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use futures::stream::BoxStream;

pub use mock::{MockChain, ReceiptMode};
#[cfg(feature = "rpc")]
pub use rpc::RpcChainClient;

/// Live log stream; an `Err` item means the subscription is broken
pub type LogStream = BoxStream<'static, Result<RawLog>>;

/// Chain client trait
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current head block
    async fn block_number(&self) -> Result<u64>;

    /// Logs emitted by `contract` in `[from_block, to_block]`
    async fn get_logs(&self, contract: Address, from_block: u64, to_block: u64)
        -> Result<Vec<RawLog>>;

    /// Subscribe to logs of `contract` whose `topics[0]` is `topic0`
    async fn subscribe_logs(&self, contract: Address, topic0: B256) -> Result<LogStream>;

    /// Sign and send a call to `contract`; returns the transaction hash
    async fn submit_transaction(&self, contract: Address, call_data: Bytes) -> Result<B256>;

    /// Receipt of `tx_hash`, `None` while pending
    async fn get_receipt(&self, tx_hash: B256) -> Result<Option<Receipt>>;

    /// Token balance of `holder`
    async fn get_balance(&self, contract: Address, holder: Address) -> Result<U256>;
}
