//! In-memory chain for tests and local runs
//!
//! Logs pushed with [`MockChain::push_log`] are kept as history for
//! `get_logs` and delivered to every matching live subscription. Failures,
//! balances and receipts are scriptable.

use super::{ChainClient, LogStream};
use crate::types::{RawLog, Receipt};
use crate::{Error, Result};
use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

/// How `get_receipt` answers for submitted transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptMode {
    /// Successful receipt on the first poll
    Success {
        /// Reported gas
        gas_used: u64,
    },
    /// Successful receipt once `polls` polls have been made
    SuccessAfter {
        /// Polls answered with `None` first
        polls: u32,
        /// Reported gas
        gas_used: u64,
    },
    /// Failed receipt
    Reverted,
    /// Never mined
    Never,
}

/// Call recorded by [`MockChain::submit_transaction`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedCall {
    /// Target contract
    pub contract: Address,
    /// ABI-encoded call
    pub call_data: Bytes,
    /// Hash handed back to the caller
    pub tx_hash: B256,
}

struct Subscriber {
    contract: Address,
    topic0: B256,
    tx: mpsc::UnboundedSender<Result<RawLog>>,
}

struct MockState {
    head: u64,
    logs: Vec<RawLog>,
    subscribers: Vec<Subscriber>,
    subscribe_calls: u32,
    failing_subscriptions: u32,
    failing_get_logs: u32,
    mined_on_subscribe: Vec<RawLog>,
    head_unavailable: bool,
    balances: HashMap<Address, U256>,
    balance_unavailable: bool,
    receipt_mode: ReceiptMode,
    receipt_polls: HashMap<B256, u32>,
    submitted: Vec<SubmittedCall>,
    nonce: u64,
}

/// Scriptable in-memory [`ChainClient`]
pub struct MockChain {
    state: Mutex<MockState>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChain {
    /// Empty chain at block 0 whose receipts succeed immediately
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                head: 0,
                logs: Vec::new(),
                subscribers: Vec::new(),
                subscribe_calls: 0,
                failing_subscriptions: 0,
                failing_get_logs: 0,
                mined_on_subscribe: Vec::new(),
                head_unavailable: false,
                balances: HashMap::new(),
                balance_unavailable: false,
                receipt_mode: ReceiptMode::Success { gas_used: 21_000 },
                receipt_polls: HashMap::new(),
                submitted: Vec::new(),
                nonce: 0,
            }),
        }
    }

    /// Record `log` and deliver it to live subscribers
    pub fn push_log(&self, log: RawLog) {
        let mut state = self.state.lock();
        state.head = state.head.max(log.block_number);
        state.subscribers.retain(|sub| {
            if sub.contract != log.address || log.topic0() != Some(&sub.topic0) {
                return !sub.tx.is_closed();
            }
            sub.tx.send(Ok(log.clone())).is_ok()
        });
        state.logs.push(log);
    }

    /// Record `log` as history only, as if emitted while nobody listened
    pub fn push_historical_log(&self, log: RawLog) {
        let mut state = self.state.lock();
        state.head = state.head.max(log.block_number);
        state.logs.push(log);
    }

    /// Record `log` as history when the next `subscribe_logs` call arrives
    ///
    /// Models a log mined after a replay read the head but before the
    /// filter was in place.
    pub fn mine_on_next_subscribe(&self, log: RawLog) {
        self.state.lock().mined_on_subscribe.push(log);
    }

    /// Make head queries fail
    pub fn set_head_unavailable(&self, unavailable: bool) {
        self.state.lock().head_unavailable = unavailable;
    }

    /// Move the head forward without logs
    pub fn set_head(&self, block: u64) {
        self.state.lock().head = block;
    }

    /// Make the next `n` `subscribe_logs` calls fail
    pub fn fail_next_subscriptions(&self, n: u32) {
        self.state.lock().failing_subscriptions = n;
    }

    /// Make the next `n` `get_logs` calls fail
    pub fn fail_next_get_logs(&self, n: u32) {
        self.state.lock().failing_get_logs = n;
    }

    /// Fail every live subscription with a delivery error
    pub fn break_subscriptions(&self) {
        let subscribers = std::mem::take(&mut self.state.lock().subscribers);
        info!(count = subscribers.len(), "Mock chain breaking subscriptions");
        for sub in subscribers {
            let _ = sub
                .tx
                .send(Err(Error::ChainUnavailable("subscription dropped".to_string())));
        }
    }

    /// Live subscriptions still open
    pub fn active_subscriptions(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|sub| !sub.tx.is_closed());
        state.subscribers.len()
    }

    /// Total `subscribe_logs` calls, failed ones included
    pub fn subscribe_calls(&self) -> u32 {
        self.state.lock().subscribe_calls
    }

    /// Set on-chain token balance of `holder`
    pub fn set_balance(&self, holder: Address, amount: U256) {
        self.state.lock().balances.insert(holder, amount);
    }

    /// Make balance queries fail
    pub fn set_balance_unavailable(&self, unavailable: bool) {
        self.state.lock().balance_unavailable = unavailable;
    }

    /// Script receipts of submitted transactions
    pub fn set_receipt_mode(&self, mode: ReceiptMode) {
        self.state.lock().receipt_mode = mode;
    }

    /// Calls submitted so far
    pub fn submitted(&self) -> Vec<SubmittedCall> {
        self.state.lock().submitted.clone()
    }

    /// Receipt polls made for `tx_hash`
    pub fn receipt_polls(&self, tx_hash: &B256) -> u32 {
        self.state
            .lock()
            .receipt_polls
            .get(tx_hash)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn block_number(&self) -> Result<u64> {
        let state = self.state.lock();
        if state.head_unavailable {
            return Err(Error::ChainUnavailable("eth_blockNumber failed".to_string()));
        }
        Ok(state.head)
    }

    async fn get_logs(
        &self,
        contract: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>> {
        let mut state = self.state.lock();
        if state.failing_get_logs > 0 {
            state.failing_get_logs -= 1;
            return Err(Error::ChainUnavailable("getLogs failed".to_string()));
        }
        Ok(state
            .logs
            .iter()
            .filter(|log| {
                log.address == contract
                    && log.block_number >= from_block
                    && log.block_number <= to_block
            })
            .cloned()
            .collect())
    }

    async fn subscribe_logs(&self, contract: Address, topic0: B256) -> Result<LogStream> {
        let mut state = self.state.lock();
        state.subscribe_calls += 1;
        for log in std::mem::take(&mut state.mined_on_subscribe) {
            state.head = state.head.max(log.block_number);
            state.logs.push(log);
        }
        if state.failing_subscriptions > 0 {
            state.failing_subscriptions -= 1;
            return Err(Error::ChainUnavailable("subscribe failed".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push(Subscriber {
            contract,
            topic0,
            tx,
        });
        debug!(topic0 = %topic0, "Mock subscription registered");
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn submit_transaction(&self, contract: Address, call_data: Bytes) -> Result<B256> {
        let mut state = self.state.lock();
        state.nonce += 1;
        let mut preimage = call_data.to_vec();
        preimage.extend_from_slice(&state.nonce.to_be_bytes());
        let tx_hash = keccak256(&preimage);

        state.submitted.push(SubmittedCall {
            contract,
            call_data,
            tx_hash,
        });
        Ok(tx_hash)
    }

    async fn get_receipt(&self, tx_hash: B256) -> Result<Option<Receipt>> {
        let mut state = self.state.lock();
        if !state.submitted.iter().any(|c| c.tx_hash == tx_hash) {
            return Ok(None);
        }
        let polls = {
            let count = state.receipt_polls.entry(tx_hash).or_insert(0);
            *count += 1;
            *count
        };
        let block_number = Some(state.head + 1);

        Ok(match state.receipt_mode {
            ReceiptMode::Success { gas_used } => Some(Receipt {
                transaction_hash: tx_hash,
                success: true,
                block_number,
                gas_used,
            }),
            ReceiptMode::SuccessAfter {
                polls: needed,
                gas_used,
            } if polls > needed => Some(Receipt {
                transaction_hash: tx_hash,
                success: true,
                block_number,
                gas_used,
            }),
            ReceiptMode::SuccessAfter { .. } | ReceiptMode::Never => None,
            ReceiptMode::Reverted => Some(Receipt {
                transaction_hash: tx_hash,
                success: false,
                block_number,
                gas_used: 30_000,
            }),
        })
    }

    async fn get_balance(&self, _contract: Address, holder: Address) -> Result<U256> {
        let state = self.state.lock();
        if state.balance_unavailable {
            return Err(Error::ChainUnavailable("balanceOf failed".to_string()));
        }
        Ok(state.balances.get(&holder).copied().unwrap_or(U256::ZERO))
    }
}
