//! JSON-RPC chain client over WebSocket

use super::{ChainClient, LogStream};
use crate::decoder::abi::balanceOfCall;
use crate::types::{RawLog, Receipt};
use crate::{config::ChainConfig, Error, Result};
use alloy::{
    network::{EthereumWallet, ReceiptResponse, TransactionBuilder},
    providers::{DynProvider, Provider, ProviderBuilder, WsConnect},
    rpc::types::{Filter, Log, TransactionRequest},
    signers::local::PrivateKeySigner,
};
use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::SolCall;
use async_trait::async_trait;
use futures::StreamExt;
use tracing::info;

/// Alloy provider with an optional local signer
pub struct RpcChainClient {
    provider: DynProvider,
    can_sign: bool,
}

impl RpcChainClient {
    /// Connect to `config.rpc_url`
    pub async fn connect(config: &ChainConfig) -> Result<Self> {
        let ws = WsConnect::new(config.rpc_url.clone());

        let (provider, can_sign) = match &config.signer_key {
            Some(key) => {
                let signer: PrivateKeySigner = key
                    .parse()
                    .map_err(|e| Error::Config(format!("Invalid signer key: {}", e)))?;
                info!(signer = %signer.address(), "Using local signer");
                let provider = ProviderBuilder::new()
                    .wallet(EthereumWallet::from(signer))
                    .on_ws(ws)
                    .await
                    .map_err(unavailable)?
                    .erased();
                (provider, true)
            }
            None => {
                let provider = ProviderBuilder::new()
                    .on_ws(ws)
                    .await
                    .map_err(unavailable)?
                    .erased();
                (provider, false)
            }
        };

        info!(url = %config.rpc_url, "Connected to chain");
        Ok(Self { provider, can_sign })
    }
}

fn unavailable(err: impl std::fmt::Display) -> Error {
    Error::ChainUnavailable(err.to_string())
}

fn to_raw(log: Log) -> Result<RawLog> {
    let (Some(block_number), Some(transaction_hash), Some(log_index)) =
        (log.block_number, log.transaction_hash, log.log_index)
    else {
        return Err(Error::ChainUnavailable(
            "log without block position".to_string(),
        ));
    };
    Ok(RawLog {
        address: log.address(),
        topics: log.topics().to_vec(),
        data: log.data().data.clone(),
        block_number,
        transaction_hash,
        log_index,
    })
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn block_number(&self) -> Result<u64> {
        self.provider.get_block_number().await.map_err(unavailable)
    }

    async fn get_logs(
        &self,
        contract: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>> {
        let filter = Filter::new()
            .address(contract)
            .from_block(from_block)
            .to_block(to_block);
        let logs = self.provider.get_logs(&filter).await.map_err(unavailable)?;
        logs.into_iter().map(to_raw).collect()
    }

    async fn subscribe_logs(&self, contract: Address, topic0: B256) -> Result<LogStream> {
        let filter = Filter::new().address(contract).event_signature(topic0);
        let subscription = self
            .provider
            .subscribe_logs(&filter)
            .await
            .map_err(unavailable)?;
        Ok(subscription.into_stream().map(to_raw).boxed())
    }

    async fn submit_transaction(&self, contract: Address, call_data: Bytes) -> Result<B256> {
        if !self.can_sign {
            return Err(Error::Config(
                "chain.signer_key is required to submit transactions".to_string(),
            ));
        }
        let tx = TransactionRequest::default()
            .with_to(contract)
            .with_input(call_data);
        let pending = self
            .provider
            .send_transaction(tx)
            .await
            .map_err(unavailable)?;
        Ok(*pending.tx_hash())
    }

    async fn get_receipt(&self, tx_hash: B256) -> Result<Option<Receipt>> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(unavailable)?;
        Ok(receipt.map(|r| Receipt {
            transaction_hash: tx_hash,
            success: r.status(),
            block_number: r.block_number(),
            gas_used: r.gas_used(),
        }))
    }

    async fn get_balance(&self, contract: Address, holder: Address) -> Result<U256> {
        let call = balanceOfCall { account: holder };
        let tx = TransactionRequest::default()
            .with_to(contract)
            .with_input(call.abi_encode());
        let out = self.provider.call(tx).await.map_err(unavailable)?;
        let decoded = balanceOfCall::abi_decode_returns(&out, true)
            .map_err(|e| Error::ChainUnavailable(format!("balanceOf decode: {}", e)))?;
        Ok(decoded._0)
    }
}
