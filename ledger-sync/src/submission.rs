//! Mint/burn submission workflow
//!
//! Validates a request, submits the contract call, waits for its receipt
//! and writes the optimistic ledger effect through the same transition the
//! reconciler uses. The receipt wait polls on a fixed interval and stops
//! early when the shutdown token is cancelled.

use crate::{
    chain::ChainClient,
    config::SubmissionConfig,
    decoder::abi::{burnCall, mintCall},
    error::{Error, Result},
    ledger::{self, CommitOutcome, Ledger},
    metrics,
    state::{self, Movement, MovementKind, Origin},
    types::{Asset, Receipt, Transaction, TransactionStatus, TransactionType},
};
use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::SolCall;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use validator::{Validate, ValidationError};

/// Mint request
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct MintRequest {
    /// Asset to mint
    #[validate(length(min = 1, max = 128), custom = "not_blank")]
    pub asset_id: String,
    /// Asset class, used if the asset is new
    #[validate(length(min = 1, max = 64), custom = "not_blank")]
    pub asset_type: String,
    /// Amount to mint
    #[validate(custom = "positive_amount")]
    pub amount: U256,
    /// Credited address
    #[validate(custom = "holder_address")]
    pub recipient: String,
    /// Issuer identifier
    #[validate(length(min = 1, max = 128), custom = "not_blank")]
    pub issuer: String,
}

/// Burn request
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct BurnRequest {
    /// Asset to burn
    #[validate(length(min = 1, max = 128), custom = "not_blank")]
    pub asset_id: String,
    /// Amount to burn
    #[validate(custom = "positive_amount")]
    pub amount: U256,
    /// Debited address
    #[validate(custom = "holder_address")]
    pub from: String,
}

fn not_blank(value: &str) -> std::result::Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }
    Ok(())
}

fn positive_amount(amount: &U256) -> std::result::Result<(), ValidationError> {
    if amount.is_zero() {
        return Err(ValidationError::new("amount_not_positive"));
    }
    Ok(())
}

fn holder_address(value: &str) -> std::result::Result<(), ValidationError> {
    match value.trim().parse::<Address>() {
        Ok(addr) if addr.is_zero() => Err(ValidationError::new("zero_address")),
        Ok(_) => Ok(()),
        Err(_) => Err(ValidationError::new("invalid_address")),
    }
}

fn parse_address(value: &str) -> Result<Address> {
    value
        .trim()
        .parse()
        .map_err(|e| Error::Validation(format!("invalid address {}: {}", value, e)))
}

/// Outcome of a successful submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionResult {
    /// Transaction row as stored
    pub transaction: Transaction,
    /// Asset row after the optimistic update
    pub asset: Option<Asset>,
}

/// What a submission will do to the ledger once it succeeds
struct Plan {
    transaction_type: TransactionType,
    asset_id: String,
    kind: MovementKind,
    amount: U256,
    asset_type: Option<String>,
    issuer: Option<String>,
}

impl Plan {
    fn movement(&self, contract: Address, tx_hash: B256, origin: Origin) -> Movement {
        Movement {
            transaction_hash: tx_hash,
            asset_id: self.asset_id.clone(),
            kind: self.kind,
            amount: self.amount,
            asset_type: self.asset_type.clone(),
            issuer: self.issuer.clone(),
            contract,
            origin,
        }
    }

    fn label(&self) -> &'static str {
        match self.transaction_type {
            TransactionType::Mint => "mint",
            TransactionType::Burn => "burn",
            TransactionType::Transfer => "transfer",
        }
    }
}

/// User-triggered mint/burn path
#[derive(Clone)]
pub struct SubmissionWorkflow {
    chain: Arc<dyn ChainClient>,
    ledger: Ledger,
    contract: Option<Address>,
    poll_interval: Duration,
    max_attempts: u32,
    shutdown: CancellationToken,
}

impl SubmissionWorkflow {
    /// Create workflow; receipt waits end when `shutdown` is cancelled
    pub fn new(
        chain: Arc<dyn ChainClient>,
        ledger: Ledger,
        contract: Option<Address>,
        config: &SubmissionConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            chain,
            ledger,
            contract,
            poll_interval: config.poll_interval(),
            max_attempts: config.receipt_max_attempts.max(1),
            shutdown,
        }
    }

    /// Mint `amount` of `asset_id` to `recipient`
    pub async fn mint(&self, request: MintRequest) -> Result<SubmissionResult> {
        request.validate()?;
        let contract = self.contract()?;
        let recipient = parse_address(&request.recipient)?;

        let call = mintCall {
            to: recipient,
            amount: request.amount,
            assetId: request.asset_id.clone(),
            assetType: request.asset_type.clone(),
            issuer: request.issuer.clone(),
        };
        let plan = Plan {
            transaction_type: TransactionType::Mint,
            asset_id: request.asset_id,
            kind: MovementKind::Mint { to: recipient },
            amount: request.amount,
            asset_type: Some(request.asset_type),
            issuer: Some(request.issuer),
        };

        self.execute(contract, Bytes::from(call.abi_encode()), plan).await
    }

    /// Burn `amount` of `asset_id` held by `from`
    pub async fn burn(&self, request: BurnRequest) -> Result<SubmissionResult> {
        request.validate()?;
        let contract = self.contract()?;
        let from = parse_address(&request.from)?;

        let available = self.checked_balance(contract, &request.asset_id, from).await?;
        if available < request.amount {
            metrics::SUBMISSIONS_TOTAL
                .with_label_values(&["burn", "rejected"])
                .inc();
            warn!(
                asset_id = %request.asset_id,
                holder = %from,
                required = %request.amount,
                available = %available,
                "Burn rejected before submission"
            );
            return Err(Error::InsufficientBalance {
                required: request.amount,
                available,
            });
        }

        let call = burnCall {
            from,
            amount: request.amount,
            assetId: request.asset_id.clone(),
        };
        let plan = Plan {
            transaction_type: TransactionType::Burn,
            asset_id: request.asset_id,
            kind: MovementKind::Burn { from },
            amount: request.amount,
            asset_type: None,
            issuer: None,
        };

        self.execute(contract, Bytes::from(call.abi_encode()), plan).await
    }

    fn contract(&self) -> Result<Address> {
        self.contract.ok_or_else(|| {
            Error::Config("chain.contract_address is not configured".to_string())
        })
    }

    /// On-chain balance, or the tracked balance when the chain cannot answer
    async fn checked_balance(&self, contract: Address, asset_id: &str, holder: Address) -> Result<U256> {
        match self.chain.get_balance(contract, holder).await {
            Ok(balance) => Ok(balance),
            Err(e) => {
                let tracked = self
                    .ledger
                    .storage()
                    .get_holder(asset_id, &holder)?
                    .map_or(U256::ZERO, |h| h.balance);
                warn!(
                    holder = %holder,
                    error = %e,
                    tracked = %tracked,
                    "Balance query failed, using tracked balance"
                );
                Ok(tracked)
            }
        }
    }

    async fn execute(&self, contract: Address, call_data: Bytes, plan: Plan) -> Result<SubmissionResult> {
        let label = plan.label();
        self.ledger.storage().register_asset_id(&plan.asset_id)?;

        let tx_hash = self.chain.submit_transaction(contract, call_data).await?;
        info!(
            tx_hash = %tx_hash,
            asset_id = %plan.asset_id,
            amount = %plan.amount,
            r#type = label,
            "Transaction submitted"
        );

        let draft = self.draft(contract, tx_hash, &plan);
        let writer = self.ledger.clone();
        let pending = draft.clone();
        ledger::blocking(move || writer.record_submission_status(pending)).await?;

        let receipt = match self.await_receipt(tx_hash).await {
            Ok(receipt) => receipt,
            Err(e @ Error::SubmissionTimeout { .. }) => {
                metrics::SUBMISSIONS_TOTAL.with_label_values(&[label, "timeout"]).inc();
                return self.fail(draft, e, &plan, None).await;
            }
            Err(e) => {
                metrics::SUBMISSIONS_TOTAL.with_label_values(&[label, "cancelled"]).inc();
                info!(tx_hash = %tx_hash, "Receipt wait abandoned, record left PENDING");
                return Err(e);
            }
        };

        if !receipt.success {
            metrics::SUBMISSIONS_TOTAL.with_label_values(&[label, "reverted"]).inc();
            return self.fail(
                draft,
                Error::TransactionReverted { tx_hash },
                &plan,
                Some(receipt.gas_used),
            )
            .await;
        }

        let movement = plan.movement(
            contract,
            tx_hash,
            Origin::Submission {
                gas_used: receipt.gas_used,
            },
        );
        let writer = self.ledger.clone();
        match ledger::blocking(move || writer.commit_movement(&movement, None)).await? {
            CommitOutcome::Applied => debug!(tx_hash = %tx_hash, "Optimistic ledger update applied"),
            CommitOutcome::Merged => debug!(tx_hash = %tx_hash, "Event already reconciled"),
            CommitOutcome::Unresolved(violation) => warn!(
                tx_hash = %tx_hash,
                violation = %violation,
                "Optimistic update skipped; waiting for the on-chain event"
            ),
            CommitOutcome::Duplicate => {}
        }

        metrics::SUBMISSIONS_TOTAL.with_label_values(&[label, "success"]).inc();
        info!(
            tx_hash = %tx_hash,
            gas_used = receipt.gas_used,
            block = ?receipt.block_number,
            "Transaction succeeded"
        );
        self.result(tx_hash, &plan.asset_id)
    }

    /// Poll for the receipt every `poll_interval`, at most `max_attempts` times
    async fn await_receipt(&self, tx_hash: B256) -> Result<Receipt> {
        for attempt in 1..=self.max_attempts {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(Error::Cancelled(format!("receipt wait for {}", tx_hash)));
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let polled = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(Error::Cancelled(format!("receipt wait for {}", tx_hash)));
                }
                polled = self.chain.get_receipt(tx_hash) => polled,
            };

            match polled {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => debug!(tx_hash = %tx_hash, attempt, "Receipt not yet available"),
                Err(e) => warn!(tx_hash = %tx_hash, attempt, error = %e, "Receipt poll failed"),
            }
        }

        Err(Error::SubmissionTimeout {
            tx_hash,
            attempts: self.max_attempts,
        })
    }

    /// Record FAILED unless the reconciler already confirmed the transaction
    async fn fail(
        &self,
        mut draft: Transaction,
        error: Error,
        plan: &Plan,
        gas_used: Option<u64>,
    ) -> Result<SubmissionResult> {
        draft.status = TransactionStatus::Failed;
        draft.error_message = Some(error.to_string());
        draft.gas_used = gas_used;
        draft.updated_at = Utc::now();

        let writer = self.ledger.clone();
        let stored = ledger::blocking(move || writer.record_submission_status(draft)).await?;
        if stored.ledger_applied {
            info!(
                tx_hash = %stored.transaction_hash,
                status = %stored.status,
                "Transaction already reconciled from chain"
            );
            return self.result(stored.transaction_hash, &plan.asset_id);
        }

        warn!(tx_hash = %stored.transaction_hash, error = %error, "Transaction failed");
        Err(error)
    }

    fn draft(&self, contract: Address, tx_hash: B256, plan: &Plan) -> Transaction {
        let movement = plan.movement(contract, tx_hash, Origin::Submission { gas_used: 0 });
        let mut tx = state::unapplied_record(None, &movement, Utc::now());
        tx.status = TransactionStatus::Pending;
        tx.gas_used = None;
        tx
    }

    fn result(&self, tx_hash: B256, asset_id: &str) -> Result<SubmissionResult> {
        let storage = self.ledger.storage();
        let transaction = storage
            .get_transaction(&tx_hash)?
            .ok_or_else(|| Error::NotFound(format!("transaction {}", tx_hash)))?;
        Ok(SubmissionResult {
            transaction,
            asset: storage.get_asset(asset_id)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mint_request() -> MintRequest {
        MintRequest {
            asset_id: "BOND-1".to_string(),
            asset_type: "CORPORATE_BOND".to_string(),
            amount: U256::from(1000u64),
            recipient: format!("{}", Address::repeat_byte(0xaa)),
            issuer: "Acme".to_string(),
        }
    }

    #[test]
    fn test_valid_request() {
        assert!(mint_request().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_amount_and_blank_fields() {
        let mut req = mint_request();
        req.amount = U256::ZERO;
        assert!(req.validate().is_err());

        let mut req = mint_request();
        req.asset_id = "   ".to_string();
        assert!(req.validate().is_err());

        let mut req = mint_request();
        req.issuer = String::new();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_rejects_malformed_addresses() {
        let mut req = mint_request();
        req.recipient = "0x1234".to_string();
        assert!(req.validate().is_err());

        req.recipient = format!("{}", Address::ZERO);
        assert!(req.validate().is_err());

        let burn = BurnRequest {
            asset_id: "BOND-1".to_string(),
            amount: U256::from(1u64),
            from: "not-an-address".to_string(),
        };
        let err: Error = burn.validate().unwrap_err().into();
        assert_eq!(err.kind(), "validation");
    }
}
