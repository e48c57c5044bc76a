//! Engine wiring
//!
//! [`SyncEngine`] owns one [`Storage`] and builds every component on top of
//! it: decoder, ledger, reconciler, replay coordinator, subscription
//! manager and submission workflow. Without a configured contract the
//! engine is dormant: queries work, nothing is replayed or subscribed and
//! submissions are rejected.

use crate::{
    chain::ChainClient,
    config::Config,
    decoder::EventDecoder,
    error::{Error, Result},
    ledger::Ledger,
    query::LedgerQueries,
    reconciler::{Reconciler, RetryReport},
    replay::{ReplayCoordinator, ReplayMode, ReplayReport},
    storage::Storage,
    submission::{BurnRequest, MintRequest, SubmissionResult, SubmissionWorkflow},
    subscription::{
        spawn_subscription_manager, ListenerState, SubscriptionHandle, SubscriptionSettings,
    },
};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Engine status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    /// Listener state (STOPPED when dormant)
    pub listener_state: ListenerState,
    /// Reconnect timers scheduled so far
    pub reconnects: u64,
    /// Head block reached by the last replay
    pub last_replayed_block: Option<u64>,
    /// Current chain head; `None` when the chain did not answer
    pub chain_head: Option<u64>,
    /// Blocks between the chain head and the last replay
    pub lag: Option<u64>,
    /// No contract configured
    pub dormant: bool,
}

/// Components driven by a configured contract
struct Pipeline {
    replay: ReplayCoordinator,
    reconciler: Reconciler,
    subscription: SubscriptionHandle,
}

/// Blockchain-to-ledger synchronization engine
pub struct SyncEngine {
    storage: Storage,
    chain: Arc<dyn ChainClient>,
    pipeline: Option<Pipeline>,
    submission: SubmissionWorkflow,
    shutdown: CancellationToken,
}

impl SyncEngine {
    /// Open storage under `config.data_dir` and wire the components
    pub fn open(config: &Config, chain: Arc<dyn ChainClient>) -> Result<Self> {
        config.validate()?;
        let storage = Storage::open(config)?;
        Ok(Self::with_storage(config, chain, storage))
    }

    /// Wire the components over an already opened storage
    ///
    /// Must be called inside a Tokio runtime when a contract is configured.
    pub fn with_storage(config: &Config, chain: Arc<dyn ChainClient>, storage: Storage) -> Self {
        let ledger = Ledger::new(storage.clone());
        let shutdown = CancellationToken::new();
        let contract = config.chain.contract_address;

        let pipeline = match contract {
            Some(contract) => {
                let decoder = EventDecoder::new(Arc::new(storage.clone()));
                let reconciler = Reconciler::new(
                    decoder,
                    ledger.clone(),
                    contract,
                    config.sync.transfer_asset_id.clone(),
                );
                let replay = ReplayCoordinator::new(
                    chain.clone(),
                    reconciler.clone(),
                    storage.clone(),
                    config.chain.start_block,
                    config.chain.max_block_range,
                );
                let subscription = spawn_subscription_manager(
                    chain.clone(),
                    replay.clone(),
                    reconciler.clone(),
                    SubscriptionSettings {
                        contract,
                        reconnect_delay: config.sync.reconnect_delay(),
                        health_interval: config.sync.health_interval(),
                    },
                );
                Some(Pipeline {
                    replay,
                    reconciler,
                    subscription,
                })
            }
            None => {
                warn!("No contract address configured; sync engine is dormant");
                None
            }
        };

        let submission = SubmissionWorkflow::new(
            chain.clone(),
            ledger,
            contract,
            &config.submission,
            shutdown.child_token(),
        );

        info!(
            service = %config.service_name,
            contract = ?contract,
            data_dir = %config.data_dir.display(),
            "Sync engine initialized"
        );

        Self {
            storage,
            chain,
            pipeline,
            submission,
            shutdown,
        }
    }

    /// Replay history and start listening; no-op when dormant
    pub async fn start(&self) -> Result<()> {
        match &self.pipeline {
            Some(pipeline) => pipeline.subscription.start().await,
            None => {
                warn!("Start requested on dormant engine");
                Ok(())
            }
        }
    }

    /// Stop listening; storage stays open
    pub async fn stop(&self) -> Result<()> {
        match &self.pipeline {
            Some(pipeline) => pipeline.subscription.stop().await,
            None => Ok(()),
        }
    }

    /// Run a replay outside the subscription lifecycle
    pub async fn replay(&self, mode: ReplayMode) -> Result<ReplayReport> {
        self.pipeline()?.replay.run(mode).await
    }

    /// Retry events left unresolved
    pub fn retry_unresolved(&self) -> Result<RetryReport> {
        self.pipeline()?.reconciler.retry_unresolved()
    }

    /// Submit a mint
    pub async fn mint(&self, request: MintRequest) -> Result<SubmissionResult> {
        self.submission.mint(request).await
    }

    /// Submit a burn
    pub async fn burn(&self, request: BurnRequest) -> Result<SubmissionResult> {
        self.submission.burn(request).await
    }

    /// Make `asset_id` resolvable from its indexed topic hash
    ///
    /// Needed for assets minted by other parties before this engine saw
    /// them; submissions register their asset ids themselves.
    pub fn register_asset_id(&self, asset_id: &str) -> Result<()> {
        self.storage.register_asset_id(asset_id).map(|_| ())
    }

    /// Read-only queries
    pub fn queries(&self) -> LedgerQueries {
        LedgerQueries::new(self.storage.clone())
    }

    /// Subscription handle, if a contract is configured
    pub fn subscription(&self) -> Option<&SubscriptionHandle> {
        self.pipeline.as_ref().map(|p| &p.subscription)
    }

    /// Current status
    pub async fn status(&self) -> Result<SyncStatus> {
        let last_replayed_block = self.storage.replay_checkpoint()?;
        let chain_head = match self.chain.block_number().await {
            Ok(head) => Some(head),
            Err(e) => {
                debug!(error = %e, "Chain head unavailable for status");
                None
            }
        };
        let lag = chain_head
            .zip(last_replayed_block)
            .map(|(head, replayed)| head.saturating_sub(replayed));

        let (listener_state, reconnects) = match &self.pipeline {
            Some(pipeline) => {
                let status = pipeline.subscription.status().await?;
                (status.state, status.reconnects)
            }
            None => (ListenerState::Stopped, 0),
        };
        Ok(SyncStatus {
            listener_state,
            reconnects,
            last_replayed_block,
            chain_head,
            lag,
            dormant: self.pipeline.is_none(),
        })
    }

    /// Cancel pending receipt waits and stop listening
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down sync engine");
        self.shutdown.cancel();
        self.stop().await
    }

    fn pipeline(&self) -> Result<&Pipeline> {
        self.pipeline.as_ref().ok_or_else(|| {
            Error::Config("chain.contract_address is not configured".to_string())
        })
    }
}
