//! Live subscription manager
//!
//! A single actor task owns the listener state machine:
//!
//! ```text
//!  STOPPED ──start──▶ STARTING ──replay + 3 filters ok──▶ LISTENING
//!                        ▲   │                               │
//!                        │   └──────── failure ──────────┐   │ filter error
//!                 timer  │                               ▼   ▼
//!                  fires │                           DISCONNECTED
//!                        │                               │ one timer
//!                   RECONNECTING ◀────────────────────────┘
//! ```
//!
//! Workers and timers never touch the state directly; they send signals
//! tagged with the generation they belong to. Every failure bumps the
//! generation, so later failures from the torn-down filters are stale and
//! at most one reconnect timer exists at a time.

use crate::{
    chain::{ChainClient, LogStream},
    decoder::EventKind,
    error::{Error, Result},
    metrics,
    reconciler::Reconciler,
    replay::{ReplayCoordinator, ReplayMode, ReplayReport},
};
use alloy_primitives::Address;
use futures::StreamExt;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Listener state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListenerState {
    /// Not running
    Stopped,
    /// Replaying, then registering filters
    Starting,
    /// All three filters delivering
    Listening,
    /// Filters torn down after a failure
    Disconnected,
    /// Waiting for the reconnect timer
    Reconnecting,
}

impl ListenerState {
    /// Numeric code exported as a gauge
    pub fn code(&self) -> i64 {
        match self {
            ListenerState::Stopped => 0,
            ListenerState::Starting => 1,
            ListenerState::Listening => 2,
            ListenerState::Disconnected => 3,
            ListenerState::Reconnecting => 4,
        }
    }
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ListenerState::Stopped => "STOPPED",
            ListenerState::Starting => "STARTING",
            ListenerState::Listening => "LISTENING",
            ListenerState::Disconnected => "DISCONNECTED",
            ListenerState::Reconnecting => "RECONNECTING",
        };
        f.write_str(name)
    }
}

/// Snapshot of the manager
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionStatus {
    /// Current state
    pub state: ListenerState,
    /// Reconnect timers scheduled so far
    pub reconnects: u64,
    /// Current generation
    pub generation: u64,
    /// Report of the last completed replay
    pub last_replay: Option<ReplayReport>,
}

/// Subscription manager settings
#[derive(Debug, Clone)]
pub struct SubscriptionSettings {
    /// Token contract
    pub contract: Address,
    /// Delay before resubscribing
    pub reconnect_delay: Duration,
    /// Health log interval while listening
    pub health_interval: Duration,
}

/// Commands accepted from [`SubscriptionHandle`]
enum Command {
    Start {
        response: oneshot::Sender<()>,
    },
    Stop {
        response: oneshot::Sender<()>,
    },
    Status {
        response: oneshot::Sender<SubscriptionStatus>,
    },
}

/// Signals from tasks spawned by the actor
enum Signal {
    Started {
        generation: u64,
        streams: Vec<(EventKind, LogStream)>,
        report: ReplayReport,
    },
    StartFailed {
        generation: u64,
        error: Error,
    },
    FilterFailed {
        generation: u64,
        kind: EventKind,
        reason: String,
    },
    ReconnectDue {
        generation: u64,
    },
}

struct SubscriptionActor {
    chain: Arc<dyn ChainClient>,
    replay: ReplayCoordinator,
    reconciler: Reconciler,
    settings: SubscriptionSettings,

    commands: mpsc::Receiver<Command>,
    signals: mpsc::UnboundedReceiver<Signal>,
    signal_tx: mpsc::UnboundedSender<Signal>,
    state_tx: watch::Sender<ListenerState>,

    state: ListenerState,
    generation: u64,
    reconnects: u64,
    full_replay_done: bool,
    last_replay: Option<ReplayReport>,

    start_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl SubscriptionActor {
    async fn run(mut self) {
        let period = self.settings.health_interval;
        let mut health = interval_at(Instant::now() + period, period);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },

                Some(signal) = self.signals.recv() => self.handle_signal(signal),

                _ = health.tick(), if self.state == ListenerState::Listening => {
                    self.log_health();
                }
            }
        }

        self.teardown();
        self.set_state(ListenerState::Stopped);
        debug!("Subscription actor exited");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { response } => {
                if self.state == ListenerState::Stopped {
                    self.begin_start();
                } else {
                    debug!(state = %self.state, "Start ignored, manager already running");
                }
                let _ = response.send(());
            }
            Command::Stop { response } => {
                self.teardown();
                self.generation += 1;
                self.set_state(ListenerState::Stopped);
                info!("Subscription manager stopped");
                let _ = response.send(());
            }
            Command::Status { response } => {
                let _ = response.send(SubscriptionStatus {
                    state: self.state,
                    reconnects: self.reconnects,
                    generation: self.generation,
                    last_replay: self.last_replay.clone(),
                });
            }
        }
    }

    fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Started {
                generation,
                streams,
                report,
            } => {
                if generation != self.generation || self.state != ListenerState::Starting {
                    debug!(generation, "Dropping streams of a stale start");
                    return;
                }
                self.start_task = None;
                self.last_replay = Some(report);
                for (kind, stream) in streams {
                    let worker = self.spawn_worker(kind, stream);
                    self.workers.push(worker);
                }
                self.set_state(ListenerState::Listening);
                info!(generation, "Listening for contract events");
            }
            Signal::StartFailed { generation, error } => {
                self.on_failure(generation, &format!("start failed: {}", error));
            }
            Signal::FilterFailed {
                generation,
                kind,
                reason,
            } => {
                self.on_failure(generation, &format!("{} filter failed: {}", kind.as_str(), reason));
            }
            Signal::ReconnectDue { generation } => {
                if generation != self.generation || self.state != ListenerState::Reconnecting {
                    return;
                }
                self.reconnect_task = None;
                info!(generation, "Reconnecting");
                self.begin_start();
            }
        }
    }

    fn on_failure(&mut self, generation: u64, reason: &str) {
        if generation != self.generation {
            debug!(generation, current = self.generation, reason, "Ignoring stale failure");
            return;
        }
        if !matches!(
            self.state,
            ListenerState::Starting | ListenerState::Listening
        ) {
            return;
        }

        error!(state = %self.state, reason, "Subscription failure, tearing down filters");
        self.teardown();
        self.generation += 1;
        self.set_state(ListenerState::Disconnected);

        let generation = self.generation;
        let delay = self.settings.reconnect_delay;
        let signals = self.signal_tx.clone();
        self.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = signals.send(Signal::ReconnectDue { generation });
        }));
        self.reconnects += 1;
        metrics::RECONNECTS_TOTAL.inc();
        warn!(delay_secs = delay.as_secs(), attempt = self.reconnects, "Reconnect scheduled");
        self.set_state(ListenerState::Reconnecting);
    }

    fn begin_start(&mut self) {
        self.set_state(ListenerState::Starting);

        let mode = if self.full_replay_done {
            ReplayMode::Resume
        } else {
            ReplayMode::Full
        };
        self.full_replay_done = true;

        let generation = self.generation;
        let chain = self.chain.clone();
        let replay = self.replay.clone();
        let contract = self.settings.contract;
        let signals = self.signal_tx.clone();

        self.start_task = Some(tokio::spawn(async move {
            let signal = match start_filters(chain, replay, contract, mode).await {
                Ok((streams, report)) => Signal::Started {
                    generation,
                    streams,
                    report,
                },
                Err(error) => Signal::StartFailed { generation, error },
            };
            let _ = signals.send(signal);
        }));
    }

    fn spawn_worker(&self, kind: EventKind, mut stream: LogStream) -> JoinHandle<()> {
        let reconciler = self.reconciler.clone();
        let signals = self.signal_tx.clone();
        let generation = self.generation;

        tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(log)) => {
                        let (tx_hash, log_index) = (log.transaction_hash, log.log_index);
                        if let Err(e) = reconciler.process_log_blocking(log).await {
                            warn!(
                                filter = kind.as_str(),
                                tx_hash = %tx_hash,
                                log_index,
                                error = %e,
                                "Skipping live log"
                            );
                        }
                    }
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };
            let _ = signals.send(Signal::FilterFailed {
                generation,
                kind,
                reason,
            });
        })
    }

    fn teardown(&mut self) {
        if let Some(task) = self.start_task.take() {
            task.abort();
        }
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
        for worker in self.workers.drain(..) {
            worker.abort();
        }
    }

    fn log_health(&self) {
        let alive = self.workers.iter().filter(|w| !w.is_finished()).count();
        info!(
            state = %self.state,
            filters = alive,
            reconnects = self.reconnects,
            last_replayed_block = self.last_replay.as_ref().map(|r| r.to_block),
            "Subscription manager health"
        );
    }

    fn set_state(&mut self, state: ListenerState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Listener state change");
        }
        self.state = state;
        metrics::LISTENER_STATE.set(state.code());
        self.state_tx.send_replace(state);
    }
}

/// Replay, then register one filter per event kind
async fn start_filters(
    chain: Arc<dyn ChainClient>,
    replay: ReplayCoordinator,
    contract: Address,
    mode: ReplayMode,
) -> Result<(Vec<(EventKind, LogStream)>, ReplayReport)> {
    let mut report = replay.run(mode).await?;

    let mut streams = Vec::with_capacity(EventKind::ALL.len());
    for kind in EventKind::ALL {
        let stream = chain.subscribe_logs(contract, kind.topic0()).await?;
        debug!(filter = kind.as_str(), "Filter registered");
        streams.push((kind, stream));
    }

    // Logs mined between the replay head and filter registration
    let catch_up = replay.run(ReplayMode::Resume).await?;
    report.extend(&catch_up);
    Ok((streams, report))
}

/// Handle for sending commands to the subscription manager
#[derive(Clone)]
pub struct SubscriptionHandle {
    sender: mpsc::Sender<Command>,
    state: watch::Receiver<ListenerState>,
}

impl SubscriptionHandle {
    /// Leave STOPPED; returns once the start has been scheduled
    pub async fn start(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::Start { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Subscription mailbox closed".to_string()))?;
        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }

    /// Tear down filters and timers, back to STOPPED
    pub async fn stop(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::Stop { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Subscription mailbox closed".to_string()))?;
        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }

    /// Status snapshot
    pub async fn status(&self) -> Result<SubscriptionStatus> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::Status { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Subscription mailbox closed".to_string()))?;
        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }

    /// Current state
    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Wait until the manager reaches `target`
    pub async fn wait_for(&self, target: ListenerState) -> Result<()> {
        let mut rx = self.state.clone();
        loop {
            if *rx.borrow_and_update() == target {
                return Ok(());
            }
            rx.changed()
                .await
                .map_err(|_| Error::Concurrency("Subscription manager exited".to_string()))?;
        }
    }
}

/// Spawn the subscription manager in STOPPED state
pub fn spawn_subscription_manager(
    chain: Arc<dyn ChainClient>,
    replay: ReplayCoordinator,
    reconciler: Reconciler,
    settings: SubscriptionSettings,
) -> SubscriptionHandle {
    let (sender, commands) = mpsc::channel(64);
    let (signal_tx, signals) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ListenerState::Stopped);

    let actor = SubscriptionActor {
        chain,
        replay,
        reconciler,
        settings,
        commands,
        signals,
        signal_tx,
        state_tx,
        state: ListenerState::Stopped,
        generation: 0,
        reconnects: 0,
        full_replay_done: false,
        last_replay: None,
        start_task: None,
        reconnect_task: None,
        workers: Vec::new(),
    };

    tokio::spawn(actor.run());

    SubscriptionHandle {
        sender,
        state: state_rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChain;
    use crate::decoder::{minted_log, EventDecoder, LogPosition};
    use crate::ledger::Ledger;
    use crate::storage::Storage;
    use crate::Config;
    use alloy_primitives::{B256, U256};
    use tempfile::TempDir;

    const CONTRACT: Address = Address::repeat_byte(0xcc);
    const ALICE: Address = Address::repeat_byte(0xaa);

    struct Fixture {
        handle: SubscriptionHandle,
        chain: Arc<MockChain>,
        storage: Storage,
        _temp: TempDir,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        let storage = Storage::open(&config).unwrap();
        storage.register_asset_id("BOND-1").unwrap();
        let chain = Arc::new(MockChain::new());
        let reconciler = Reconciler::new(
            EventDecoder::new(Arc::new(storage.clone())),
            Ledger::new(storage.clone()),
            CONTRACT,
            None,
        );
        let replay = ReplayCoordinator::new(chain.clone(), reconciler.clone(), storage.clone(), 0, 5_000);
        let handle = spawn_subscription_manager(
            chain.clone(),
            replay,
            reconciler,
            SubscriptionSettings {
                contract: CONTRACT,
                reconnect_delay: Duration::from_secs(30),
                health_interval: Duration::from_secs(300),
            },
        );
        Fixture {
            handle,
            chain,
            storage,
            _temp: temp,
        }
    }

    fn mint(tx: u8, block: u64, amount: u64) -> crate::types::RawLog {
        minted_log(
            LogPosition {
                contract: CONTRACT,
                transaction_hash: B256::repeat_byte(tx),
                block_number: block,
                log_index: 0,
            },
            "BOND-1",
            ALICE,
            U256::from(amount),
            "T",
        )
    }

    async fn wait_for_supply(storage: &Storage, expected: u64) -> bool {
        for _ in 0..100 {
            let supply = storage.get_asset("BOND-1").unwrap().map(|a| a.total_supply);
            if supply == Some(U256::from(expected)) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_replays_then_listens() {
        let f = fixture();
        f.chain.push_historical_log(mint(1, 1, 100));

        assert_eq!(f.handle.state(), ListenerState::Stopped);
        f.handle.start().await.unwrap();
        f.handle.wait_for(ListenerState::Listening).await.unwrap();
        assert_eq!(f.chain.active_subscriptions(), 3);

        let status = f.handle.status().await.unwrap();
        assert_eq!(status.last_replay.unwrap().applied, 1);

        f.chain.push_log(mint(2, 2, 50));
        assert!(wait_for_supply(&f.storage, 150).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_mined_before_filters_register_is_caught_up() {
        let f = fixture();
        f.chain.push_historical_log(mint(1, 1, 100));
        // Lands after the replay read head 1, before any filter exists
        f.chain.mine_on_next_subscribe(mint(2, 2, 40));

        f.handle.start().await.unwrap();
        f.handle.wait_for(ListenerState::Listening).await.unwrap();

        assert!(wait_for_supply(&f.storage, 140).await);
        let report = f.handle.status().await.unwrap().last_replay.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.to_block, 2);
        assert_eq!(f.storage.replay_checkpoint().unwrap(), Some(2));
        assert_eq!(f.chain.subscribe_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_error_schedules_single_reconnect() {
        let f = fixture();
        f.handle.start().await.unwrap();
        f.handle.wait_for(ListenerState::Listening).await.unwrap();

        // All three filters fail at once; only one timer may be scheduled
        f.chain.break_subscriptions();
        f.handle.wait_for(ListenerState::Reconnecting).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let status = f.handle.status().await.unwrap();
        assert_eq!(status.reconnects, 1);
        assert_eq!(status.state, ListenerState::Reconnecting);

        // Missed while disconnected, caught by the resume replay
        f.chain.push_log(mint(3, 9, 70));

        tokio::time::sleep(Duration::from_secs(31)).await;
        f.handle.wait_for(ListenerState::Listening).await.unwrap();
        assert_eq!(f.handle.status().await.unwrap().reconnects, 1);
        assert!(wait_for_supply(&f.storage, 70).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_reconnect() {
        let f = fixture();
        f.chain.fail_next_subscriptions(1);
        f.handle.start().await.unwrap();
        f.handle.wait_for(ListenerState::Reconnecting).await.unwrap();

        f.handle.stop().await.unwrap();
        assert_eq!(f.handle.state(), ListenerState::Stopped);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.handle.state(), ListenerState::Stopped);
        assert_eq!(f.chain.subscribe_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_tick_only_logs() {
        let f = fixture();
        f.handle.start().await.unwrap();
        f.handle.wait_for(ListenerState::Listening).await.unwrap();

        tokio::time::sleep(Duration::from_secs(901)).await;
        let status = f.handle.status().await.unwrap();
        assert_eq!(status.state, ListenerState::Listening);
        assert_eq!(status.reconnects, 0);
    }
}
