//! Prometheus metrics for the synchronization engine
//!
//! # Metrics
//!
//! - `ledger_sync_events_total` - Logs seen, by event kind and outcome
//! - `ledger_sync_invariant_violations_total` - Unresolved events, by event kind
//! - `ledger_sync_reconnects_total` - Reconnect timers scheduled
//! - `ledger_sync_listener_state` - Current listener state (see `ListenerState::code`)
//! - `ledger_sync_replay_runs_total` - Replay runs, by status
//! - `ledger_sync_replay_duration_seconds` - Replay duration
//! - `ledger_sync_submissions_total` - Mint/burn submissions, by type and outcome

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    /// Logs seen, by event kind and outcome
    pub static ref EVENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ledger_sync_events_total",
        "Logs processed by the reconciler",
        &["event", "outcome"]
    )
    .unwrap();

    /// Unresolved events
    pub static ref INVARIANT_VIOLATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ledger_sync_invariant_violations_total",
        "Events that would drive a supply or balance negative",
        &["event"]
    )
    .unwrap();

    /// Reconnect timers scheduled
    pub static ref RECONNECTS_TOTAL: IntCounter = register_int_counter!(
        "ledger_sync_reconnects_total",
        "Reconnect timers scheduled by the subscription manager"
    )
    .unwrap();

    /// Listener state
    pub static ref LISTENER_STATE: IntGauge = register_int_gauge!(
        "ledger_sync_listener_state",
        "Subscription manager state (0=stopped 1=starting 2=listening 3=disconnected 4=reconnecting)"
    )
    .unwrap();

    /// Replay runs, by status
    pub static ref REPLAY_RUNS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ledger_sync_replay_runs_total",
        "Replay coordinator runs",
        &["status"]
    )
    .unwrap();

    /// Replay duration
    pub static ref REPLAY_DURATION: Histogram = register_histogram!(
        "ledger_sync_replay_duration_seconds",
        "Replay duration in seconds"
    )
    .unwrap();

    /// Mint/burn submissions
    pub static ref SUBMISSIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ledger_sync_submissions_total",
        "Mint/burn submissions",
        &["type", "outcome"]
    )
    .unwrap();
}

/// Render every registered metric in the Prometheus text format
pub fn gather_text() -> crate::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| crate::Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    String::from_utf8(buffer)
        .map_err(|e| crate::Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render() {
        EVENTS_TOTAL.with_label_values(&["minted", "applied"]).inc();
        RECONNECTS_TOTAL.inc();
        let text = gather_text().unwrap();
        assert!(text.contains("ledger_sync_events_total"));
        assert!(text.contains("ledger_sync_reconnects_total"));
    }
}
