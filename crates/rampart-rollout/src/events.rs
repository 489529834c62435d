//! Lifecycle events — one per history entry, fire-and-forget.
//!
//! Sinks must never block the tick that emits into them and must swallow
//! their own delivery failures.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use rampart_state::{HistoryEntry, RolloutStatus};

/// A rollout state transition as seen by the outside world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutEvent {
    pub rollout_id: String,
    pub from_status: RolloutStatus,
    pub to_status: RolloutStatus,
    pub stage_index: usize,
    pub reason: String,
    /// Unix timestamp (seconds).
    pub timestamp: u64,
}

impl RolloutEvent {
    pub fn from_entry(rollout_id: &str, entry: &HistoryEntry) -> Self {
        Self {
            rollout_id: rollout_id.to_string(),
            from_status: entry.from,
            to_status: entry.to,
            stage_index: entry.stage_index,
            reason: entry.reason.clone(),
            timestamp: entry.at,
        }
    }
}

/// Outbound event delivery.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &RolloutEvent);
}

/// Logs every event at `info`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &RolloutEvent) {
        info!(
            rollout = %event.rollout_id,
            from = %event.from_status,
            to = %event.to_status,
            stage = event.stage_index,
            reason = %event.reason,
            "rollout event"
        );
    }
}

/// Fans events out to any number of in-process subscribers.
///
/// Sending with no subscribers, or to lagging subscribers, loses events
/// rather than blocking.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<RolloutEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RolloutEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: &RolloutEvent) {
        let _ = self.tx.send(event.clone());
    }
}
