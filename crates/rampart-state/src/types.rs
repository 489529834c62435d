//! Domain types for rollout state.
//!
//! A [`Rollout`] is the only durable record. It owns its history log,
//! which can only be appended to through [`Rollout::transition`] and
//! [`Rollout::note`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use rampart_core::StageCatalog;

use crate::error::{StateError, StateResult};

/// Unique identifier for a rollout.
pub type RolloutId = String;

/// Name of a traffic-receiving target.
pub type Variant = String;

// ── Status ─────────────────────────────────────────────────────────

/// Lifecycle status of a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    /// Created, no weight applied yet.
    Pending,
    /// A stage weight is being applied (or re-applied after a router error).
    Advancing,
    /// Current stage weight is live; soaking.
    Holding,
    /// Traffic restore to the stable variant is in progress.
    RollingBack,
    Succeeded,
    Failed,
}

impl RolloutStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RolloutStatus::Succeeded | RolloutStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RolloutStatus::Pending => "pending",
            RolloutStatus::Advancing => "advancing",
            RolloutStatus::Holding => "holding",
            RolloutStatus::RollingBack => "rolling_back",
            RolloutStatus::Succeeded => "succeeded",
            RolloutStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── History ────────────────────────────────────────────────────────

/// One entry of a rollout's append-only audit log.
///
/// `from == to` entries record events that do not change status: a stage
/// weight applied while already advancing, or a failed router call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Unix timestamp (seconds).
    pub at: u64,
    pub from: RolloutStatus,
    pub to: RolloutStatus,
    pub stage_index: usize,
    /// Candidate weight believed live when the entry was written.
    pub weight_percent: u32,
    pub reason: String,
}

// ── Rollout ────────────────────────────────────────────────────────

/// One progressive-delivery execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollout {
    pub id: RolloutId,
    pub stable_variant: Variant,
    pub candidate_variant: Variant,
    /// Immutable once the rollout is created.
    pub catalog: StageCatalog,
    pub current_stage_index: usize,
    /// When the current stage's weight was applied. `None` until the first
    /// stage weight is live.
    pub stage_entered_at: Option<u64>,
    pub status: RolloutStatus,
    pub last_applied_weight_percent: u32,
    /// Operator abort reason, if one was requested.
    pub abort_requested: Option<String>,
    /// First failed attempt of the advance currently being retried.
    pub advance_failing_since: Option<u64>,
    history: Vec<HistoryEntry>,
    /// Unix timestamp (seconds) when this rollout was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last persisted change.
    pub updated_at: u64,
    /// Bumped by the store on every compare-and-swap write.
    pub version: u64,
}

impl Rollout {
    /// Create a rollout in `Pending`. The catalog is expected to be validated.
    pub fn new(
        id: &str,
        stable_variant: &str,
        candidate_variant: &str,
        catalog: StageCatalog,
        now: u64,
    ) -> Self {
        Self {
            id: id.to_string(),
            stable_variant: stable_variant.to_string(),
            candidate_variant: candidate_variant.to_string(),
            catalog,
            current_stage_index: 0,
            stage_entered_at: None,
            status: RolloutStatus::Pending,
            last_applied_weight_percent: 0,
            abort_requested: None,
            advance_failing_since: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The audit log, oldest first.
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Move to `to`, appending a history entry. Terminal rollouts refuse.
    pub fn transition(&mut self, to: RolloutStatus, reason: &str, now: u64) -> StateResult<()> {
        if self.is_terminal() {
            return Err(StateError::Terminal(self.id.clone()));
        }
        self.history.push(HistoryEntry {
            at: now,
            from: self.status,
            to,
            stage_index: self.current_stage_index,
            weight_percent: self.last_applied_weight_percent,
            reason: reason.to_string(),
        });
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Append a same-status entry (a failure or an in-place stage change).
    pub fn note(&mut self, reason: &str, now: u64) -> StateResult<()> {
        self.transition(self.status, reason, now)
    }

    /// Full weight map sending `candidate_percent` to the candidate and the
    /// rest to the stable variant. Always sums to 100.
    pub fn weight_map(&self, candidate_percent: u32) -> BTreeMap<Variant, u32> {
        let candidate_percent = candidate_percent.min(100);
        BTreeMap::from([
            (self.candidate_variant.clone(), candidate_percent),
            (self.stable_variant.clone(), 100 - candidate_percent),
        ])
    }
}

// ── Metrics ────────────────────────────────────────────────────────

/// Point-in-time aggregate value for a named signal on one variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub metric_name: String,
    pub variant: Variant,
    pub value: f64,
    /// Unix timestamp (seconds).
    pub observed_at: u64,
}

impl MetricSample {
    pub fn new(metric_name: &str, variant: &str, value: f64, observed_at: u64) -> Self {
        Self {
            metric_name: metric_name.to_string(),
            variant: variant.to_string(),
            value,
            observed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_core::Stage;

    fn rollout() -> Rollout {
        let catalog = StageCatalog::from_stages(vec![Stage::new(0, 100, 10)]);
        Rollout::new("r-1", "blue", "green", catalog, 1000)
    }

    #[test]
    fn new_rollout_is_pending() {
        let r = rollout();
        assert_eq!(r.status, RolloutStatus::Pending);
        assert!(r.history().is_empty());
        assert_eq!(r.stage_entered_at, None);
        assert_eq!(r.version, 0);
    }

    #[test]
    fn transition_appends_history() {
        let mut r = rollout();
        r.transition(RolloutStatus::Advancing, "started", 1001).unwrap();
        r.note("stage 0 applied", 1002).unwrap();

        let history = r.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].from, RolloutStatus::Pending);
        assert_eq!(history[0].to, RolloutStatus::Advancing);
        assert_eq!(history[1].from, RolloutStatus::Advancing);
        assert_eq!(history[1].to, RolloutStatus::Advancing);
        assert_eq!(r.updated_at, 1002);
    }

    #[test]
    fn terminal_rollout_refuses_transitions() {
        let mut r = rollout();
        r.transition(RolloutStatus::RollingBack, "bad", 1001).unwrap();
        r.transition(RolloutStatus::Failed, "restored", 1002).unwrap();

        assert!(matches!(
            r.transition(RolloutStatus::Advancing, "again", 1003),
            Err(StateError::Terminal(_))
        ));
        assert_eq!(r.history().len(), 2);
    }

    #[test]
    fn weight_map_sums_to_100() {
        let r = rollout();
        let map = r.weight_map(30);
        assert_eq!(map.get("green"), Some(&30));
        assert_eq!(map.get("blue"), Some(&70));
        assert_eq!(map.values().sum::<u32>(), 100);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&RolloutStatus::RollingBack).unwrap();
        assert_eq!(json, "\"rolling_back\"");
        assert!(RolloutStatus::Failed.is_terminal());
        assert!(!RolloutStatus::Holding.is_terminal());
    }
}
