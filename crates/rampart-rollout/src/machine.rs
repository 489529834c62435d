//! Rollout state machine — decides the next action for a rollout each tick.
//!
//! ```text
//! Pending ──► Advancing ──► Holding ──► Advancing ──► … ──► Succeeded
//!                 │            │
//!                 └────────────┴──► RollingBack ──► Failed
//! ```
//!
//! [`RolloutStateMachine::evaluate`] is pure: it reads the rollout and the
//! latest samples and returns a [`Decision`]. The orchestrator then applies
//! the decision's side effects and commits the resulting state through the
//! other methods here, so a stage index is only ever committed after its
//! weight is live at the router.

use tracing::{debug, info, warn};

use rampart_core::{ControllerConfig, Stage};
use rampart_state::{MetricSample, Rollout, RolloutStatus};

use crate::error::{RolloutError, RolloutResult};
use crate::router::RouterError;

/// Next action for a rollout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Apply `weight_percent` to the candidate; on success the rollout is at
    /// `stage_index`.
    Advance {
        stage_index: usize,
        weight_percent: u32,
    },
    /// Keep the current weight; soak time has not elapsed.
    Hold,
    /// Restore all traffic to the stable variant.
    RollBack { reason: String },
    /// Every stage passed.
    Complete,
}

/// The sole authority over rollout status transitions.
#[derive(Debug, Clone)]
pub struct RolloutStateMachine {
    /// Samples older than this count as missing.
    freshness_window_secs: u64,
    /// How long a failing advance may be retried before rolling back.
    advance_retry_budget_secs: Option<u64>,
}

impl Default for RolloutStateMachine {
    fn default() -> Self {
        Self {
            freshness_window_secs: 60,
            advance_retry_budget_secs: None,
        }
    }
}

impl RolloutStateMachine {
    pub fn new(freshness_window_secs: u64) -> Self {
        Self {
            freshness_window_secs,
            ..Self::default()
        }
    }

    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            freshness_window_secs: config.freshness_window_secs,
            advance_retry_budget_secs: config.advance_retry_budget_secs,
        }
    }

    pub fn with_advance_retry_budget(mut self, secs: Option<u64>) -> Self {
        self.advance_retry_budget_secs = secs;
        self
    }

    pub fn freshness_window_secs(&self) -> u64 {
        self.freshness_window_secs
    }

    /// Decide what to do with `rollout` at time `now`.
    ///
    /// Evaluating a `Failed` rollout is a caller bug and returns
    /// `InvalidState`; a `Succeeded` rollout always yields `Complete`.
    pub fn evaluate(
        &self,
        rollout: &Rollout,
        samples: &[MetricSample],
        now: u64,
    ) -> RolloutResult<Decision> {
        match rollout.status {
            RolloutStatus::Succeeded => return Ok(Decision::Complete),
            RolloutStatus::Failed => {
                return Err(RolloutError::InvalidState(format!(
                    "rollout {} already failed",
                    rollout.id
                )));
            }
            RolloutStatus::RollingBack => {
                return Ok(Decision::RollBack {
                    reason: "restore still pending".to_string(),
                });
            }
            RolloutStatus::Pending | RolloutStatus::Advancing | RolloutStatus::Holding => {}
        }

        if let Some(reason) = &rollout.abort_requested {
            return Ok(Decision::RollBack {
                reason: format!("aborted by operator: {reason}"),
            });
        }

        if let (Some(budget), Some(since)) =
            (self.advance_retry_budget_secs, rollout.advance_failing_since)
            && now.saturating_sub(since) >= budget
        {
            return Ok(Decision::RollBack {
                reason: format!("advance not applied within {budget}s"),
            });
        }

        let current = self.stage(rollout, rollout.current_stage_index)?;

        // No weight is live yet: the first stage still has to be applied.
        let Some(entered_at) = rollout.stage_entered_at else {
            return Ok(Decision::Advance {
                stage_index: current.index,
                weight_percent: current.target_weight_percent,
            });
        };

        let failures = self.failing_thresholds(current, &rollout.candidate_variant, samples, now);
        if !failures.is_empty() {
            return Ok(Decision::RollBack {
                reason: format!("stage {} checks failed: {}", current.index, failures.join(", ")),
            });
        }

        let soaked = now.saturating_sub(entered_at);
        if soaked < current.soak_secs() {
            debug!(
                rollout = %rollout.id,
                stage = current.index,
                soaked,
                required = current.soak_secs(),
                "holding"
            );
            return Ok(Decision::Hold);
        }

        if rollout.catalog.is_last_stage(current.index) {
            return Ok(Decision::Complete);
        }

        let next = self.stage(rollout, current.index + 1)?;
        Ok(Decision::Advance {
            stage_index: next.index,
            weight_percent: next.target_weight_percent,
        })
    }

    /// Describe every threshold of `stage` that does not hold for
    /// `variant`. A metric with no fresh sample counts as failing.
    pub fn failing_thresholds(
        &self,
        stage: &Stage,
        variant: &str,
        samples: &[MetricSample],
        now: u64,
    ) -> Vec<String> {
        let mut failures = Vec::new();
        for (metric, threshold) in &stage.thresholds {
            let latest = samples
                .iter()
                .filter(|s| {
                    s.metric_name == *metric && s.variant == variant && self.is_fresh(s, now)
                })
                .max_by_key(|s| s.observed_at);

            match latest {
                None => failures.push(format!("{metric}: no fresh sample")),
                Some(sample) if !threshold.holds(sample.value) => failures.push(format!(
                    "{metric}={} violates {} {}",
                    sample.value, threshold.op, threshold.limit
                )),
                Some(_) => {}
            }
        }
        failures
    }

    fn is_fresh(&self, sample: &MetricSample, now: u64) -> bool {
        now.saturating_sub(sample.observed_at) <= self.freshness_window_secs
    }

    fn stage<'a>(&self, rollout: &'a Rollout, index: usize) -> RolloutResult<&'a Stage> {
        rollout.catalog.stage_at(index).map_err(|e| {
            RolloutError::InvalidState(format!("rollout {}: {e}", rollout.id))
        })
    }

    // ── Commits ────────────────────────────────────────────────────

    /// Mark the rollout as applying the weight for `stage_index`.
    /// Returns whether the status changed.
    pub fn begin_advance(
        &self,
        rollout: &mut Rollout,
        stage_index: usize,
        weight_percent: u32,
        now: u64,
    ) -> RolloutResult<bool> {
        match rollout.status {
            RolloutStatus::Advancing => Ok(false),
            RolloutStatus::Pending | RolloutStatus::Holding => {
                let reason = format!("applying stage {stage_index} ({weight_percent}%)");
                transition(rollout, RolloutStatus::Advancing, &reason, now)?;
                Ok(true)
            }
            other => Err(invalid(rollout, other, "advance")),
        }
    }

    /// Record that the weight for `stage_index` is live at the router.
    /// This is the last step of an advance; the stage index only moves here.
    pub fn commit_advance(
        &self,
        rollout: &mut Rollout,
        stage_index: usize,
        weight_percent: u32,
        now: u64,
    ) -> RolloutResult<()> {
        if rollout.status != RolloutStatus::Advancing {
            return Err(invalid(rollout, rollout.status, "commit advance"));
        }
        let first_apply = rollout.stage_entered_at.is_none();
        let expected = if first_apply {
            rollout.current_stage_index
        } else {
            rollout.current_stage_index + 1
        };
        if stage_index != expected {
            return Err(RolloutError::InvalidState(format!(
                "rollout {}: cannot commit stage {stage_index}, expected {expected}",
                rollout.id
            )));
        }

        rollout.current_stage_index = stage_index;
        rollout.stage_entered_at = Some(now);
        rollout.last_applied_weight_percent = weight_percent;
        rollout.advance_failing_since = None;
        note(
            rollout,
            &format!("stage {stage_index} live at {weight_percent}%"),
            now,
        )?;

        info!(
            rollout = %rollout.id,
            stage = stage_index,
            weight = weight_percent,
            "advanced"
        );
        Ok(())
    }

    /// Record a failed weight apply. The stage index and live weight stay
    /// where they were.
    pub fn record_advance_failure(
        &self,
        rollout: &mut Rollout,
        stage_index: usize,
        error: &RouterError,
        now: u64,
    ) -> RolloutResult<()> {
        if rollout.status != RolloutStatus::Advancing {
            return Err(invalid(rollout, rollout.status, "record advance failure"));
        }
        rollout.advance_failing_since.get_or_insert(now);
        note(
            rollout,
            &format!("applying stage {stage_index} failed: {error}"),
            now,
        )?;
        warn!(
            rollout = %rollout.id,
            stage = stage_index,
            weight = rollout.last_applied_weight_percent,
            error = %error,
            "advance not applied, staying at current weight"
        );
        Ok(())
    }

    /// Enter the soak phase after a weight was applied. Returns whether the
    /// status changed; repeated holds leave the rollout untouched.
    pub fn hold(&self, rollout: &mut Rollout, now: u64) -> RolloutResult<bool> {
        match rollout.status {
            RolloutStatus::Holding => Ok(false),
            RolloutStatus::Advancing => {
                let reason = format!("soaking stage {}", rollout.current_stage_index);
                transition(rollout, RolloutStatus::Holding, &reason, now)?;
                Ok(true)
            }
            other => Err(invalid(rollout, other, "hold")),
        }
    }

    /// Hand the rollout to the rollback path. Returns whether the status
    /// changed (it does not when a restore is already pending).
    pub fn begin_rollback(
        &self,
        rollout: &mut Rollout,
        reason: &str,
        now: u64,
    ) -> RolloutResult<bool> {
        match rollout.status {
            RolloutStatus::RollingBack => Ok(false),
            RolloutStatus::Pending | RolloutStatus::Advancing | RolloutStatus::Holding => {
                transition(rollout, RolloutStatus::RollingBack, reason, now)?;
                warn!(
                    rollout = %rollout.id,
                    stage = rollout.current_stage_index,
                    reason,
                    "rolling back"
                );
                Ok(true)
            }
            other => Err(invalid(rollout, other, "roll back")),
        }
    }

    /// Mark the rollout succeeded. A no-op if it already is.
    pub fn complete(&self, rollout: &mut Rollout, now: u64) -> RolloutResult<bool> {
        match rollout.status {
            RolloutStatus::Succeeded => Ok(false),
            RolloutStatus::Advancing | RolloutStatus::Holding => {
                transition(rollout, RolloutStatus::Succeeded, "all stages passed", now)?;
                info!(
                    rollout = %rollout.id,
                    weight = rollout.last_applied_weight_percent,
                    "rollout succeeded"
                );
                Ok(true)
            }
            other => Err(invalid(rollout, other, "complete")),
        }
    }
}

fn transition(
    rollout: &mut Rollout,
    to: RolloutStatus,
    reason: &str,
    now: u64,
) -> RolloutResult<()> {
    let from = rollout.status;
    rollout
        .transition(to, reason, now)
        .map_err(|e| RolloutError::InvalidState(e.to_string()))?;
    debug!(rollout = %rollout.id, %from, %to, reason, "transition");
    Ok(())
}

fn note(rollout: &mut Rollout, reason: &str, now: u64) -> RolloutResult<()> {
    let status = rollout.status;
    transition(rollout, status, reason, now)
}

fn invalid(rollout: &Rollout, status: RolloutStatus, action: &str) -> RolloutError {
    RolloutError::InvalidState(format!(
        "rollout {}: cannot {action} while {status}",
        rollout.id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_core::{Comparison, StageCatalog};

    const T0: u64 = 10_000;

    fn catalog() -> StageCatalog {
        StageCatalog::validated(vec![
            Stage::new(0, 10, 60).with_threshold("error_rate", Comparison::AtMost, 0.01),
            Stage::new(1, 100, 120).with_threshold("error_rate", Comparison::AtMost, 0.01),
        ])
        .unwrap()
    }

    fn rollout() -> Rollout {
        Rollout::new("r-1", "blue", "green", catalog(), T0)
    }

    fn healthy(at: u64) -> Vec<MetricSample> {
        vec![MetricSample::new("error_rate", "green", 0.002, at)]
    }

    /// Drive a fresh rollout through its first advance at `T0`.
    fn started(machine: &RolloutStateMachine) -> Rollout {
        let mut r = rollout();
        let d = machine.evaluate(&r, &[], T0).unwrap();
        assert_eq!(
            d,
            Decision::Advance {
                stage_index: 0,
                weight_percent: 10
            }
        );
        machine.begin_advance(&mut r, 0, 10, T0).unwrap();
        machine.commit_advance(&mut r, 0, 10, T0).unwrap();
        r
    }

    #[test]
    fn pending_advances_to_first_stage() {
        let machine = RolloutStateMachine::default();
        let r = started(&machine);
        assert_eq!(r.status, RolloutStatus::Advancing);
        assert_eq!(r.current_stage_index, 0);
        assert_eq!(r.last_applied_weight_percent, 10);
        assert_eq!(r.stage_entered_at, Some(T0));
        assert_eq!(r.history()[0].from, RolloutStatus::Pending);
    }

    #[test]
    fn holds_until_soak_elapsed() {
        let machine = RolloutStateMachine::default();
        let mut r = started(&machine);

        for offset in [0, 30, 59] {
            let now = T0 + offset;
            assert_eq!(machine.evaluate(&r, &healthy(now), now).unwrap(), Decision::Hold);
        }
        assert!(machine.hold(&mut r, T0 + 1).unwrap());
        assert!(!machine.hold(&mut r, T0 + 2).unwrap());
        assert_eq!(r.status, RolloutStatus::Holding);

        let now = T0 + 60;
        assert_eq!(
            machine.evaluate(&r, &healthy(now), now).unwrap(),
            Decision::Advance {
                stage_index: 1,
                weight_percent: 100
            }
        );
    }

    #[test]
    fn threshold_breach_rolls_back() {
        let machine = RolloutStateMachine::default();
        let r = started(&machine);

        let samples = vec![MetricSample::new("error_rate", "green", 0.05, T0 + 5)];
        match machine.evaluate(&r, &samples, T0 + 5).unwrap() {
            Decision::RollBack { reason } => assert!(reason.contains("error_rate=0.05")),
            other => panic!("expected RollBack, got {other:?}"),
        }
    }

    #[test]
    fn missing_sample_fails_closed() {
        let machine = RolloutStateMachine::default();
        let r = started(&machine);

        // Even past the soak window, absence of data is not health.
        let now = T0 + 600;
        match machine.evaluate(&r, &[], now).unwrap() {
            Decision::RollBack { reason } => assert!(reason.contains("no fresh sample")),
            other => panic!("expected RollBack, got {other:?}"),
        }
    }

    #[test]
    fn stale_sample_fails_closed() {
        let machine = RolloutStateMachine::new(60);
        let r = started(&machine);

        let now = T0 + 100;
        let stale = healthy(now - 61);
        assert!(matches!(
            machine.evaluate(&r, &stale, now).unwrap(),
            Decision::RollBack { .. }
        ));
        let fresh = healthy(now - 60);
        assert!(matches!(
            machine.evaluate(&r, &fresh, now).unwrap(),
            Decision::Advance { .. }
        ));
    }

    #[test]
    fn stable_variant_samples_are_ignored() {
        let machine = RolloutStateMachine::default();
        let r = started(&machine);

        let samples = vec![MetricSample::new("error_rate", "blue", 0.0, T0 + 60)];
        assert!(matches!(
            machine.evaluate(&r, &samples, T0 + 60).unwrap(),
            Decision::RollBack { .. }
        ));
    }

    #[test]
    fn latest_sample_wins() {
        let machine = RolloutStateMachine::default();
        let r = started(&machine);

        let now = T0 + 60;
        let samples = vec![
            MetricSample::new("error_rate", "green", 0.5, now - 10),
            MetricSample::new("error_rate", "green", 0.001, now - 1),
        ];
        assert!(matches!(
            machine.evaluate(&r, &samples, now).unwrap(),
            Decision::Advance { .. }
        ));
    }

    #[test]
    fn nan_sample_fails() {
        let machine = RolloutStateMachine::default();
        let r = started(&machine);
        let samples = vec![MetricSample::new("error_rate", "green", f64::NAN, T0 + 1)];
        assert!(matches!(
            machine.evaluate(&r, &samples, T0 + 1).unwrap(),
            Decision::RollBack { .. }
        ));
    }

    #[test]
    fn last_stage_completes() {
        let machine = RolloutStateMachine::default();
        let mut r = started(&machine);

        let now = T0 + 60;
        machine.hold(&mut r, T0 + 1).unwrap();
        machine.begin_advance(&mut r, 1, 100, now).unwrap();
        machine.commit_advance(&mut r, 1, 100, now).unwrap();

        assert_eq!(machine.evaluate(&r, &healthy(now + 119), now + 119).unwrap(), Decision::Hold);
        let done = now + 120;
        assert_eq!(machine.evaluate(&r, &healthy(done), done).unwrap(), Decision::Complete);

        machine.complete(&mut r, done).unwrap();
        assert_eq!(r.status, RolloutStatus::Succeeded);
        assert_eq!(machine.evaluate(&r, &[], done + 1).unwrap(), Decision::Complete);
    }

    #[test]
    fn empty_thresholds_advance_on_time_alone() {
        let machine = RolloutStateMachine::default();
        let catalog =
            StageCatalog::validated(vec![Stage::new(0, 50, 30), Stage::new(1, 100, 30)]).unwrap();
        let mut r = Rollout::new("r-2", "blue", "green", catalog, T0);
        machine.begin_advance(&mut r, 0, 50, T0).unwrap();
        machine.commit_advance(&mut r, 0, 50, T0).unwrap();

        assert_eq!(machine.evaluate(&r, &[], T0 + 29).unwrap(), Decision::Hold);
        assert_eq!(
            machine.evaluate(&r, &[], T0 + 30).unwrap(),
            Decision::Advance {
                stage_index: 1,
                weight_percent: 100
            }
        );
    }

    #[test]
    fn failed_rollout_is_invalid_state() {
        let machine = RolloutStateMachine::default();
        let mut r = started(&machine);
        machine.begin_rollback(&mut r, "bad", T0 + 1).unwrap();
        r.transition(RolloutStatus::Failed, "restored", T0 + 2).unwrap();

        assert!(matches!(
            machine.evaluate(&r, &[], T0 + 3),
            Err(RolloutError::InvalidState(_))
        ));
    }

    #[test]
    fn rolling_back_keeps_deciding_rollback() {
        let machine = RolloutStateMachine::default();
        let mut r = started(&machine);
        assert!(machine.begin_rollback(&mut r, "bad", T0 + 1).unwrap());
        assert!(!machine.begin_rollback(&mut r, "bad again", T0 + 2).unwrap());

        assert!(matches!(
            machine.evaluate(&r, &healthy(T0 + 3), T0 + 3).unwrap(),
            Decision::RollBack { .. }
        ));
        assert_eq!(r.history().len(), 3);
    }

    #[test]
    fn abort_request_rolls_back() {
        let machine = RolloutStateMachine::default();
        let mut r = started(&machine);
        r.abort_requested = Some("bad deploy".to_string());

        match machine.evaluate(&r, &healthy(T0 + 1), T0 + 1).unwrap() {
            Decision::RollBack { reason } => assert!(reason.contains("bad deploy")),
            other => panic!("expected RollBack, got {other:?}"),
        }
    }

    #[test]
    fn failed_advance_keeps_stage_and_weight() {
        let machine = RolloutStateMachine::default();
        let mut r = started(&machine);
        machine.hold(&mut r, T0 + 1).unwrap();

        let now = T0 + 60;
        machine.begin_advance(&mut r, 1, 100, now).unwrap();
        machine
            .record_advance_failure(&mut r, 1, &RouterError::Rejected("503".into()), now)
            .unwrap();

        assert_eq!(r.status, RolloutStatus::Advancing);
        assert_eq!(r.current_stage_index, 0);
        assert_eq!(r.last_applied_weight_percent, 10);
        assert_eq!(r.advance_failing_since, Some(now));

        // The next tick asks for the same advance again.
        assert_eq!(
            machine.evaluate(&r, &healthy(now + 10), now + 10).unwrap(),
            Decision::Advance {
                stage_index: 1,
                weight_percent: 100
            }
        );
    }

    #[test]
    fn advance_retry_budget_converts_to_rollback() {
        let machine = RolloutStateMachine::default().with_advance_retry_budget(Some(300));
        let mut r = started(&machine);

        let now = T0 + 60;
        machine
            .record_advance_failure(&mut r, 1, &RouterError::Rejected("503".into()), now)
            .unwrap();

        let later = now + 299;
        assert!(matches!(
            machine.evaluate(&r, &healthy(later), later).unwrap(),
            Decision::Advance { .. }
        ));
        let expired = now + 300;
        assert!(matches!(
            machine.evaluate(&r, &healthy(expired), expired).unwrap(),
            Decision::RollBack { .. }
        ));
    }

    #[test]
    fn commit_rejects_skipped_stage() {
        let catalog = StageCatalog::validated(vec![
            Stage::new(0, 10, 1),
            Stage::new(1, 50, 1),
            Stage::new(2, 100, 1),
        ])
        .unwrap();
        let machine = RolloutStateMachine::default();
        let mut r = Rollout::new("r-3", "blue", "green", catalog, T0);
        machine.begin_advance(&mut r, 0, 10, T0).unwrap();
        machine.commit_advance(&mut r, 0, 10, T0).unwrap();

        assert!(matches!(
            machine.commit_advance(&mut r, 2, 100, T0 + 1),
            Err(RolloutError::InvalidState(_))
        ));
        assert_eq!(r.current_stage_index, 0);
    }

    #[test]
    fn complete_from_pending_is_invalid() {
        let machine = RolloutStateMachine::default();
        let mut r = rollout();
        assert!(matches!(
            machine.complete(&mut r, T0),
            Err(RolloutError::InvalidState(_))
        ));
        assert!(r.history().is_empty());
    }
}
