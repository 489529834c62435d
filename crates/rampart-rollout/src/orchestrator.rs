//! Orchestrator — drives rollouts from creation to a terminal status.
//!
//! Each tick loads the rollout, reads candidate metrics, asks the state
//! machine for a decision, performs the side effects (router calls,
//! rollback), and persists every state change with a compare-and-swap.
//! Ticks for the same rollout are serialized behind a per-rollout lock;
//! ticks for different rollouts run in parallel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use rampart_core::{CatalogError, ControllerConfig, StageCatalog};
use rampart_state::{MetricSample, Rollout, RolloutId, RolloutStatus, StateError, StateStore};

use crate::backoff::Backoff;
use crate::clock::{Clock, SystemClock};
use crate::error::{RolloutError, RolloutResult};
use crate::events::{EventSink, RolloutEvent, TracingSink};
use crate::machine::{Decision, RolloutStateMachine};
use crate::rollback::RollbackExecutor;
use crate::router::{TrafficRouter, apply_weights};
use crate::source::{MetricSource, SourceError};

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A stage weight is now live.
    Advanced {
        stage_index: usize,
        weight_percent: u32,
    },
    /// The router refused the stage weight; the previous weight stays live.
    AdvanceFailed { stage_index: usize },
    /// Soaking the current stage.
    Held,
    /// Traffic restored to stable; the rollout is `Failed`.
    RolledBack,
    /// The restore did not go through; retried next tick.
    RollbackPending,
    /// The rollout is `Succeeded`.
    Completed,
    /// Nothing was decided (metrics timed out or a concurrent writer won).
    Deferred,
    /// The rollout was already terminal; nothing to do.
    Idle(RolloutStatus),
}

impl TickOutcome {
    /// Whether the rollout needs no further ticks.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TickOutcome::RolledBack | TickOutcome::Completed | TickOutcome::Idle(_)
        )
    }
}

/// Validate a rollout request and build the `Pending` record for it.
///
/// Checks the catalog invariants, that `tick_interval_secs` is shorter than
/// the smallest non-zero soak, and that the two variants are distinct.
pub fn prepare_rollout(
    id: &str,
    stable: &str,
    candidate: &str,
    catalog: StageCatalog,
    tick_interval_secs: u64,
    now: u64,
) -> RolloutResult<Rollout> {
    catalog.validate()?;
    catalog.validate_cadence(tick_interval_secs)?;

    if stable.trim().is_empty() || candidate.trim().is_empty() {
        return Err(RolloutError::InvalidRequest(
            "variant names must not be empty".to_string(),
        ));
    }
    if stable == candidate {
        return Err(RolloutError::InvalidRequest(format!(
            "stable and candidate are both {stable:?}"
        )));
    }

    Ok(Rollout::new(id, stable, candidate, catalog, now))
}

/// Record an operator abort on a stored rollout.
///
/// The rollback itself happens on the next tick, through the same path as a
/// threshold failure. Aborting twice keeps the first reason.
pub fn request_abort(
    state: &StateStore,
    id: &str,
    reason: &str,
    now: u64,
) -> RolloutResult<Rollout> {
    let mut rollout = state
        .get_rollout(id)?
        .ok_or_else(|| RolloutError::NotFound(id.to_string()))?;
    if rollout.is_terminal() {
        return Err(RolloutError::InvalidState(format!(
            "rollout {id} is already {}",
            rollout.status
        )));
    }
    if rollout.abort_requested.is_some() {
        return Ok(rollout);
    }

    rollout.abort_requested = Some(reason.to_string());
    rollout
        .note(&format!("abort requested: {reason}"), now)
        .map_err(|e| RolloutError::InvalidState(e.to_string()))?;
    let expected = rollout.version;
    state.compare_and_swap_rollout(&mut rollout, expected)?;
    info!(rollout = %id, reason, "abort requested");
    Ok(rollout)
}

/// Drives rollouts through the state machine.
pub struct Orchestrator {
    state: StateStore,
    source: Arc<dyn MetricSource>,
    router: Arc<dyn TrafficRouter>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: ControllerConfig,
    machine: RolloutStateMachine,
    rollback: RollbackExecutor,
    /// Per-rollout tick locks: rollout_id → lock.
    locks: Mutex<HashMap<RolloutId, Arc<tokio::sync::Mutex<()>>>>,
    next_seq: AtomicU64,
}

impl Orchestrator {
    /// Create an orchestrator with the system clock and a tracing event sink.
    pub fn new(
        state: StateStore,
        source: Arc<dyn MetricSource>,
        router: Arc<dyn TrafficRouter>,
        config: ControllerConfig,
    ) -> Self {
        let machine = RolloutStateMachine::from_config(&config);
        let rollback = RollbackExecutor::new(router.clone(), config.call_timeout());
        Self {
            state,
            source,
            router,
            events: Arc::new(TracingSink),
            clock: Arc::new(SystemClock),
            config,
            machine,
            rollback,
            locks: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    // ── Rollout lifecycle ──────────────────────────────────────────

    /// Validate the request, create a `Pending` rollout, and persist it.
    pub fn start_rollout(
        &self,
        stable: &str,
        candidate: &str,
        catalog: StageCatalog,
    ) -> RolloutResult<Rollout> {
        let now = self.clock.now();
        // Validate before picking an id so bad requests never touch the store.
        let template = prepare_rollout(
            "",
            stable,
            candidate,
            catalog,
            self.config.tick_interval_secs,
            now,
        )?;

        loop {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            let mut rollout = template.clone();
            rollout.id = format!("{candidate}-{now}-{seq}");
            match self.state.insert_rollout(&rollout) {
                Ok(()) => {
                    info!(
                        rollout = %rollout.id,
                        stable,
                        candidate,
                        stages = rollout.catalog.len(),
                        "rollout created"
                    );
                    return Ok(rollout);
                }
                Err(StateError::AlreadyExists(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn get_rollout(&self, id: &str) -> RolloutResult<Rollout> {
        self.state
            .get_rollout(id)?
            .ok_or_else(|| RolloutError::NotFound(id.to_string()))
    }

    pub fn list_rollouts(&self) -> RolloutResult<Vec<Rollout>> {
        Ok(self.state.list_rollouts()?)
    }

    /// Operator cancellation. Traffic is restored by the next tick.
    pub async fn abort_rollout(&self, id: &str, reason: &str) -> RolloutResult<Rollout> {
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            self.abort_locked(id, reason)
        };
        if matches!(
            result,
            Err(RolloutError::NotFound(_) | RolloutError::InvalidState(_))
        ) {
            self.release_lock(id, lock);
        }
        result
    }

    fn abort_locked(&self, id: &str, reason: &str) -> RolloutResult<Rollout> {
        let before = self.get_rollout(id)?.history().len();
        let rollout = request_abort(&self.state, id, reason, self.clock.now())?;
        self.emit_from(&rollout, before);
        Ok(rollout)
    }

    // ── Ticks ──────────────────────────────────────────────────────

    /// Run one evaluation for `id`.
    ///
    /// Router and metric failures are absorbed into the outcome, history,
    /// and events. Errors returned here are `NotFound`, `InvalidState`, or
    /// store failures other than a version conflict.
    pub async fn tick(&self, id: &str) -> RolloutResult<TickOutcome> {
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            self.tick_serialized(id).await
        };
        let finished = match &result {
            Ok(outcome) => outcome.is_final(),
            Err(e) => matches!(e, RolloutError::NotFound(_)),
        };
        if finished {
            self.release_lock(id, lock);
        }
        result
    }

    async fn tick_serialized(&self, id: &str) -> RolloutResult<TickOutcome> {
        let mut rollout = self.get_rollout(id)?;
        if rollout.is_terminal() {
            return Ok(TickOutcome::Idle(rollout.status));
        }
        let mut emitted = rollout.history().len();

        let result = self.tick_locked(&mut rollout, &mut emitted).await;
        match result {
            Err(RolloutError::State(StateError::Conflict { .. })) => {
                warn!(rollout = %id, "concurrent write detected, tick discarded");
                Ok(TickOutcome::Deferred)
            }
            other => other,
        }
    }

    async fn tick_locked(
        &self,
        rollout: &mut Rollout,
        emitted: &mut usize,
    ) -> RolloutResult<TickOutcome> {
        let now = self.clock.now();

        let samples = match self.fetch_samples(rollout, now).await {
            Some(samples) => samples,
            None => return Ok(TickOutcome::Deferred),
        };

        let decision = self.machine.evaluate(rollout, &samples, now)?;
        debug!(rollout = %rollout.id, ?decision, status = %rollout.status, "evaluated");

        match decision {
            Decision::Advance {
                stage_index,
                weight_percent,
            } => self.advance(rollout, emitted, stage_index, weight_percent, now).await,
            Decision::Hold => {
                if self.machine.hold(rollout, now)? {
                    self.persist(rollout, emitted)?;
                }
                Ok(TickOutcome::Held)
            }
            Decision::RollBack { reason } => {
                if self.machine.begin_rollback(rollout, &reason, now)? {
                    // Persist before touching the router so a restart resumes the restore.
                    self.persist(rollout, emitted)?;
                }
                self.roll_back(rollout, emitted).await
            }
            Decision::Complete => {
                if self.machine.complete(rollout, now)? {
                    self.persist(rollout, emitted)?;
                }
                Ok(TickOutcome::Completed)
            }
        }
    }

    /// Read candidate samples for the current stage's thresholds.
    ///
    /// `None` means the query timed out and the tick should be retried
    /// later without any state change. An unavailable backend yields an
    /// empty sample set, which the state machine treats as failing.
    async fn fetch_samples(&self, rollout: &Rollout, now: u64) -> Option<Vec<MetricSample>> {
        let needs_metrics = rollout.stage_entered_at.is_some()
            && rollout.abort_requested.is_none()
            && matches!(
                rollout.status,
                RolloutStatus::Advancing | RolloutStatus::Holding
            );
        if !needs_metrics {
            return Some(Vec::new());
        }

        let names: Vec<String> = match rollout.catalog.stage_at(rollout.current_stage_index) {
            Ok(stage) => stage.thresholds.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        if names.is_empty() {
            return Some(Vec::new());
        }

        let since = now.saturating_sub(self.machine.freshness_window_secs());
        let query = self
            .source
            .query(&rollout.candidate_variant, &names, since);
        match tokio::time::timeout(self.config.call_timeout(), query).await {
            Ok(Ok(samples)) => Some(samples),
            Ok(Err(SourceError::Unavailable(msg))) => {
                warn!(rollout = %rollout.id, error = %msg, "metric source unavailable, failing closed");
                Some(Vec::new())
            }
            Err(_) => {
                warn!(
                    rollout = %rollout.id,
                    timeout_ms = self.config.call_timeout_ms,
                    "metric query timed out, deferring tick"
                );
                None
            }
        }
    }

    async fn advance(
        &self,
        rollout: &mut Rollout,
        emitted: &mut usize,
        stage_index: usize,
        weight_percent: u32,
        now: u64,
    ) -> RolloutResult<TickOutcome> {
        if self
            .machine
            .begin_advance(rollout, stage_index, weight_percent, now)?
        {
            self.persist(rollout, emitted)?;
        }

        let weights = rollout.weight_map(weight_percent);
        let mut backoff = self.backoff();
        let attempts = self.config.router_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match apply_weights(self.router.as_ref(), &weights, self.config.call_timeout()).await {
                Ok(()) => {
                    self.machine
                        .commit_advance(rollout, stage_index, weight_percent, self.clock.now())?;
                    self.persist(rollout, emitted)?;
                    return Ok(TickOutcome::Advanced {
                        stage_index,
                        weight_percent,
                    });
                }
                Err(e) => {
                    debug!(rollout = %rollout.id, attempt, error = %e, "weight apply failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                }
            }
        }

        if let Some(e) = last_error {
            self.machine
                .record_advance_failure(rollout, stage_index, &e, self.clock.now())?;
            self.persist(rollout, emitted)?;
        }
        Ok(TickOutcome::AdvanceFailed { stage_index })
    }

    async fn roll_back(
        &self,
        rollout: &mut Rollout,
        emitted: &mut usize,
    ) -> RolloutResult<TickOutcome> {
        let mut backoff = self.backoff();
        let attempts = self.config.router_attempts.max(1);

        for attempt in 1..=attempts {
            match self.rollback.execute(rollout, self.clock.now()).await {
                Ok(_) => {
                    self.persist(rollout, emitted)?;
                    return Ok(TickOutcome::RolledBack);
                }
                Err(RolloutError::Router(e)) => {
                    debug!(rollout = %rollout.id, attempt, error = %e, "restore attempt failed");
                    if attempt < attempts {
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        // Keep the failed attempts in history; the next tick tries again.
        self.persist(rollout, emitted)?;
        Ok(TickOutcome::RollbackPending)
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.config.backoff_base(), self.config.backoff_max())
    }

    /// Compare-and-swap the rollout, then emit events for new history.
    fn persist(&self, rollout: &mut Rollout, emitted: &mut usize) -> RolloutResult<()> {
        let expected = rollout.version;
        self.state.compare_and_swap_rollout(rollout, expected)?;
        self.emit_from(rollout, *emitted);
        *emitted = rollout.history().len();
        Ok(())
    }

    fn emit_from(&self, rollout: &Rollout, from: usize) {
        for entry in rollout.history().iter().skip(from) {
            self.events.emit(&RolloutEvent::from_entry(&rollout.id, entry));
        }
    }

    fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(id.to_string()).or_default().clone()
    }

    /// Forget the lock of a rollout that needs no more ticks. Kept while any
    /// other caller still holds or waits on it (map + `lock` = 2 refs).
    fn release_lock(&self, id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = locks.get(id)
            && Arc::ptr_eq(current, &lock)
            && Arc::strong_count(&lock) == 2
        {
            locks.remove(id);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    // ── Control loops ──────────────────────────────────────────────

    /// Tick `id` every `tick_interval` until it is terminal or `shutdown`
    /// fires. Returns the last known status.
    pub async fn drive(
        &self,
        id: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> RolloutResult<RolloutStatus> {
        if self.config.tick_interval_secs == 0 {
            return Err(CatalogError::ZeroTickInterval.into());
        }
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(rollout = %id, interval_secs = self.config.tick_interval_secs, "driver starting");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick(id).await {
                        Ok(outcome) if outcome.is_final() => {
                            let status = self.get_rollout(id)?.status;
                            info!(rollout = %id, %status, "driver finished");
                            return Ok(status);
                        }
                        Ok(outcome) => debug!(rollout = %id, ?outcome, "tick done"),
                        Err(e @ (RolloutError::InvalidState(_) | RolloutError::NotFound(_))) => {
                            return Err(e);
                        }
                        Err(e) => error!(rollout = %id, error = %e, "tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    debug!(rollout = %id, "driver shutting down");
                    return Ok(self.get_rollout(id)?.status);
                }
            }
        }
    }

    /// Run [`Orchestrator::drive`] for `id` on its own task.
    pub fn spawn_driver(
        self: &Arc<Self>,
        id: &str,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<RolloutResult<RolloutStatus>> {
        let this = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move { this.drive(&id, shutdown).await })
    }

    /// Spawn a driver for every persisted non-terminal rollout, e.g. after a
    /// restart.
    pub fn resume_active(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> RolloutResult<Vec<(RolloutId, JoinHandle<RolloutResult<RolloutStatus>>)>> {
        let active = self.state.list_active_rollouts()?;
        info!(count = active.len(), "resuming active rollouts");
        Ok(active
            .into_iter()
            .map(|r| {
                let handle = self.spawn_driver(&r.id, shutdown.clone());
                (r.id, handle)
            })
            .collect())
    }
}
