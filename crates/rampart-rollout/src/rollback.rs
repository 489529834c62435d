//! Rollback executor — restores all traffic to the stable variant.
//!
//! Rollback is always a full revert (`{stable: 100, candidate: 0}`), never a
//! step back to an earlier stage. A rollout only becomes `Failed` once that
//! map has been accepted by the router.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use rampart_state::{Rollout, RolloutStatus};

use crate::error::{RolloutError, RolloutResult};
use crate::router::{TrafficRouter, apply_weights};

/// Result of a successful [`RollbackExecutor::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// Traffic restored; the rollout is now `Failed`.
    Applied,
    /// The rollout was already `Failed`; nothing was sent.
    AlreadyFailed,
}

pub struct RollbackExecutor {
    router: Arc<dyn TrafficRouter>,
    call_timeout: Duration,
}

impl RollbackExecutor {
    pub fn new(router: Arc<dyn TrafficRouter>, call_timeout: Duration) -> Self {
        Self {
            router,
            call_timeout,
        }
    }

    /// Make one restore attempt for a rollout in `RollingBack`.
    ///
    /// On router failure the rollout stays in `RollingBack` with a history
    /// entry recording the attempt, and the router error is returned for
    /// the caller to retry.
    pub async fn execute(&self, rollout: &mut Rollout, now: u64) -> RolloutResult<RollbackOutcome> {
        match rollout.status {
            RolloutStatus::Failed => return Ok(RollbackOutcome::AlreadyFailed),
            RolloutStatus::RollingBack => {}
            other => {
                return Err(RolloutError::InvalidState(format!(
                    "rollout {}: cannot execute rollback while {other}",
                    rollout.id
                )));
            }
        }

        let weights = rollout.weight_map(0);
        match apply_weights(self.router.as_ref(), &weights, self.call_timeout).await {
            Ok(()) => {
                rollout.last_applied_weight_percent = 0;
                let reason = format!("traffic restored to {}", rollout.stable_variant);
                rollout
                    .transition(RolloutStatus::Failed, &reason, now)
                    .map_err(|e| RolloutError::InvalidState(e.to_string()))?;
                info!(
                    rollout = %rollout.id,
                    stable = %rollout.stable_variant,
                    "rollback applied"
                );
                Ok(RollbackOutcome::Applied)
            }
            Err(e) => {
                rollout
                    .note(&format!("restore failed: {e}"), now)
                    .map_err(|e| RolloutError::InvalidState(e.to_string()))?;
                warn!(
                    rollout = %rollout.id,
                    weight = rollout.last_applied_weight_percent,
                    error = %e,
                    "rollback not applied, candidate weight still live"
                );
                Err(RolloutError::Router(e))
            }
        }
    }
}
