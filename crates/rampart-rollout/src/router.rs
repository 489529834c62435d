//! Traffic router interface — the only way the controller moves traffic.
//!
//! Every call carries a complete weight map summing to 100, so re-sending
//! the same map is always safe.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use rampart_state::Variant;

use crate::BoxFuture;

/// Variant → percent of traffic.
pub type WeightMap = BTreeMap<Variant, u32>;

/// A failed weight apply. Always retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    #[error("router rejected weights: {0}")]
    Rejected(String),

    #[error("router unreachable: {0}")]
    Unreachable(String),

    #[error("router call timed out after {0:?}")]
    Timeout(Duration),

    #[error("weight map sums to {0}, expected 100")]
    InvalidWeights(u32),
}

/// Data plane that splits traffic between variants.
pub trait TrafficRouter: Send + Sync {
    /// Apply the full weight map atomically.
    fn set_weights<'a>(&'a self, weights: &'a WeightMap) -> BoxFuture<'a, Result<(), RouterError>>;
}

/// Send `weights` to the router, bounded by `timeout`.
pub async fn apply_weights(
    router: &dyn TrafficRouter,
    weights: &WeightMap,
    timeout: Duration,
) -> Result<(), RouterError> {
    let total: u32 = weights.values().sum();
    if total != 100 {
        return Err(RouterError::InvalidWeights(total));
    }
    match tokio::time::timeout(timeout, router.set_weights(weights)).await {
        Ok(result) => result,
        Err(_) => Err(RouterError::Timeout(timeout)),
    }
}

/// In-memory router that records every applied map.
///
/// Can be scripted to fail the next N calls, fail every call, or stall for
/// a fixed delay before answering.
#[derive(Debug, Default)]
pub struct RecordingRouter {
    applied: Mutex<Vec<WeightMap>>,
    calls: AtomicU32,
    fail_next: AtomicU32,
    fail_always: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl RecordingRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls with `RouterError::Unreachable`.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_always(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    /// Sleep for `delay` inside every call before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Every successfully applied map, oldest first.
    pub fn applied(&self) -> Vec<WeightMap> {
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_applied(&self) -> Option<WeightMap> {
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    /// Total calls, including failed ones.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        if self.fail_always.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl TrafficRouter for RecordingRouter {
    fn set_weights<'a>(&'a self, weights: &'a WeightMap) -> BoxFuture<'a, Result<(), RouterError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.should_fail() {
                return Err(RouterError::Unreachable("scripted failure".to_string()));
            }
            debug!(?weights, "weights applied");
            self.applied
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(weights.clone());
            Ok(())
        })
    }
}
