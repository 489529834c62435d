//! Metric source interface — read-only access to aggregated signals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use thiserror::Error;

use rampart_state::MetricSample;

use crate::BoxFuture;

/// The metrics backend could not answer. Treated as "no fresh sample".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("metric source unavailable: {0}")]
    Unavailable(String),
}

/// Supplies point-in-time metric values scoped to a variant.
pub trait MetricSource: Send + Sync {
    /// Samples for `variant` whose name is in `metric_names`, observed at or
    /// after `since` (Unix seconds).
    fn query<'a>(
        &'a self,
        variant: &'a str,
        metric_names: &'a [String],
        since: u64,
    ) -> BoxFuture<'a, Result<Vec<MetricSample>, SourceError>>;
}

/// In-memory source holding the latest sample per (metric, variant).
#[derive(Debug)]
pub struct StaticMetricSource {
    samples: RwLock<Vec<MetricSample>>,
    available: AtomicBool,
}

impl Default for StaticMetricSource {
    fn default() -> Self {
        Self {
            samples: RwLock::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl StaticMetricSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the sample for (metric, variant).
    pub fn set(&self, metric: &str, variant: &str, value: f64, observed_at: u64) {
        let mut samples = self.samples.write().unwrap_or_else(PoisonError::into_inner);
        samples.retain(|s| !(s.metric_name == metric && s.variant == variant));
        samples.push(MetricSample::new(metric, variant, value, observed_at));
    }


    /// Make every query fail with `Unavailable` until switched back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl MetricSource for StaticMetricSource {
    fn query<'a>(
        &'a self,
        variant: &'a str,
        metric_names: &'a [String],
        since: u64,
    ) -> BoxFuture<'a, Result<Vec<MetricSample>, SourceError>> {
        Box::pin(async move {
            if !self.available.load(Ordering::SeqCst) {
                return Err(SourceError::Unavailable("backend offline".to_string()));
            }
            let samples = self.samples.read().unwrap_or_else(PoisonError::into_inner);
            Ok(samples
                .iter()
                .filter(|s| {
                    s.variant == variant
                        && s.observed_at >= since
                        && metric_names.iter().any(|m| *m == s.metric_name)
                })
                .cloned()
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn query_filters_by_variant_name_and_age() {
        let source = StaticMetricSource::new();
        source.set("error_rate", "green", 0.002, 1000);
        source.set("error_rate", "blue", 0.001, 1000);
        source.set("latency_p99", "green", 120.0, 900);

        let names = vec!["error_rate".to_string(), "latency_p99".to_string()];
        let samples = source.query("green", &names, 950).await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].metric_name, "error_rate");
    }

    #[tokio::test]
    async fn set_replaces_previous_sample() {
        let source = StaticMetricSource::new();
        source.set("error_rate", "green", 0.002, 1000);
        source.set("error_rate", "green", 0.05, 1010);

        let names = vec!["error_rate".to_string()];
        let samples = source.query("green", &names, 0).await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, 0.05);
    }

    #[tokio::test]
    async fn unavailable_backend_errors() {
        let source = StaticMetricSource::new();
        source.set_available(false);
        let names = vec!["error_rate".to_string()];
        assert!(matches!(
            source.query("green", &names, 0).await,
            Err(SourceError::Unavailable(_))
        ));
    }
}
