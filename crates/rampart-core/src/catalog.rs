//! Stage catalog — the ordered, validated rollout plan.
//!
//! A catalog is checked once, when a rollout is created, and is never
//! re-validated or mutated afterwards. Every tick reads it by reference.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons a catalog is rejected at rollout-start time.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CatalogError {
    #[error("catalog has no stages")]
    Empty,

    #[error("stage {position} has index {index}; indices must match stage order")]
    IndexOutOfOrder { position: usize, index: usize },

    #[error("stage {index} weight {weight}% is outside 0..=100")]
    WeightOutOfRange { index: usize, weight: u32 },

    #[error("stage {index} weight {weight}% is below previous stage weight {previous}%")]
    WeightDecreased {
        index: usize,
        weight: u32,
        previous: u32,
    },

    #[error("final stage weight is {weight}%, must be 100%")]
    FinalWeightNot100 { weight: u32 },

    #[error("stage {index} has negative soak time {secs}s")]
    NegativeSoak { index: usize, secs: i64 },

    #[error("stage {index} threshold on {metric:?} is invalid: {reason}")]
    InvalidThreshold {
        index: usize,
        metric: String,
        reason: String,
    },

    #[error("tick interval must be at least 1s")]
    ZeroTickInterval,

    #[error("tick interval {tick_secs}s must be shorter than the smallest soak time {soak_secs}s")]
    CadenceTooSlow { tick_secs: u64, soak_secs: u64 },

    #[error("stage index {0} out of range")]
    OutOfRange(usize),
}

/// Comparison applied between an observed metric value and a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = "<=")]
    AtMost,
    #[serde(rename = "<")]
    Below,
    #[serde(rename = ">=")]
    AtLeast,
    #[serde(rename = ">")]
    Above,
}

impl Comparison {
    /// Whether `value <op> limit` holds.
    pub fn holds(self, value: f64, limit: f64) -> bool {
        match self {
            Comparison::AtMost => value <= limit,
            Comparison::Below => value < limit,
            Comparison::AtLeast => value >= limit,
            Comparison::Above => value > limit,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Comparison::AtMost => "<=",
            Comparison::Below => "<",
            Comparison::AtLeast => ">=",
            Comparison::Above => ">",
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// A single validation rule: the latest sample for the metric must satisfy
/// `value <op> limit`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub op: Comparison,
    pub limit: f64,
}

impl Threshold {
    pub fn new(op: Comparison, limit: f64) -> Self {
        Self { op, limit }
    }

    pub fn holds(&self, value: f64) -> bool {
        self.op.holds(value, self.limit)
    }
}

/// One step of a rollout plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// Position in the catalog, 0-based.
    pub index: usize,
    /// Share of traffic (percent) routed to the candidate at this stage.
    pub target_weight_percent: u32,
    /// Minimum time the weight is held, with thresholds passing, before advancing.
    pub min_soak_secs: i64,
    /// Metric name → rule. An empty map always passes.
    #[serde(default)]
    pub thresholds: BTreeMap<String, Threshold>,
}

impl Stage {
    pub fn new(index: usize, target_weight_percent: u32, min_soak_secs: i64) -> Self {
        Self {
            index,
            target_weight_percent,
            min_soak_secs,
            thresholds: BTreeMap::new(),
        }
    }

    /// Add a threshold rule (builder style).
    pub fn with_threshold(mut self, metric: &str, op: Comparison, limit: f64) -> Self {
        self.thresholds
            .insert(metric.to_string(), Threshold::new(op, limit));
        self
    }

    /// Soak time as unsigned seconds. Validated catalogs never hold negatives.
    pub fn soak_secs(&self) -> u64 {
        self.min_soak_secs.max(0) as u64
    }
}

/// Ordered, immutable sequence of stages governing a rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageCatalog {
    stages: Vec<Stage>,
}

impl StageCatalog {
    /// Wrap stages without validating them. Call [`StageCatalog::validate`]
    /// before attaching the catalog to a rollout.
    pub fn from_stages(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// Build and validate in one step.
    pub fn validated(stages: Vec<Stage>) -> Result<Self, CatalogError> {
        let catalog = Self::from_stages(stages);
        catalog.validate()?;
        Ok(catalog)
    }

    /// Check the catalog invariants: at least one stage, indices in order,
    /// weights within 0..=100 and non-decreasing, final weight exactly 100,
    /// no negative soak, finite threshold limits.
    ///
    /// Equal consecutive weights are allowed (a soak extension) and an empty
    /// threshold map is a deliberate "no validation" stage.
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.stages.is_empty() {
            return Err(CatalogError::Empty);
        }

        let mut previous: Option<u32> = None;
        for (position, stage) in self.stages.iter().enumerate() {
            if stage.index != position {
                return Err(CatalogError::IndexOutOfOrder {
                    position,
                    index: stage.index,
                });
            }
            if stage.target_weight_percent > 100 {
                return Err(CatalogError::WeightOutOfRange {
                    index: stage.index,
                    weight: stage.target_weight_percent,
                });
            }
            if let Some(prev) = previous
                && stage.target_weight_percent < prev
            {
                return Err(CatalogError::WeightDecreased {
                    index: stage.index,
                    weight: stage.target_weight_percent,
                    previous: prev,
                });
            }
            if stage.min_soak_secs < 0 {
                return Err(CatalogError::NegativeSoak {
                    index: stage.index,
                    secs: stage.min_soak_secs,
                });
            }
            for (metric, threshold) in &stage.thresholds {
                if metric.trim().is_empty() {
                    return Err(CatalogError::InvalidThreshold {
                        index: stage.index,
                        metric: metric.clone(),
                        reason: "metric name is empty".to_string(),
                    });
                }
                if !threshold.limit.is_finite() {
                    return Err(CatalogError::InvalidThreshold {
                        index: stage.index,
                        metric: metric.clone(),
                        reason: format!("limit {} is not finite", threshold.limit),
                    });
                }
            }
            previous = Some(stage.target_weight_percent);
        }

        // Non-empty was checked above.
        let last = &self.stages[self.stages.len() - 1];
        if last.target_weight_percent != 100 {
            return Err(CatalogError::FinalWeightNot100 {
                weight: last.target_weight_percent,
            });
        }

        Ok(())
    }

    /// Check that ticks at `tick_secs` cannot skip past a soak boundary by
    /// more than one interval. Zero-soak stages impose no bound, but the
    /// interval itself must be non-zero.
    pub fn validate_cadence(&self, tick_secs: u64) -> Result<(), CatalogError> {
        if tick_secs == 0 {
            return Err(CatalogError::ZeroTickInterval);
        }
        match self.min_soak_secs() {
            Some(soak_secs) if tick_secs >= soak_secs => Err(CatalogError::CadenceTooSlow {
                tick_secs,
                soak_secs,
            }),
            _ => Ok(()),
        }
    }

    pub fn stage_at(&self, index: usize) -> Result<&Stage, CatalogError> {
        self.stages.get(index).ok_or(CatalogError::OutOfRange(index))
    }

    pub fn is_last_stage(&self, index: usize) -> bool {
        index + 1 == self.stages.len()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Smallest non-zero soak time across all stages.
    pub fn min_soak_secs(&self) -> Option<u64> {
        self.stages
            .iter()
            .map(Stage::soak_secs)
            .filter(|secs| *secs > 0)
            .min()
    }

    /// Union of metric names referenced by any stage.
    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .stages
            .iter()
            .flat_map(|s| s.thresholds.keys().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}
