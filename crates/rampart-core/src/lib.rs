//! rampart-core — rollout plans, stage catalogs, and controller config.
//!
//! A [`StageCatalog`] is the validated, immutable sequence of stages a
//! rollout walks through. [`RolloutPlan`] and [`ControllerConfig`] are the
//! TOML-facing types read by the `rampart` CLI.

pub mod catalog;
pub mod config;

pub use catalog::{CatalogError, Comparison, Stage, StageCatalog, Threshold};
pub use config::{ConfigError, ControllerConfig, RolloutPlan, StagePlan};
