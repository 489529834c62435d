//! Rollout controller error types.

use thiserror::Error;

use rampart_core::CatalogError;
use rampart_state::StateError;

use crate::router::RouterError;

/// Errors surfaced by the rollout controller.
///
/// Router and metric failures are absorbed by the orchestrator into
/// history, events, and logs; they surface here only from the lower-level
/// building blocks.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("invalid catalog: {0}")]
    InvalidCatalog(#[from] CatalogError),

    #[error("invalid rollout request: {0}")]
    InvalidRequest(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("rollout not found: {0}")]
    NotFound(String),

    #[error("router error: {0}")]
    Router(#[from] RouterError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type RolloutResult<T> = Result<T, RolloutError>;
