//! Rampart progressive delivery — staged traffic shifting with health gates.
//!
//! Moves traffic from a stable variant to a candidate in the steps given by
//! a [`StageCatalog`](rampart_core::StageCatalog), checking metric
//! thresholds while each step soaks, and restoring all traffic to the
//! stable variant when a check fails or an operator aborts.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator (one serialized tick per rollout, rollouts in parallel)
//!   ├── MetricSource::query()     ← candidate samples, fail-closed
//!   ├── RolloutStateMachine       ← evaluate() → Advance | Hold | RollBack | Complete
//!   ├── TrafficRouter::set_weights()  ← full weight maps, retried with backoff
//!   ├── RollbackExecutor          ← {stable: 100, candidate: 0}, then Failed
//!   ├── StateStore (CAS per write)
//!   └── EventSink                 ← one event per history entry
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod backoff;
pub mod clock;
pub mod error;
pub mod events;
pub mod machine;
pub mod orchestrator;
pub mod rollback;
pub mod router;
pub mod source;

/// Boxed future returned by collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use backoff::Backoff;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{RolloutError, RolloutResult};
pub use events::{BroadcastSink, EventSink, RolloutEvent, TracingSink};
pub use machine::{Decision, RolloutStateMachine};
pub use orchestrator::{Orchestrator, TickOutcome, prepare_rollout, request_abort};
pub use rollback::{RollbackExecutor, RollbackOutcome};
pub use router::{RecordingRouter, RouterError, TrafficRouter, WeightMap};
pub use source::{MetricSource, SourceError, StaticMetricSource};
