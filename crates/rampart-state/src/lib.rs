//! rampart-state — rollout records and their embedded store.
//!
//! Backed by [redb](https://docs.rs/redb). Each [`Rollout`] is stored as a
//! JSON value keyed by its id, and carries a `version` that every write
//! bumps. Ticks use [`StateStore::compare_and_swap_rollout`] so two writers
//! can never both commit a read-modify-write of the same rollout, even
//! across process restarts.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
