//! redb table definitions for the rollout state store.

use redb::TableDefinition;

/// Rollout records keyed by rollout id, JSON-serialized.
pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");
