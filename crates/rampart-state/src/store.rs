//! StateStore — redb-backed rollout persistence.
//!
//! Rollouts are JSON-serialized into redb's `&[u8]` value columns. Writes
//! after creation go through [`StateStore::compare_and_swap_rollout`],
//! which checks the stored `version` inside the same write transaction.
//! The store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Store a new rollout. Fails if the id is already taken.
    pub fn insert_rollout(&self, rollout: &Rollout) -> StateResult<()> {
        let value = serde_json::to_vec(rollout).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            if table
                .get(rollout.id.as_str())
                .map_err(map_err!(Read))?
                .is_some()
            {
                return Err(StateError::AlreadyExists(rollout.id.clone()));
            }
            table
                .insert(rollout.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(rollout = %rollout.id, "rollout stored");
        Ok(())
    }

    /// Get a rollout by id.
    pub fn get_rollout(&self, id: &str) -> StateResult<Option<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let rollout: Rollout =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(rollout))
            }
            None => Ok(None),
        }
    }

    /// List all rollouts, ordered by id.
    pub fn list_rollouts(&self) -> StateResult<Vec<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let rollout: Rollout =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(rollout);
        }
        Ok(results)
    }

    /// List rollouts that have not reached a terminal status.
    pub fn list_active_rollouts(&self) -> StateResult<Vec<Rollout>> {
        Ok(self
            .list_rollouts()?
            .into_iter()
            .filter(|r| !r.is_terminal())
            .collect())
    }

    /// Write `rollout` if the stored version still equals `expected_version`.
    ///
    /// On success the stored record carries `expected_version + 1`, and so
    /// does `rollout`. On any error nothing is written and `rollout` keeps
    /// its version.
    pub fn compare_and_swap_rollout(
        &self,
        rollout: &mut Rollout,
        expected_version: u64,
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let found = match table.get(rollout.id.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let stored: Rollout =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    stored.version
                }
                None => return Err(StateError::NotFound(rollout.id.clone())),
            };
            if found != expected_version {
                return Err(StateError::Conflict {
                    id: rollout.id.clone(),
                    expected: expected_version,
                    found,
                });
            }

            let mut record = rollout.clone();
            record.version = expected_version + 1;
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table
                .insert(rollout.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        rollout.version = expected_version + 1;
        debug!(rollout = %rollout.id, version = rollout.version, "rollout updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_core::{Comparison, Stage, StageCatalog};

    fn test_rollout(id: &str) -> Rollout {
        let catalog = StageCatalog::validated(vec![
            Stage::new(0, 10, 60).with_threshold("error_rate", Comparison::AtMost, 0.01),
            Stage::new(1, 100, 120),
        ])
        .unwrap();
        Rollout::new(id, "blue", "green", catalog, 1000)
    }

    #[test]
    fn rollout_insert_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let rollout = test_rollout("r-1");

        store.insert_rollout(&rollout).unwrap();
        let retrieved = store.get_rollout("r-1").unwrap();

        assert_eq!(retrieved, Some(rollout));
    }

    #[test]
    fn duplicate_insert_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_rollout(&test_rollout("r-1")).unwrap();

        assert!(matches!(
            store.insert_rollout(&test_rollout("r-1")),
            Err(StateError::AlreadyExists(_))
        ));
    }

    #[test]
    fn get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_rollout("nope").unwrap().is_none());
    }

    #[test]
    fn cas_bumps_version() {
        let store = StateStore::open_in_memory().unwrap();
        let mut rollout = test_rollout("r-1");
        store.insert_rollout(&rollout).unwrap();

        rollout
            .transition(RolloutStatus::Advancing, "started", 1001)
            .unwrap();
        store.compare_and_swap_rollout(&mut rollout, 0).unwrap();
        assert_eq!(rollout.version, 1);

        let stored = store.get_rollout("r-1").unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.status, RolloutStatus::Advancing);
        assert_eq!(stored.history().len(), 1);
    }

    #[test]
    fn cas_rejects_stale_version() {
        let store = StateStore::open_in_memory().unwrap();
        let rollout = test_rollout("r-1");
        store.insert_rollout(&rollout).unwrap();

        let mut first = rollout.clone();
        let mut second = rollout;
        store.compare_and_swap_rollout(&mut first, 0).unwrap();

        second
            .transition(RolloutStatus::RollingBack, "late writer", 1002)
            .unwrap();
        let err = store.compare_and_swap_rollout(&mut second, 0).unwrap_err();
        assert!(matches!(
            err,
            StateError::Conflict {
                expected: 0,
                found: 1,
                ..
            }
        ));

        // The losing write left no trace.
        let stored = store.get_rollout("r-1").unwrap().unwrap();
        assert_eq!(stored.status, RolloutStatus::Pending);
    }

    #[test]
    fn cas_on_missing_rollout_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let mut rollout = test_rollout("ghost");
        assert!(matches!(
            store.compare_and_swap_rollout(&mut rollout, 0),
            Err(StateError::NotFound(_))
        ));
        assert_eq!(rollout.version, 0);
    }

    #[test]
    fn failed_cas_keeps_caller_version() {
        let store = StateStore::open_in_memory().unwrap();
        let mut rollout = test_rollout("r-1");
        store.insert_rollout(&rollout).unwrap();
        store.compare_and_swap_rollout(&mut rollout.clone(), 0).unwrap();

        rollout
            .transition(RolloutStatus::Advancing, "stale", 1001)
            .unwrap();
        assert!(store.compare_and_swap_rollout(&mut rollout, 0).is_err());
        assert_eq!(rollout.version, 0);

        // The caller can retry from the stored version once it reloads.
        let mut fresh = store.get_rollout("r-1").unwrap().unwrap();
        store.compare_and_swap_rollout(&mut fresh, 1).unwrap();
        assert_eq!(fresh.version, 2);
        assert_eq!(store.get_rollout("r-1").unwrap().unwrap().version, 2);
    }

    #[test]
    fn list_active_skips_terminal() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_rollout(&test_rollout("r-1")).unwrap();

        let mut done = test_rollout("r-2");
        done.transition(RolloutStatus::RollingBack, "bad", 1001)
            .unwrap();
        done.transition(RolloutStatus::Failed, "restored", 1002)
            .unwrap();
        store.insert_rollout(&done).unwrap();

        assert_eq!(store.list_rollouts().unwrap().len(), 2);
        let active = store.list_active_rollouts().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "r-1");
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.insert_rollout(&test_rollout("r-1")).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let rollout = store.get_rollout("r-1").unwrap();
        assert!(rollout.is_some());
        assert_eq!(rollout.unwrap().candidate_variant, "green");
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_rollouts().unwrap().is_empty());
        assert!(store.list_active_rollouts().unwrap().is_empty());
    }
}
