use std::path::{Path, PathBuf};

use rampart_core::ControllerConfig;
use rampart_rollout::{Clock, SystemClock};
use rampart_state::StateStore;
use tracing::debug;

pub mod abort;
pub mod inspect;
pub mod plan;

/// Settings shared by every subcommand.
pub struct Context {
    pub data_dir: PathBuf,
    pub config: ControllerConfig,
}

impl Context {
    pub fn load(data_dir: PathBuf, config_path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match config_path {
            Some(path) => ControllerConfig::from_file(path)?,
            None => ControllerConfig::default(),
        };
        debug!(?data_dir, ?config, "cli context loaded");
        Ok(Self { data_dir, config })
    }

    pub fn open_store(&self) -> anyhow::Result<StateStore> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(StateStore::open(&self.data_dir.join("rampart.redb"))?)
    }
}

pub fn now() -> u64 {
    SystemClock.now()
}
