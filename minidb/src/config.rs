//! Engine configuration, read from the environment or built in code.

use std::path::PathBuf;

use strata::wal::SyncPolicy;

pub const ENV_DATA_DIR: &str = "MINIDB_DATA_DIR";
pub const ENV_WAL_SYNC: &str = "MINIDB_WAL_SYNC";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub wal_sync: SyncPolicy,
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            wal_sync: SyncPolicy::Commit,
        }
    }

    pub fn wal_sync(mut self, policy: SyncPolicy) -> Self {
        self.wal_sync = policy;
        self
    }

    /// `MINIDB_DATA_DIR` (default `./data`) and `MINIDB_WAL_SYNC`
    /// (`always | commit | off`, default `commit`). An unrecognized sync
    /// value falls back to the default.
    pub fn from_env() -> Self {
        let data_dir = std::env::var(ENV_DATA_DIR).unwrap_or_else(|_| "./data".to_string());
        let wal_sync = std::env::var(ENV_WAL_SYNC)
            .ok()
            .and_then(|raw| parse_sync_policy(&raw))
            .unwrap_or_default();
        Self {
            data_dir: data_dir.into(),
            wal_sync,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("wal.log")
    }
}

pub fn parse_sync_policy(raw: &str) -> Option<SyncPolicy> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "always" => Some(SyncPolicy::Always),
        "commit" => Some(SyncPolicy::Commit),
        "off" => Some(SyncPolicy::Off),
        _ => None,
    }
}
