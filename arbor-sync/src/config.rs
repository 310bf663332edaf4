//! Engine configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::storage::StoreConfig;

/// What replay does with a journal record it cannot decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayPolicy {
    /// Stop startup with [`EngineError::CorruptRecord`].
    #[default]
    Abort,
    /// Log the record and continue with the next one.
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// RocksDB journal directory (None = in-memory journal)
    pub journal_dir: Option<PathBuf>,
    /// Rules file (None = allow everything)
    pub rules_path: Option<PathBuf>,
    /// Committed events between snapshots (0 = only on demand)
    pub snapshot_interval: u64,
    /// Outbound messages buffered per connection before the oldest drop
    pub outbound_capacity: usize,
    /// Depth of the sequencer and apply channels
    pub pipeline_capacity: usize,
    pub replay_policy: ReplayPolicy,
    /// Prefix for every outbound `path`/`parent`
    pub base_path: String,
    /// Sync the journal after every append
    pub sync_writes: bool,
    /// Drop journal records covered by a stored snapshot
    pub truncate_on_snapshot: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            journal_dir: None,
            rules_path: None,
            snapshot_interval: 100,
            outbound_capacity: 256,
            pipeline_capacity: 1024,
            replay_policy: ReplayPolicy::Abort,
            base_path: String::new(),
            sync_writes: true,
            truncate_on_snapshot: true,
        }
    }
}

impl EngineConfig {
    /// Config for testing (in-memory journal, small queues, no automatic
    /// snapshots).
    pub fn for_testing() -> Self {
        Self {
            snapshot_interval: 0,
            outbound_capacity: 64,
            pipeline_capacity: 64,
            ..Self::default()
        }
    }

    /// Load a JSON config file. Missing keys take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&text).map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))
    }

    /// RocksDB settings for `journal_dir`, if one is configured.
    pub fn store_config(&self) -> Option<StoreConfig> {
        self.journal_dir.as_ref().map(|dir| StoreConfig {
            path: dir.clone(),
            ..StoreConfig::default()
        })
    }
}
