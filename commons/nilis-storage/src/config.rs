use serde::{Deserialize, Serialize};

/// Configuration for the storage engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    pub path: String,
    /// Commit durably before a write returns.
    pub sync_writes: bool,
}

impl StorageConfig {
    pub fn new<P: Into<String>>(path: P) -> Self {
        Self {
            path: path.into(),
            sync_writes: true,
        }
    }

    /// Enable or disable synchronous commits
    pub fn with_sync_writes(mut self, enabled: bool) -> Self {
        self.sync_writes = enabled;
        self
    }
}
