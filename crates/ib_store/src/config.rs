use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

fn default_deleted_retention_ms() -> i64 {
    10 * 60 * 1000
}

/// Where the inbox lives and how long deleted message ids are remembered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub database_path: PathBuf,
    pub attachments_dir: PathBuf,
    #[serde(default = "default_deleted_retention_ms")]
    pub deleted_retention_ms: i64,
}

impl StoreConfig {
    /// `inbox.db` and `attachments/` under `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            database_path: dir.join("inbox.db"),
            attachments_dir: dir.join("attachments"),
            deleted_retention_ms: default_deleted_retention_ms(),
        }
    }
}
