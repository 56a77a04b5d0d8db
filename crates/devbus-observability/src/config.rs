//! Logging settings consumed by [`crate::init_logging`]

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where and how much to log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSettings {
    /// Default level for targets without a debug flag
    pub level: String,
    /// Write rolling files under `log_dir` (needs the `file-logging` feature)
    pub file_logging: bool,
    pub log_dir: PathBuf,
    /// Remove run folders older than this many days
    pub retention_days: u64,
    /// Keep at most this many run folders
    pub retention_runs: usize,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_logging: false,
            log_dir: PathBuf::from("./logs"),
            retention_days: 30,
            retention_runs: 10,
        }
    }
}

impl LogSettings {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = log_dir.into();
        self.file_logging = true;
        self
    }
}
