//! Queue configuration
//!
//! All fields are defaulted so an empty file (or no file) is valid.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Configuration file name
pub const QUEUE_CONFIG_FILE: &str = "config.json";

/// Default advisory lock timeout, in seconds
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 15;

/// Conveyor queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// Directory holding the task database
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Advisory lock timeout in seconds
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,

    /// Worker command override: program followed by leading arguments.
    /// Defaults to re-invoking the current executable in worker mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_command: Option<Vec<String>>,
}

fn default_lock_timeout_secs() -> u64 {
    DEFAULT_LOCK_TIMEOUT_SECS
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
            worker_command: None,
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;

        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Load configuration, falling back to defaults if the file is missing
    /// or unreadable
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Using default configuration: {}", e);
                Self::default()
            }
        }
    }

    /// The advisory lock timeout as a Duration
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.lock_timeout_secs, 15);
        assert_eq!(config.lock_timeout(), Duration::from_secs(15));
        assert!(config.worker_command.is_none());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: QueueConfig = serde_json::from_str(r#"{"dataDir": "/tmp/q"}"#).unwrap();
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/q")));
        assert_eq!(config.lock_timeout_secs, 15);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = QueueConfig::load_or_default(Path::new("/nonexistent/config.json"));
        assert_eq!(config.lock_timeout_secs, 15);
    }

    #[test]
    fn test_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(QUEUE_CONFIG_FILE);

        let mut config = QueueConfig::new();
        config.lock_timeout_secs = 3;
        config.worker_command = Some(vec!["/usr/bin/conveyor".to_string(), "worker".to_string()]);
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = QueueConfig::load(&path).unwrap();
        assert_eq!(loaded.lock_timeout_secs, 3);
        assert_eq!(
            loaded.worker_command.as_deref(),
            Some(&["/usr/bin/conveyor".to_string(), "worker".to_string()][..])
        );
    }
}
