use std::path::PathBuf;
use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Persistent entry file settings (server mode only)
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PersistenceConfig {
    /// File loaded at server start and saved periodically while dirty.
    /// `None` disables persistence.
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Period of the background save check
    #[serde(default = "default_save_interval_ms")]
    pub save_interval_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            file: None,
            save_interval_ms: default_save_interval_ms(),
        }
    }
}

impl PersistenceConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(file) = &self.file {
            if file.as_os_str().is_empty() {
                return Err(Error::Config(ConfigError::Message(
                    "persistence file path cannot be empty".into(),
                )));
            }
        }
        if self.save_interval_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "save_interval_ms must be greater than 0".into(),
            )));
        }
        Ok(())
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.save_interval_ms)
    }
}

fn default_save_interval_ms() -> u64 {
    1000
}
