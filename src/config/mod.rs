//! Configuration management for a NetworkTables instance.
//!
//! Sources are merged with priority (later overrides earlier):
//! 1. Default values (hardcoded)
//! 2. Config file named by the `CONFIG_PATH` environment variable
//! 3. Environment variables prefixed `NT__` (e.g. `NT__NETWORK__PORT=1736`)

mod network;
mod notifier;
mod persistence;
pub use network::*;
pub use notifier::*;
pub use persistence::*;


//---
use std::env;
use std::path::PathBuf;

use config::Config;
use config::ConfigError;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Serialize, Deserialize, Clone, Default)]
pub struct NtConfig {
    /// Identity announced to peers during the handshake
    #[serde(default)]
    pub identity: String,

    /// Directory for the binary's log file; stderr only when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub notifier: NotifierConfig,
}

impl std::fmt::Debug for NtConfig {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("NtConfig")
            .field("identity", &self.identity)
            .field("network", &self.network)
            .field("persistence", &self.persistence)
            .finish_non_exhaustive()
    }
}

impl NtConfig {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// Callers must call [`NtConfig::validate`] before using the result.
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("NT")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Applies an additional file on top of the current values; environment
    /// variables keep the highest priority.
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("NT")
                    .separator("__")
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validates every section and returns the validated instance.
    pub fn validate(self) -> Result<Self> {
        if self.identity.len() > u16::MAX as usize {
            return Err(Error::Config(ConfigError::Message(
                "identity is too long".into(),
            )));
        }
        self.network.validate()?;
        self.persistence.validate()?;
        self.notifier.validate()?;
        Ok(self)
    }
}
