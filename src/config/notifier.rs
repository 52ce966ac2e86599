use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Notification hub settings
///
/// Every hub (entry, connection, RPC, log) has one unbounded producer queue
/// drained by its own thread. Pollers, however, hold events until the
/// application calls `poll`, so their queues are bounded: when a poller is
/// full the oldest event is discarded and a warning is logged.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NotifierConfig {
    /// Maximum events buffered per poller
    ///
    /// Default: 1024
    #[serde(default = "default_poller_queue_size")]
    pub poller_queue_size: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            poller_queue_size: default_poller_queue_size(),
        }
    }
}

impl NotifierConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poller_queue_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "poller_queue_size must be greater than 0".into(),
            )));
        }
        Ok(())
    }
}

fn default_poller_queue_size() -> usize {
    1024
}
