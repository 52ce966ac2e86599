use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::DEFAULT_PORT;
use crate::constants::MAX_UPDATE_RATE_MS;
use crate::constants::MIN_UPDATE_RATE_MS;
use crate::Error;
use crate::Result;

/// Which side of the protocol this process plays.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    Server,
    Client,
}

/// Transport and dispatch timing parameters
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NetworkConfig {
    #[serde(default)]
    pub mode: NetworkMode,

    /// Address the server binds to
    #[serde(default = "default_listen_address")]
    pub listen_address: IpAddr,

    /// Port the server listens on and clients connect to
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client mode: candidate server hosts, tried in parallel
    #[serde(default)]
    pub server_addresses: Vec<String>,

    /// Client mode: derive candidate hosts from a team number instead
    #[serde(default)]
    pub team: Option<u32>,

    /// Dispatch tick, clamped to 10..=1000 ms
    #[serde(default = "default_update_rate_ms")]
    pub update_rate_ms: u64,

    /// Client pause between connect attempts
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    /// Per-candidate TCP connect timeout
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Idle interval after which a client sends a keep-alive
    #[serde(default = "default_keep_alive_interval_ms")]
    pub keep_alive_interval_ms: u64,

    /// Minimum spacing between explicit flushes
    #[serde(default = "default_min_flush_interval_ms")]
    pub min_flush_interval_ms: u64,

    #[serde(default = "default_tcp_nodelay")]
    pub tcp_nodelay: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mode: NetworkMode::default(),
            listen_address: default_listen_address(),
            port: default_port(),
            server_addresses: vec![],
            team: None,
            update_rate_ms: default_update_rate_ms(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            keep_alive_interval_ms: default_keep_alive_interval_ms(),
            min_flush_interval_ms: default_min_flush_interval_ms(),
            tcp_nodelay: default_tcp_nodelay(),
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 && self.mode == NetworkMode::Client {
            return Err(Error::Config(ConfigError::Message(
                "port cannot be 0 in client mode".into(),
            )));
        }

        if !(MIN_UPDATE_RATE_MS..=MAX_UPDATE_RATE_MS).contains(&self.update_rate_ms) {
            return Err(Error::Config(ConfigError::Message(format!(
                "update_rate_ms must be within {}..={} (got {})",
                MIN_UPDATE_RATE_MS, MAX_UPDATE_RATE_MS, self.update_rate_ms
            ))));
        }

        if self.connect_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "connect_timeout_ms must be greater than 0".into(),
            )));
        }

        if self.mode == NetworkMode::Client
            && self.server_addresses.is_empty()
            && self.team.is_none()
        {
            return Err(Error::Config(ConfigError::Message(
                "client mode requires server_addresses or team".into(),
            )));
        }

        Ok(())
    }

    pub fn update_rate(&self) -> Duration {
        Duration::from_millis(self.update_rate_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn min_flush_interval(&self) -> Duration {
        Duration::from_millis(self.min_flush_interval_ms)
    }
}

fn default_listen_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_update_rate_ms() -> u64 {
    100
}
fn default_reconnect_backoff_ms() -> u64 {
    250
}
fn default_connect_timeout_ms() -> u64 {
    1000
}
fn default_keep_alive_interval_ms() -> u64 {
    1000
}
fn default_min_flush_interval_ms() -> u64 {
    10
}
fn default_tcp_nodelay() -> bool {
    true
}
