//! Client-side stream factories.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::select_ok;
use futures::FutureExt;
#[cfg(test)]
use mockall::automock;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::errors::NetworkError;

/// Produces a connected stream for the client connect loop, or `None` when
/// no candidate answered.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Option<TcpStream>;
}

/// One host and port.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
}

impl TcpConnector {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        timeout: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Option<TcpStream> {
        match connect_one(&self.host, self.port, self.timeout).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                debug!(host = %self.host, port = self.port, error = %e, "connect failed");
                None
            }
        }
    }
}

/// Several candidates tried in parallel; the first to connect wins and the
/// others are dropped.
#[derive(Debug, Clone)]
pub struct ParallelConnector {
    pub servers: Vec<(String, u16)>,
    pub timeout: Duration,
}

impl ParallelConnector {
    pub fn new(
        servers: Vec<(String, u16)>,
        timeout: Duration,
    ) -> Self {
        Self { servers, timeout }
    }

    /// Candidates for an FRC team number.
    pub fn for_team(
        team: u32,
        port: u16,
        timeout: Duration,
    ) -> Self {
        Self::new(team_servers(team, port), timeout)
    }
}

#[async_trait]
impl Connector for ParallelConnector {
    async fn connect(&self) -> Option<TcpStream> {
        if self.servers.is_empty() {
            return None;
        }
        let attempts = self
            .servers
            .iter()
            .map(|(host, port)| connect_one(host, *port, self.timeout).boxed());
        match select_ok(attempts).await {
            Ok((stream, _rest)) => Some(stream),
            Err(e) => {
                debug!(candidates = self.servers.len(), error = %e, "no server candidate answered");
                None
            }
        }
    }
}

/// Addresses a robot controller for `team` may be reachable at.
pub fn team_servers(
    team: u32,
    port: u16,
) -> Vec<(String, u16)> {
    vec![
        (format!("10.{}.{}.2", team / 100, team % 100), port),
        ("172.22.11.2".to_string(), port),
        (format!("roboRIO-{team}-FRC.local"), port),
        (format!("roboRIO-{team}-FRC.lan"), port),
        (format!("roboRIO-{team}-FRC.frc-field.local"), port),
    ]
}

async fn connect_one(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, NetworkError> {
    match timeout(connect_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(NetworkError::Io(e)),
        Err(_) => Err(NetworkError::ConnectError),
    }
}
