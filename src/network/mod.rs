//! Per-connection transport.
//!
//! Each TCP stream is owned by one [`NetworkConnection`] running a read task
//! and a write task. The read task first runs the role's [`Handshake`], then
//! forwards every decoded message to an [`IncomingHandler`] (Storage). The
//! write task drains batches posted by the dispatcher tick.

mod connection;
mod connector;
mod outgoing;

pub use connection::*;
pub use connector::*;
pub(crate) use outgoing::*;

#[cfg(test)]
mod connection_test;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::proto::Message;

/// Process-unique connection id.
pub type ConnectionId = u32;

/// Connection lifecycle. `Dead` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Init,
    Handshake,
    Synchronized,
    Active,
    Dead,
}

impl fmt::Display for ConnectionState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let s = match self {
            ConnectionState::Created => "created",
            ConnectionState::Init => "init",
            ConnectionState::Handshake => "handshake",
            ConnectionState::Synchronized => "synchronized",
            ConnectionState::Active => "active",
            ConnectionState::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// Snapshot of a connection, as handed to applications.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub remote_id: String,
    pub remote_ip: String,
    pub remote_port: u16,
    /// Microseconds since the epoch of the last received message
    pub last_update: u64,
    pub protocol_version: u16,
}

/// What Storage and the handshakes need from a connection.
#[cfg_attr(test, automock)]
pub trait ConnectionHandle: Send + Sync {
    fn uid(&self) -> ConnectionId;

    fn proto_rev(&self) -> u16;

    fn set_proto_rev(
        &self,
        proto_rev: u16,
    );

    fn state(&self) -> ConnectionState;

    /// Move to `state`; ignored once dead.
    fn set_state(
        &self,
        state: ConnectionState,
    );

    fn remote_id(&self) -> String;

    fn set_remote_id(
        &self,
        remote_id: String,
    );

    fn info(&self) -> ConnectionInfo;

    /// Add to the pending batch, coalescing with earlier entry messages.
    fn queue_outgoing(
        &self,
        msg: Arc<Message>,
    );
}

/// Message source/sink used while a handshake owns the stream.
#[async_trait]
pub trait MessageChannel: Send {
    /// Next decoded message; `None` when the peer disconnected or the
    /// stream failed.
    async fn next_message(&mut self) -> Option<Arc<Message>>;

    /// Send immediately, bypassing the coalescing queue.
    fn send(
        &mut self,
        msgs: Vec<Arc<Message>>,
    );
}

/// Client or server bootstrap run on a fresh stream.
#[async_trait]
pub trait Handshake: Send + Sync {
    async fn handshake(
        &self,
        conn: &Arc<dyn ConnectionHandle>,
        channel: &mut dyn MessageChannel,
    ) -> bool;
}

/// Receives every message decoded after a successful handshake.
pub type IncomingHandler = Arc<dyn Fn(Arc<Message>, &Arc<dyn ConnectionHandle>) + Send + Sync>;
