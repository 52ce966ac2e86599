//! Connection orchestration.
//!
//! The [`Dispatcher`] owns every [`NetworkConnection`](crate::network::NetworkConnection)
//! and runs three kinds of task:
//! - an accept loop (server) or a connect/retry loop (client)
//! - the dispatch loop, posting outgoing batches every update period,
//!   requesting a client reconnect when the connection died, and saving the
//!   persistent file when serving
//! - per connection, the [`ClientHandshake`] or [`ServerHandshake`] that
//!   bootstraps the table before live traffic flows
//!
//! Storage is reached only through [`StorageHandle`].

mod dispatch;
mod handshake;

pub use dispatch::*;
pub use handshake::*;

#[cfg(test)]
mod handshake_test;

use std::path::Path;
use std::sync::Arc;
use std::sync::Weak;

use crate::network::ConnectionHandle;
use crate::proto::Message;
use crate::proto::ValueType;
use crate::storage::OutgoingQueue;
use crate::storage::Storage;
use crate::Result;

/// What the dispatcher and the handshakes need from the entry table.
pub trait StorageHandle: Send + Sync {
    fn set_dispatcher(
        &self,
        dispatcher: Weak<dyn OutgoingQueue>,
        server: bool,
    );

    fn clear_dispatcher(&self);

    fn get_message_entry_type(
        &self,
        id: u16,
    ) -> Option<ValueType>;

    fn process_incoming(
        &self,
        msg: Arc<Message>,
        conn: &Arc<dyn ConnectionHandle>,
    );

    fn get_initial_assignments(
        &self,
        conn: &dyn ConnectionHandle,
    ) -> Vec<Arc<Message>>;

    fn apply_initial_assignments(
        &self,
        conn: &dyn ConnectionHandle,
        msgs: Vec<Arc<Message>>,
    ) -> Vec<Arc<Message>>;

    fn save_persistent(
        &self,
        path: &Path,
        periodic: bool,
    ) -> Result<()>;

    fn load_persistent(
        &self,
        path: &Path,
        warn: &mut dyn FnMut(usize, &str),
    ) -> Result<()>;
}

impl StorageHandle for Storage {
    fn set_dispatcher(
        &self,
        dispatcher: Weak<dyn OutgoingQueue>,
        server: bool,
    ) {
        Storage::set_dispatcher(self, dispatcher, server)
    }

    fn clear_dispatcher(&self) {
        Storage::clear_dispatcher(self)
    }

    fn get_message_entry_type(
        &self,
        id: u16,
    ) -> Option<ValueType> {
        Storage::get_message_entry_type(self, id)
    }

    fn process_incoming(
        &self,
        msg: Arc<Message>,
        conn: &Arc<dyn ConnectionHandle>,
    ) {
        Storage::process_incoming(self, msg, conn)
    }

    fn get_initial_assignments(
        &self,
        conn: &dyn ConnectionHandle,
    ) -> Vec<Arc<Message>> {
        Storage::get_initial_assignments(self, conn)
    }

    fn apply_initial_assignments(
        &self,
        conn: &dyn ConnectionHandle,
        msgs: Vec<Arc<Message>>,
    ) -> Vec<Arc<Message>> {
        Storage::apply_initial_assignments(self, conn, msgs)
    }

    fn save_persistent(
        &self,
        path: &Path,
        periodic: bool,
    ) -> Result<()> {
        Storage::save_persistent(self, path, periodic)
    }

    fn load_persistent(
        &self,
        path: &Path,
        warn: &mut dyn FnMut(usize, &str),
    ) -> Result<()> {
        Storage::load_persistent(self, path, warn)
    }
}
