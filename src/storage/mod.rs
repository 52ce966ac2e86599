//! Replicated entry table.
//!
//! The server's table is authoritative; a client's table mirrors it. Entries
//! live in an arena addressed by local id, with a name index and a wire-id
//! index on the side. Outgoing traffic goes through an [`OutgoingQueue`]
//! (the dispatcher) and is always handed over after the table lock is
//! released.

mod entry;
mod persistence;
mod rpc;
mod table;

pub(crate) use entry::Entry;
pub use entry::EntryInfo;
pub use rpc::RpcOutcome;
pub use table::*;


use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

use crate::network::ConnectionId;
use crate::proto::Message;

/// Where Storage sends messages for the network.
#[cfg_attr(test, automock)]
pub trait OutgoingQueue: Send + Sync {
    /// Queue `msg` on every synchronized connection, or only on `only`,
    /// skipping `except`.
    fn queue_outgoing(
        &self,
        msg: Arc<Message>,
        only: Option<ConnectionId>,
        except: Option<ConnectionId>,
    );
}
