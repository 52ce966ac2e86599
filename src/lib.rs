//! # ntables
//!
//! A network-synchronized key-value table. One process serves, any number of
//! clients connect, and every client's view of the table converges to the
//! server's over the NetworkTables 2.0/3.0 wire protocol.
//!
//! Start from [`NtInstance`]; the lower layers ([`Storage`], [`Dispatcher`],
//! the notification hubs) are public for embedding and testing.

pub mod constants;
mod config;
mod dispatcher;
mod errors;
mod instance;
mod metrics;
mod network;
mod notifier;
mod proto;
mod storage;
pub mod utils;

pub use self::config::*;
pub use dispatcher::*;
pub use errors::*;
pub use instance::*;
pub use metrics::*;
pub use network::*;
pub use notifier::*;
pub use proto::*;
pub use storage::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
