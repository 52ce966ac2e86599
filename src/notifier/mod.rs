//! Notification fabric: one generic hub, four categories.

mod connection_notifier;
mod entry_notifier;
mod hub;
mod log_notifier;
mod rpc_server;

pub use connection_notifier::*;
pub use entry_notifier::*;
pub use hub::*;
pub use log_notifier::*;
pub use rpc_server::*;

#[cfg(test)]
mod entry_notifier_test;
#[cfg(test)]
mod hub_test;
