//! Application-facing entry point.
//!
//! An [`NtInstance`] wires one [`Storage`](crate::storage::Storage), the four
//! notification hubs and at most one live
//! [`Dispatcher`](crate::dispatcher::Dispatcher) together. Several instances
//! can coexist in one process; nothing here is global.
//!
//! ## Example
//! ```ignore
//! let instance = NtInstance::new(NtConfig::new()?.validate()?);
//! instance.start().await?;
//! instance.set_entry_value("/robot/speed", Value::Double(1.5))?;
//! instance.stop().await;
//! ```

mod instance;

pub use instance::*;
