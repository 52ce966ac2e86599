//! NetworkTables Error Hierarchy
//!
//! Defines error types for the replication engine, categorized by layer:
//! wire protocol, transport, persistence and the entry API.
//!
//! Expected runtime conditions (stale updates, RPC timeouts, canceled polls)
//! are never errors; they are reported as values by the APIs that produce them.

use std::path::PathBuf;

use config::ConfigError;

use crate::proto::ValueType;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Infrastructure-level failures (network, wire protocol, persistence)
    #[error(transparent)]
    System(#[from] SystemError),

    /// Configuration loading and validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Caller-visible entry API failures
    #[error(transparent)]
    Entry(#[from] EntryError),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    // Transport layer
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    // Wire protocol
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Persistence layer
    #[error("Storage operation failed: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Message type byte not known to any protocol revision
    #[error("Unknown message type 0x{0:02x}")]
    UnknownMessageType(u8),

    /// Value type byte not known to the negotiated revision
    #[error("Unknown value type 0x{0:02x}")]
    UnknownValueType(u8),

    /// Message only exists in a later protocol revision
    #[error("Message type 0x{msg_type:02x} not supported by protocol revision 0x{proto_rev:04x}")]
    UnsupportedMessage { msg_type: u8, proto_rev: u16 },

    /// Value type only exists in a later protocol revision
    #[error("Value type {value_type:?} not supported by protocol revision 0x{proto_rev:04x}")]
    UnsupportedValue { value_type: ValueType, proto_rev: u16 },

    /// ClearEntries carried a bad magic number
    #[error("Bad clear entries magic 0x{0:08x}")]
    BadClearMagic(u32),

    /// Legacy entry update references an id whose type is unknown
    #[error("Received update for unknown entry id {0}")]
    UnknownEntryId(u16),

    /// String payload was not valid UTF-8
    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    /// Length prefix does not fit the platform or the frame
    #[error("Length prefix overflow")]
    LengthOverflow,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Listening socket could not be bound
    #[error("Failed to bind listener on {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    /// Peer connection attempt failed
    #[error("Socket connect failed error")]
    ConnectError,

    /// Dispatcher was asked to start twice
    #[error("Dispatcher already started")]
    AlreadyStarted,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Disk I/O failures during persistence operations
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// I/O failure with the file that caused it
    #[error("{message}: {path}")]
    PathError {
        path: PathBuf,
        message: &'static str,
        source: std::io::Error,
    },

    /// Persistence file does not start with the expected header line
    #[error("header line mismatch, ignoring rest of file")]
    HeaderMismatch,
}

#[derive(Debug, thiserror::Error)]
pub enum EntryError {
    /// Set against an entry whose established type differs
    #[error("Type mismatch for entry '{name}': existing {existing:?}, requested {requested:?}")]
    TypeMismatch {
        name: String,
        existing: ValueType,
        requested: ValueType,
    },

    /// Local id not known to this instance
    #[error("No entry with local id {0}")]
    NotFound(usize),

    /// Operation requires an RPC entry
    #[error("Entry '{0}' is not an RPC entry")]
    NotRpc(String),

    /// RPC definitions may only be created on the server
    #[error("RPC entries can only be created in server mode")]
    RpcRequiresServer,

    /// Poller handle does not exist (never created or already destroyed)
    #[error("No poller with handle {0}")]
    UnknownPoller(usize),
}

// ============== Conversion Implementations ============== //
impl From<NetworkError> for Error {
    fn from(e: NetworkError) -> Self {
        Error::System(SystemError::Network(e))
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::System(SystemError::Protocol(e))
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Error::System(SystemError::Storage(e))
    }
}
