// -
// Protocol revisions

/// Legacy protocol revision
pub const PROTO_REV_2_0: u16 = 0x0200;
/// Current protocol revision; the highest this crate speaks
pub const PROTO_REV_3_0: u16 = 0x0300;

/// Wire id marking an entry the server has not assigned yet
pub const UNASSIGNED_ID: u16 = 0xFFFF;

/// Magic carried by ClearEntries
pub(crate) const CLEAR_ALL_MAGIC: u32 = 0xD06C_B27A;

/// Default TCP port
pub const DEFAULT_PORT: u16 = 1735;

// -
// Entry flags

pub const ENTRY_PERSISTENT: u8 = 0x01;

// -
// Entry notification flags

pub const NOTIFY_IMMEDIATE: u32 = 0x01;
pub const NOTIFY_LOCAL: u32 = 0x02;
pub const NOTIFY_NEW: u32 = 0x04;
pub const NOTIFY_DELETE: u32 = 0x08;
pub const NOTIFY_UPDATE: u32 = 0x10;
pub const NOTIFY_FLAGS: u32 = 0x20;

// -
// Network mode bits

pub const NET_MODE_NONE: u32 = 0x00;
pub const NET_MODE_SERVER: u32 = 0x01;
pub const NET_MODE_CLIENT: u32 = 0x02;
pub const NET_MODE_STARTING: u32 = 0x04;
pub const NET_MODE_FAILURE: u32 = 0x08;

// -
// Dispatcher timing

pub(crate) const MIN_UPDATE_RATE_MS: u64 = 10;
pub(crate) const MAX_UPDATE_RATE_MS: u64 = 1000;

// -
// Persistence

pub(crate) const PERSISTENT_HEADER: &str = "[NetworkTables Storage 3.0]";
