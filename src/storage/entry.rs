use std::sync::Arc;

use crate::constants::ENTRY_PERSISTENT;
use crate::constants::UNASSIGNED_ID;
use crate::notifier::ListenerHandle;
use crate::proto::SequenceNumber;
use crate::proto::Value;
use crate::proto::ValueType;
use crate::utils::time::get_now_as_micros;

/// One table row. Lives in the storage arena at index `local_id` for the
/// lifetime of the process; a row without value is deleted.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub(crate) name: String,
    pub(crate) value: Option<Arc<Value>>,
    pub(crate) flags: u8,
    pub(crate) id: u16,
    pub(crate) local_id: usize,
    pub(crate) seq_num: SequenceNumber,
    /// Set once this process wrote the value; decides resend vs accept on
    /// reconnect
    pub(crate) local_write: bool,
    pub(crate) rpc_uid: Option<ListenerHandle>,
    pub(crate) rpc_call_uid: u16,
    pub(crate) last_change: u64,
}

impl Entry {
    pub(crate) fn new(
        name: &str,
        local_id: usize,
    ) -> Self {
        Self {
            name: name.to_string(),
            value: None,
            flags: 0,
            id: UNASSIGNED_ID,
            local_id,
            seq_num: SequenceNumber::default(),
            local_write: false,
            rpc_uid: None,
            rpc_call_uid: 0,
            last_change: 0,
        }
    }

    pub(crate) fn is_persistent(&self) -> bool {
        self.flags & ENTRY_PERSISTENT != 0
    }

    pub(crate) fn value_type(&self) -> ValueType {
        self.value
            .as_ref()
            .map(|v| v.value_type())
            .unwrap_or(ValueType::Unassigned)
    }

    /// Replace the value, returning the previous one.
    pub(crate) fn replace_value(
        &mut self,
        value: Arc<Value>,
    ) -> Option<Arc<Value>> {
        self.last_change = get_now_as_micros();
        self.value.replace(value)
    }

    pub(crate) fn info(&self) -> EntryInfo {
        EntryInfo {
            entry: self.local_id,
            name: self.name.clone(),
            value_type: self.value_type(),
            flags: self.flags,
            last_change: self.last_change,
        }
    }
}

/// Public snapshot of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Local id
    pub entry: usize,
    pub name: String,
    pub value_type: ValueType,
    pub flags: u8,
    /// Microseconds since the epoch of the last value change
    pub last_change: u64,
}
