use std::sync::Arc;

use super::SequenceNumber;
use super::Value;
use crate::constants::UNASSIGNED_ID;

/// Wire message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    KeepAlive = 0x00,
    ClientHello = 0x01,
    ProtoUnsup = 0x02,
    ServerHelloDone = 0x03,
    ServerHello = 0x04,
    ClientHelloDone = 0x05,
    EntryAssign = 0x10,
    EntryUpdate = 0x11,
    FlagsUpdate = 0x12,
    EntryDelete = 0x13,
    ClearEntries = 0x14,
    ExecuteRpc = 0x20,
    RpcResponse = 0x21,
}

impl MessageType {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x00 => MessageType::KeepAlive,
            0x01 => MessageType::ClientHello,
            0x02 => MessageType::ProtoUnsup,
            0x03 => MessageType::ServerHelloDone,
            0x04 => MessageType::ServerHello,
            0x05 => MessageType::ClientHelloDone,
            0x10 => MessageType::EntryAssign,
            0x11 => MessageType::EntryUpdate,
            0x12 => MessageType::FlagsUpdate,
            0x13 => MessageType::EntryDelete,
            0x14 => MessageType::ClearEntries,
            0x20 => MessageType::ExecuteRpc,
            0x21 => MessageType::RpcResponse,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Types introduced by protocol 3.0.
    pub fn requires_rev3(self) -> bool {
        matches!(
            self,
            MessageType::ServerHello
                | MessageType::ClientHelloDone
                | MessageType::FlagsUpdate
                | MessageType::EntryDelete
                | MessageType::ClearEntries
                | MessageType::ExecuteRpc
                | MessageType::RpcResponse
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::KeepAlive => "keep_alive",
            MessageType::ClientHello => "client_hello",
            MessageType::ProtoUnsup => "proto_unsup",
            MessageType::ServerHelloDone => "server_hello_done",
            MessageType::ServerHello => "server_hello",
            MessageType::ClientHelloDone => "client_hello_done",
            MessageType::EntryAssign => "entry_assign",
            MessageType::EntryUpdate => "entry_update",
            MessageType::FlagsUpdate => "flags_update",
            MessageType::EntryDelete => "entry_delete",
            MessageType::ClearEntries => "clear_entries",
            MessageType::ExecuteRpc => "execute_rpc",
            MessageType::RpcResponse => "rpc_response",
        }
    }
}

/// One wire message. Immutable once built; shared between connections as
/// `Arc<Message>`.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    ClientHello {
        proto_rev: u16,
        identity: String,
    },
    ProtoUnsup {
        proto_rev: u16,
    },
    ServerHelloDone,
    ServerHello {
        flags: u8,
        identity: String,
    },
    ClientHelloDone,
    EntryAssign {
        name: String,
        id: u16,
        seq_num: SequenceNumber,
        value: Arc<Value>,
        flags: u8,
    },
    EntryUpdate {
        id: u16,
        seq_num: SequenceNumber,
        value: Arc<Value>,
    },
    FlagsUpdate {
        id: u16,
        flags: u8,
    },
    EntryDelete {
        id: u16,
    },
    ClearEntries,
    ExecuteRpc {
        id: u16,
        call_uid: u16,
        params: Vec<u8>,
    },
    RpcResponse {
        id: u16,
        call_uid: u16,
        result: Vec<u8>,
    },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::KeepAlive => MessageType::KeepAlive,
            Message::ClientHello { .. } => MessageType::ClientHello,
            Message::ProtoUnsup { .. } => MessageType::ProtoUnsup,
            Message::ServerHelloDone => MessageType::ServerHelloDone,
            Message::ServerHello { .. } => MessageType::ServerHello,
            Message::ClientHelloDone => MessageType::ClientHelloDone,
            Message::EntryAssign { .. } => MessageType::EntryAssign,
            Message::EntryUpdate { .. } => MessageType::EntryUpdate,
            Message::FlagsUpdate { .. } => MessageType::FlagsUpdate,
            Message::EntryDelete { .. } => MessageType::EntryDelete,
            Message::ClearEntries => MessageType::ClearEntries,
            Message::ExecuteRpc { .. } => MessageType::ExecuteRpc,
            Message::RpcResponse { .. } => MessageType::RpcResponse,
        }
    }

    pub fn is(
        &self,
        kind: MessageType,
    ) -> bool {
        self.message_type() == kind
    }

    /// Wire id for entry-scoped messages.
    pub fn entry_id(&self) -> Option<u16> {
        match self {
            Message::EntryAssign { id, .. }
            | Message::EntryUpdate { id, .. }
            | Message::FlagsUpdate { id, .. }
            | Message::EntryDelete { id }
            | Message::ExecuteRpc { id, .. }
            | Message::RpcResponse { id, .. } => Some(*id),
            _ => None,
        }
    }

    pub fn entry_assign(
        name: impl Into<String>,
        id: u16,
        seq_num: SequenceNumber,
        value: Arc<Value>,
        flags: u8,
    ) -> Arc<Self> {
        Arc::new(Message::EntryAssign {
            name: name.into(),
            id,
            seq_num,
            value,
            flags,
        })
    }

    /// Id allocation request sent by a client for a locally created entry.
    pub fn unassigned_entry(
        name: impl Into<String>,
        seq_num: SequenceNumber,
        value: Arc<Value>,
        flags: u8,
    ) -> Arc<Self> {
        Self::entry_assign(name, UNASSIGNED_ID, seq_num, value, flags)
    }

    pub fn entry_update(
        id: u16,
        seq_num: SequenceNumber,
        value: Arc<Value>,
    ) -> Arc<Self> {
        Arc::new(Message::EntryUpdate { id, seq_num, value })
    }

    pub fn flags_update(
        id: u16,
        flags: u8,
    ) -> Arc<Self> {
        Arc::new(Message::FlagsUpdate { id, flags })
    }

    pub fn entry_delete(id: u16) -> Arc<Self> {
        Arc::new(Message::EntryDelete { id })
    }

    pub fn clear_entries() -> Arc<Self> {
        Arc::new(Message::ClearEntries)
    }

    pub fn execute_rpc(
        id: u16,
        call_uid: u16,
        params: Vec<u8>,
    ) -> Arc<Self> {
        Arc::new(Message::ExecuteRpc {
            id,
            call_uid,
            params,
        })
    }

    pub fn rpc_response(
        id: u16,
        call_uid: u16,
        result: Vec<u8>,
    ) -> Arc<Self> {
        Arc::new(Message::RpcResponse {
            id,
            call_uid,
            result,
        })
    }
}
